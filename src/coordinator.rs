//! One slot's generate/regenerate lifecycle.
//!
//! A coordinator owns a single [`Slot`]: it moves the slot through its states,
//! feeds stream deltas into the slot output, records usage and answers to the
//! slot's cancellation token. Slots never share mutable state with each other,
//! so a failure or abort in one leaves its siblings untouched.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{GenerationRequest, ModelBackend};
use crate::cancel::{CancellationController, IssuedToken};
use crate::error::{Error, Result};
use crate::models::{ComparisonEvent, GenerationOutcome, Slot, SlotKey, SlotStatus};
use crate::prompts::{RegenerateModifier, append_modifiers};
use crate::stream::{StreamConsumer, StreamOutcome};
use crate::usage::UsageAggregator;

/// Model and optional prompt variant for one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub model: String,
    /// Overrides the comparison-wide system prompt for this slot only
    pub system_prompt: Option<String>,
}

impl SlotSpec {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// The prompt a generation was started with; regenerate reuses it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptInput {
    pub prompt: String,
    pub system_prompt: Option<String>,
}

impl PromptInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }
}

#[derive(Debug)]
struct SlotState {
    slot: Slot,
    last_prompt: Option<PromptInput>,
    /// Token id of the generation allowed to write into this slot
    current: Option<u64>,
}

/// A generation that has claimed its slot but not opened its stream yet
pub(crate) struct PendingStream {
    issued: IssuedToken,
    request: GenerationRequest,
}

/// Holds one slot's lock so several slots can be read alongside the usage ledger
pub(crate) struct SlotGuard<'a>(MutexGuard<'a, SlotState>);

impl SlotGuard<'_> {
    pub(crate) fn slot(&self) -> &Slot {
        &self.0.slot
    }
}

pub struct GenerationCoordinator {
    index: usize,
    spec: SlotSpec,
    state: Mutex<SlotState>,
    backend: Arc<dyn ModelBackend>,
    usage: Arc<UsageAggregator>,
    cancels: Arc<CancellationController>,
    events: broadcast::Sender<ComparisonEvent>,
}

impl GenerationCoordinator {
    pub fn new(
        index: usize,
        spec: SlotSpec,
        backend: Arc<dyn ModelBackend>,
        usage: Arc<UsageAggregator>,
        cancels: Arc<CancellationController>,
        events: broadcast::Sender<ComparisonEvent>,
    ) -> Self {
        let slot = Slot::new(index, spec.model.clone());
        Self {
            index,
            spec,
            state: Mutex::new(SlotState {
                slot,
                last_prompt: None,
                current: None,
            }),
            backend,
            usage,
            cancels,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn guard(&self) -> SlotGuard<'_> {
        SlotGuard(self.lock())
    }

    fn key(&self) -> SlotKey {
        SlotKey::Model(self.index)
    }

    fn emit(&self, event: ComparisonEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_status(&self, status: SlotStatus) {
        self.emit(ComparisonEvent::SlotStatus {
            slot_index: self.index,
            status,
        });
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn model(&self) -> &str {
        &self.spec.model
    }

    pub fn snapshot(&self) -> Slot {
        self.lock().slot.clone()
    }

    pub fn status(&self) -> SlotStatus {
        self.lock().slot.status.clone()
    }

    /// Start a fresh generation.
    ///
    /// Allowed from `Idle`, `Errored` and `Aborted`. A streamed slot must be
    /// regenerated instead, and an in-flight slot rejects the call.
    pub async fn generate(&self, input: PromptInput) -> Result<GenerationOutcome> {
        let pending = self.begin_generate(input)?;
        self.stream(pending).await
    }

    pub(crate) fn begin_generate(&self, input: PromptInput) -> Result<PendingStream> {
        let pending = {
            let mut state = self.lock();
            match &state.slot.status {
                status if status.is_in_flight() => return Err(Error::SlotBusy(self.index)),
                SlotStatus::Streamed => {
                    return Err(Error::InvalidTransition {
                        slot: self.index,
                        operation: "generate",
                        status: SlotStatus::Streamed,
                    });
                }
                _ => {}
            }
            let system_prompt = self.spec.system_prompt.clone().or(input.system_prompt.clone());
            state.last_prompt = Some(input.clone());
            state.slot.output.clear();
            state.slot.status = SlotStatus::Generating;
            self.claim(&mut state, input.prompt, system_prompt)
        };
        self.emit_status(SlotStatus::Generating);
        Ok(pending)
    }

    /// Re-run this slot with its last prompt, optionally tightened or expanded
    /// by a modifier and a free-form instruction. Modifiers apply to the
    /// original prompt and never pile up across regenerations.
    pub async fn regenerate(
        &self,
        modifier: Option<RegenerateModifier>,
        custom_instruction: Option<&str>,
    ) -> Result<GenerationOutcome> {
        let pending = self.begin_regenerate(modifier, custom_instruction)?;
        self.stream(pending).await
    }

    pub(crate) fn begin_regenerate(
        &self,
        modifier: Option<RegenerateModifier>,
        custom_instruction: Option<&str>,
    ) -> Result<PendingStream> {
        let pending = {
            let mut state = self.lock();
            if state.slot.status.is_in_flight() {
                return Err(Error::SlotBusy(self.index));
            }
            let base = state
                .last_prompt
                .clone()
                .ok_or(Error::MissingPrompt(self.index))?;
            let prompt = append_modifiers(&base.prompt, modifier, custom_instruction);
            let system_prompt = self.spec.system_prompt.clone().or(base.system_prompt);
            state.slot.output.clear();
            state.slot.status = SlotStatus::Regenerating;
            self.claim(&mut state, prompt, system_prompt)
        };
        self.emit_status(SlotStatus::Regenerating);
        info!(slot = self.index, ?modifier, "regenerating");
        Ok(pending)
    }

    /// Issue the slot's token and make it the only generation allowed to write
    fn claim(&self, state: &mut SlotState, prompt: String, system_prompt: Option<String>) -> PendingStream {
        let issued = self.cancels.issue(self.key());
        state.current = Some(issued.id);
        PendingStream {
            issued,
            request: GenerationRequest {
                model: self.spec.model.clone(),
                prompt,
                system_prompt,
            },
        }
    }

    /// Abort the in-flight call for this slot. Returns false when idle.
    pub fn cancel(&self) -> bool {
        self.cancels.cancel(self.key())
    }

    /// Back to `Idle` with no output and no remembered prompt.
    ///
    /// A generation still running from before the reset can no longer write
    /// into the slot or its usage.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.current = None;
            self.cancel();
            state.slot = Slot::new(self.index, self.spec.model.clone());
            state.last_prompt = None;
        }
        self.emit_status(SlotStatus::Idle);
    }

    /// Clear output and status before a new comparison run, keeping usage
    pub(crate) fn prepare_run(&self) -> Result<()> {
        let mut state = self.lock();
        if state.slot.status.is_in_flight() {
            return Err(Error::SlotBusy(self.index));
        }
        state.slot.status = SlotStatus::Idle;
        state.slot.output.clear();
        Ok(())
    }

    pub(crate) async fn stream(&self, pending: PendingStream) -> Result<GenerationOutcome> {
        let PendingStream { issued, request } = pending;
        debug!(slot = self.index, model = %request.model, "opening stream");

        let opened = tokio::select! {
            biased;
            _ = issued.token.cancelled() => None,
            result = self.backend.open_stream(request) => Some(result),
        };

        let result = match opened {
            None => Ok(StreamOutcome {
                aborted: true,
                ..StreamOutcome::default()
            }),
            Some(Err(err)) => Err(err),
            Some(Ok(stream)) => {
                StreamConsumer::new()
                    .run(stream, &issued.token, |delta| self.append(issued.id, delta))
                    .await
            }
        };

        self.cancels.release(self.key(), issued.id);
        self.finish(issued.id, result)
    }

    fn append(&self, id: u64, delta: &str) {
        {
            let mut state = self.lock();
            if state.current != Some(id) {
                return;
            }
            state.slot.output.push_str(delta);
        }
        self.emit(ComparisonEvent::Delta {
            slot_index: self.index,
            text: delta.to_string(),
        });
    }

    fn finish(&self, id: u64, result: Result<StreamOutcome>) -> Result<GenerationOutcome> {
        let mut state = self.lock();
        if state.current != Some(id) {
            drop(state);
            debug!(slot = self.index, "discarding superseded generation");
            // Nothing from a superseded generation reaches the slot or the ledger
            return result.map(|outcome| GenerationOutcome {
                slot_index: self.index,
                output: String::new(),
                usage: outcome.usage,
                aborted: true,
            });
        }
        state.current = None;

        match result {
            Ok(outcome) => {
                let status = if outcome.aborted {
                    SlotStatus::Aborted
                } else {
                    SlotStatus::Streamed
                };
                // Ledger and slot move together, under the slot lock
                if !outcome.usage.is_zero() {
                    self.usage.add(self.key(), outcome.usage);
                }
                state.slot.usage += outcome.usage;
                state.slot.status = status.clone();
                let output = state.slot.output.clone();
                drop(state);

                info!(
                    slot = self.index,
                    status = %status,
                    total_tokens = outcome.usage.total_tokens,
                    "generation finished"
                );
                self.emit_status(status);

                Ok(GenerationOutcome {
                    slot_index: self.index,
                    output,
                    usage: outcome.usage,
                    aborted: outcome.aborted,
                })
            }
            Err(err) => {
                let status = SlotStatus::Errored {
                    message: err.to_string(),
                };
                state.slot.status = status.clone();
                drop(state);

                warn!(slot = self.index, error = %err, "generation failed");
                self.emit_status(status);
                Err(err)
            }
        }
    }
}
