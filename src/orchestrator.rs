//! Runs N slots side by side and, once they settle, asks the judge for a verdict.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ModelBackend;
use crate::cancel::CancellationController;
use crate::coordinator::{GenerationCoordinator, PromptInput, SlotSpec};
use crate::error::{Error, Result};
use crate::judge::{Candidate, JudgeRequest};
use crate::models::{
    ComparisonEvent, ComparisonResult, ComparisonStatus, GenerationOutcome, JudgeResult,
    ScoringCategory, Slot, SlotKey, slot_label,
};
use crate::prompts::RegenerateModifier;
use crate::usage::{UsageAggregator, UsageSummary};

const EVENT_BUFFER: usize = 1024;

/// What to do when some slots did not stream successfully
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgePolicy {
    /// Any errored or aborted slot skips the judge entirely
    #[default]
    SkipOnAnyFailure,
    /// Judge whichever slots streamed, as long as at least two did
    JudgeSuccessful,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeSettings {
    pub enabled: bool,
    /// Empty means "use the first slot's model"
    pub model: String,
    pub system_prompt: Option<String>,
    pub evaluation_prompt: Option<String>,
    pub categories: Vec<ScoringCategory>,
    pub policy: JudgePolicy,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model: String::new(),
            system_prompt: None,
            evaluation_prompt: None,
            categories: ScoringCategory::defaults(),
            policy: JudgePolicy::default(),
        }
    }
}

impl JudgeSettings {
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for category in &self.categories {
            if !category.is_valid() {
                return Err(Error::Config(format!(
                    "scoring category '{}' has min {} above max {}",
                    category.key, category.min_score, category.max_score
                )));
            }
            if !seen.insert(category.key.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate scoring category '{}'",
                    category.key
                )));
            }
        }
        Ok(())
    }
}

/// Point-in-time copy of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSnapshot {
    pub status: ComparisonStatus,
    pub result: ComparisonResult,
    pub slots: Vec<Slot>,
    pub usage: UsageSummary,
    /// Non-fatal problems (judge failures, skipped judging)
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct ComparisonState {
    status: ComparisonStatus,
    context: String,
    judge_result: Option<JudgeResult>,
    is_judging: bool,
    warnings: Vec<String>,
    /// Bumped by `reset`; runs and judge calls from an older epoch write nothing
    epoch: u64,
}

impl ComparisonState {
    fn new(epoch: u64) -> Self {
        Self {
            status: ComparisonStatus::NotStarted,
            context: String::new(),
            judge_result: None,
            is_judging: false,
            warnings: Vec::new(),
            epoch,
        }
    }

    /// Judged if a verdict survives, otherwise generated without one
    fn settled_status(&self) -> ComparisonStatus {
        if self.judge_result.is_some() {
            ComparisonStatus::Judged
        } else {
            ComparisonStatus::GeneratedNoJudge
        }
    }

    /// Slots may only start while no run owns them and no judge is reading them
    fn ensure_slots_free(&self) -> Result<()> {
        if self.is_judging {
            return Err(Error::JudgeBusy);
        }
        if self.status == ComparisonStatus::Generating {
            return Err(Error::ComparisonBusy);
        }
        Ok(())
    }
}

/// Builder for [`ComparisonOrchestrator`]
///
/// ```ignore
/// let orchestrator = ComparisonBuilder::new(backend)
///     .slot(SlotSpec::new("gpt-4o"))
///     .slot(SlotSpec::new("gpt-4o-mini"))
///     .judge(JudgeSettings::default())
///     .build()?;
/// ```
pub struct ComparisonBuilder {
    backend: Arc<dyn ModelBackend>,
    slots: Vec<SlotSpec>,
    judge: JudgeSettings,
    session: Option<CancellationToken>,
}

impl ComparisonBuilder {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            slots: Vec::new(),
            judge: JudgeSettings::default(),
            session: None,
        }
    }

    pub fn slot(mut self, spec: SlotSpec) -> Self {
        self.slots.push(spec);
        self
    }

    pub fn slots(mut self, specs: impl IntoIterator<Item = SlotSpec>) -> Self {
        self.slots.extend(specs);
        self
    }

    pub fn judge(mut self, settings: JudgeSettings) -> Self {
        self.judge = settings;
        self
    }

    /// Cancelling `token` aborts everything this comparison has in flight
    pub fn session_token(mut self, token: CancellationToken) -> Self {
        self.session = Some(token);
        self
    }

    pub fn build(self) -> Result<ComparisonOrchestrator> {
        let first_model = self
            .slots
            .first()
            .map(|s| s.model.clone())
            .ok_or_else(|| Error::Config("a comparison needs at least one slot".to_string()))?;

        let mut judge = self.judge;
        judge.validate()?;
        if judge.model.trim().is_empty() {
            judge.model = first_model;
        }

        let usage = Arc::new(UsageAggregator::new());
        let cancels = Arc::new(match &self.session {
            Some(token) => CancellationController::with_parent(token),
            None => CancellationController::new(),
        });
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let coordinators = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                GenerationCoordinator::new(
                    index,
                    spec,
                    self.backend.clone(),
                    usage.clone(),
                    cancels.clone(),
                    events.clone(),
                )
            })
            .collect();

        Ok(ComparisonOrchestrator {
            coordinators,
            backend: self.backend,
            usage,
            cancels,
            judge,
            state: Mutex::new(ComparisonState::new(0)),
            events,
        })
    }
}

pub struct ComparisonOrchestrator {
    coordinators: Vec<GenerationCoordinator>,
    backend: Arc<dyn ModelBackend>,
    usage: Arc<UsageAggregator>,
    cancels: Arc<CancellationController>,
    judge: JudgeSettings,
    state: Mutex<ComparisonState>,
    events: broadcast::Sender<ComparisonEvent>,
}

impl ComparisonOrchestrator {
    fn lock(&self) -> MutexGuard<'_, ComparisonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ComparisonEvent) {
        let _ = self.events.send(event);
    }

    /// Record a warning and settle the status, releasing the lock before emitting
    fn settle_with_warning(
        &self,
        mut state: MutexGuard<'_, ComparisonState>,
        message: String,
    ) -> ComparisonStatus {
        let status = state.settled_status();
        state.warnings.push(message.clone());
        state.status = status;
        drop(state);

        warn!("{message}");
        self.emit(ComparisonEvent::Warning(message));
        self.emit(ComparisonEvent::Comparison(status));
        status
    }

    fn coordinator(&self, slot_index: usize) -> Result<&GenerationCoordinator> {
        self.coordinators
            .get(slot_index)
            .ok_or(Error::UnknownSlot(slot_index))
    }

    pub fn slot_count(&self) -> usize {
        self.coordinators.len()
    }

    pub fn judge_settings(&self) -> &JudgeSettings {
        &self.judge
    }

    pub fn status(&self) -> ComparisonStatus {
        self.lock().status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ComparisonEvent> {
        self.events.subscribe()
    }

    /// Generate every slot in parallel with the same prompt, then judge.
    ///
    /// Slot failures are recorded on the slots; the call itself only fails
    /// when the comparison is already busy. A `reset` during the run leaves
    /// the reset state untouched.
    pub async fn run(&self, input: PromptInput, context: impl Into<String>) -> Result<ComparisonSnapshot> {
        let (epoch, pending) = {
            let mut state = self.lock();
            if matches!(
                state.status,
                ComparisonStatus::Generating | ComparisonStatus::Judging
            ) || state.is_judging
            {
                return Err(Error::ComparisonBusy);
            }
            if self.coordinators.iter().any(|c| c.status().is_in_flight()) {
                return Err(Error::ComparisonBusy);
            }
            for coordinator in &self.coordinators {
                coordinator.prepare_run()?;
            }
            let pending = self
                .coordinators
                .iter()
                .map(|c| c.begin_generate(input.clone()))
                .collect::<Result<Vec<_>>>()?;
            state.status = ComparisonStatus::Generating;
            state.context = context.into();
            state.judge_result = None;
            state.warnings.clear();
            (state.epoch, pending)
        };
        self.emit(ComparisonEvent::Comparison(ComparisonStatus::Generating));
        info!(slots = self.coordinators.len(), "starting comparison");

        let streams = self
            .coordinators
            .iter()
            .zip(pending)
            .map(|(coordinator, pending)| coordinator.stream(pending));
        let outcomes = join_all(streams).await;
        for (index, outcome) in outcomes.iter().enumerate() {
            if let Err(err) = outcome {
                warn!(slot = index, error = %err, "slot did not stream");
            }
        }

        if let Err(err) = self.judge_in(epoch).await {
            let state = self.lock();
            // A judge started elsewhere settles the status itself
            if state.epoch == epoch && !state.is_judging {
                self.settle_with_warning(state, format!("Judge error: {err}"));
            }
        }
        Ok(self.snapshot())
    }

    /// Judge the current outputs.
    ///
    /// Rejected while any slot is still generating or another judge call is
    /// running. Judge failures are recorded as warnings and never touch the
    /// slot outputs.
    pub async fn judge(&self) -> Result<ComparisonStatus> {
        let epoch = self.lock().epoch;
        self.judge_in(epoch).await
    }

    /// Judge the stored outputs again without regenerating them
    pub async fn re_judge(&self) -> Result<ComparisonStatus> {
        let epoch = {
            let state = self.lock();
            if state.is_judging {
                return Err(Error::JudgeBusy);
            }
            if !matches!(
                state.status,
                ComparisonStatus::Judged | ComparisonStatus::GeneratedNoJudge
            ) {
                return Err(Error::JudgeNotReady(format!("comparison is {}", state.status)));
            }
            state.epoch
        };
        self.judge_in(epoch).await
    }

    /// Split settled slots into judge candidates, or say why judging is skipped
    fn select_candidates(&self, slots: &[Slot]) -> std::result::Result<Vec<Candidate>, String> {
        let failed: Vec<String> = slots
            .iter()
            .filter(|s| s.status.is_failed())
            .map(|s| format!("{} ({})", slot_label(s.model_index), s.status))
            .collect();

        let candidates: Vec<Candidate> = slots
            .iter()
            .filter(|s| !s.status.is_failed())
            .map(|s| Candidate {
                slot_index: s.model_index,
                output: s.output.clone(),
            })
            .collect();

        match self.judge.policy {
            JudgePolicy::SkipOnAnyFailure if !failed.is_empty() => Err(format!(
                "Judging skipped: slot {} did not stream",
                failed.join(", ")
            )),
            _ if candidates.len() < 2 => Err(format!(
                "Judging skipped: {} successful output(s), need at least two",
                candidates.len()
            )),
            _ => Ok(candidates),
        }
    }

    async fn judge_in(&self, epoch: u64) -> Result<ComparisonStatus> {
        let (candidates, context) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Ok(state.status);
            }
            if state.is_judging {
                return Err(Error::JudgeBusy);
            }

            // Slots only start under this lock, so the outputs read here are
            // the ones the judge sees.
            let slots: Vec<Slot> = self.coordinators.iter().map(|c| c.snapshot()).collect();
            if let Some(pending) = slots.iter().find(|s| !s.status.is_terminal()) {
                return Err(Error::JudgeNotReady(format!(
                    "slot {} is {}",
                    slot_label(pending.model_index),
                    pending.status
                )));
            }

            if !self.judge.enabled {
                state.status = ComparisonStatus::GeneratedNoJudge;
                drop(state);
                self.emit(ComparisonEvent::Comparison(ComparisonStatus::GeneratedNoJudge));
                return Ok(ComparisonStatus::GeneratedNoJudge);
            }

            match self.select_candidates(&slots) {
                Ok(candidates) => {
                    state.is_judging = true;
                    state.status = ComparisonStatus::Judging;
                    (candidates, state.context.clone())
                }
                Err(reason) => return Ok(self.settle_with_warning(state, reason)),
            }
        };
        self.emit(ComparisonEvent::Comparison(ComparisonStatus::Judging));
        self.run_judge(epoch, candidates, context).await
    }

    async fn run_judge(
        &self,
        epoch: u64,
        candidates: Vec<Candidate>,
        context: String,
    ) -> Result<ComparisonStatus> {
        info!(candidates = candidates.len(), model = %self.judge.model, "judging");

        let request = JudgeRequest {
            context,
            candidates: candidates.clone(),
            model: self.judge.model.clone(),
            system_prompt: self.judge.system_prompt.clone(),
            evaluation_prompt: self.judge.evaluation_prompt.clone(),
            categories: self.judge.categories.clone(),
        };

        let issued = self.cancels.issue(SlotKey::Judge);
        let outcome = tokio::select! {
            biased;
            _ = issued.token.cancelled() => None,
            verdict = self.backend.judge(request) => Some(verdict),
        };
        self.cancels.release(SlotKey::Judge, issued.id);

        let mut state = self.lock();
        if state.epoch != epoch {
            debug!("discarding judge result from before a reset");
            return Ok(state.status);
        }
        state.is_judging = false;

        let result = match outcome {
            None => Err(Error::Upstream("judge call cancelled".to_string())),
            Some(Ok(verdict)) => {
                if !verdict.usage.is_zero() {
                    self.usage.add(SlotKey::Judge, verdict.usage);
                }
                verdict.into_result(&candidates)
            }
            Some(Err(err)) => Err(err),
        };

        match result {
            Ok(judged) => {
                state.judge_result = Some(judged.clone());
                state.status = ComparisonStatus::Judged;
                drop(state);

                info!(winner = %judged.winner_label(), "judge verdict received");
                self.emit(ComparisonEvent::Judged(judged));
                self.emit(ComparisonEvent::Comparison(ComparisonStatus::Judged));
                Ok(ComparisonStatus::Judged)
            }
            Err(err) => Ok(self.settle_with_warning(state, format!("Judge error: {err}"))),
        }
    }

    /// Generate a single slot outside a full run
    pub async fn generate(&self, slot_index: usize, input: PromptInput) -> Result<GenerationOutcome> {
        let coordinator = self.coordinator(slot_index)?;
        let pending = {
            let state = self.lock();
            state.ensure_slots_free()?;
            coordinator.begin_generate(input)?
        };
        coordinator.stream(pending).await
    }

    /// Regenerate one slot; siblings and any existing verdict are left alone.
    /// Rejected while a run or a judge call is in progress.
    pub async fn regenerate(
        &self,
        slot_index: usize,
        modifier: Option<RegenerateModifier>,
        custom_instruction: Option<&str>,
    ) -> Result<GenerationOutcome> {
        let coordinator = self.coordinator(slot_index)?;
        let pending = {
            let state = self.lock();
            state.ensure_slots_free()?;
            coordinator.begin_regenerate(modifier, custom_instruction)?
        };
        coordinator.stream(pending).await
    }

    pub fn cancel(&self, slot_index: usize) -> Result<bool> {
        Ok(self.coordinator(slot_index)?.cancel())
    }

    /// Abort every slot and any judge call in flight
    pub fn cancel_all(&self) -> usize {
        self.cancels.cancel_all()
    }

    /// Abort everything, clear every slot and zero the usage totals.
    ///
    /// Runs and judge calls still unwinding from before the reset write nothing.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            self.cancels.cancel_all();
            for coordinator in &self.coordinators {
                coordinator.reset();
            }
            self.usage.reset();
            let epoch = state.epoch + 1;
            *state = ComparisonState::new(epoch);
        }
        self.emit(ComparisonEvent::Comparison(ComparisonStatus::NotStarted));
    }

    pub fn snapshot(&self) -> ComparisonSnapshot {
        // Slot locks are held while the ledger is read, so per-slot usage and
        // the ledger agree.
        let (slots, ledger) = {
            let guards: Vec<_> = self.coordinators.iter().map(|c| c.guard()).collect();
            let slots: Vec<Slot> = guards.iter().map(|g| g.slot().clone()).collect();
            (slots, self.usage.snapshot())
        };
        let state = self.lock();
        ComparisonSnapshot {
            status: state.status,
            result: ComparisonResult {
                outputs: slots.iter().map(|s| s.output.clone()).collect(),
                judge_result: state.judge_result.clone(),
                is_judging: state.is_judging,
            },
            usage: ledger.summary(slots.len()),
            slots,
            warnings: state.warnings.clone(),
        }
    }
}
