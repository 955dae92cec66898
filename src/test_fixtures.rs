//! Scripted backend for coordinator and orchestrator tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::backend::{ByteStream, GenerationRequest, ModelBackend};
use crate::error::{Error, Result};
use crate::judge::{CandidateVerdict, JudgeRequest, JudgeVerdict};
use crate::models::TokenUsage;

/// What one `open_stream` call for a model returns
pub enum Script {
    /// Deliver these raw transport chunks, then end
    Chunks(Vec<String>),
    /// Deliver `before`, wait for `gate`, then deliver `after`
    Hold {
        before: Vec<String>,
        gate: Arc<Notify>,
        after: Vec<String>,
    },
    /// Fail before any stream is produced
    FailOpen(String),
}

pub fn content(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"type": "content", "content": text})
    )
}

pub fn usage(prompt: u64, completion: u64) -> String {
    format!(
        "data: {{\"type\":\"usage\",\"usage\":{{\"promptTokens\":{},\"completionTokens\":{},\"totalTokens\":{}}}}}\n\n",
        prompt,
        completion,
        prompt + completion
    )
}

pub fn error(message: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"type": "error", "error": message})
    )
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// A complete successful stream of `parts` with the given usage
pub fn streamed(parts: &[&str], prompt: u64, completion: u64) -> Script {
    let mut chunks: Vec<String> = parts.iter().map(|p| content(p)).collect();
    chunks.push(usage(prompt, completion));
    chunks.push(done());
    Script::Chunks(chunks)
}

fn to_items(chunks: Vec<String>) -> Vec<Result<Bytes>> {
    chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect()
}

/// A verdict scoring every candidate with `score` on a single "clarity" axis
pub fn verdict(candidates: usize, winner: Option<usize>, usage: TokenUsage) -> JudgeVerdict {
    JudgeVerdict {
        candidates: (0..candidates)
            .map(|i| CandidateVerdict {
                scores: [("clarity".to_string(), 5.0 + i as f64)].into_iter().collect(),
                reasoning: format!("reasoning {i}"),
            })
            .collect(),
        winner,
        winner_reasoning: "stated by judge".to_string(),
        usage,
    }
}

#[derive(Default)]
pub struct ScriptedBackend {
    streams: Mutex<HashMap<String, VecDeque<Script>>>,
    judge_results: Mutex<VecDeque<Result<JudgeVerdict>>>,
    judge_gate: Mutex<Option<Arc<Notify>>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
    pub judge_requests: Mutex<Vec<JudgeRequest>>,
    pub judge_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, model: &str, script: Script) -> Self {
        self.push_script(model, script);
        self
    }

    pub fn push_script(&self, model: &str, script: Script) {
        self.streams
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn judge_result(self, result: Result<JudgeVerdict>) -> Self {
        self.push_judge_result(result);
        self
    }

    pub fn push_judge_result(&self, result: Result<JudgeVerdict>) {
        self.judge_results.lock().unwrap().push_back(result);
    }

    /// Make the next judge calls wait for `gate`
    pub fn hold_judge(&self, gate: Arc<Notify>) {
        *self.judge_gate.lock().unwrap() = Some(gate);
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn open_stream(&self, request: GenerationRequest) -> Result<ByteStream> {
        let script = self
            .streams
            .lock()
            .unwrap()
            .get_mut(&request.model)
            .and_then(VecDeque::pop_front);
        self.requests.lock().unwrap().push(request.clone());

        match script {
            None => Err(Error::Config(format!("no script for {}", request.model))),
            Some(Script::FailOpen(message)) => Err(Error::Network(message)),
            Some(Script::Chunks(chunks)) => Ok(stream::iter(to_items(chunks)).boxed()),
            Some(Script::Hold { before, gate, after }) => {
                let wait = stream::once(async move {
                    gate.notified().await;
                    Ok(Bytes::new())
                });
                Ok(stream::iter(to_items(before))
                    .chain(wait)
                    .chain(stream::iter(to_items(after)))
                    .boxed())
            }
        }
    }

    async fn judge(&self, request: JudgeRequest) -> Result<JudgeVerdict> {
        self.judge_calls.fetch_add(1, Ordering::SeqCst);
        self.judge_requests.lock().unwrap().push(request);

        let gate = self.judge_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.judge_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Upstream("no judge result scripted".to_string())))
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
