use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{DirectBackend, ModelBackend, ProxyBackend};
use crate::config::{BackendConfig, BackendMode, Config, TargetConfig};
use crate::coordinator::PromptInput;
use crate::models::{
    ComparisonStatus, JudgeResult, SlotKey, SlotStatus, TokenUsage, max_total,
};
use crate::orchestrator::{ComparisonBuilder, ComparisonSnapshot};
use crate::pricing::PriceTable;
use crate::usage::{UsageAggregator, UsageSummary};

/// One slot of one target, ready for printing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotReport {
    pub label: String,
    pub model: String,
    pub status: SlotStatus,
    pub output: String,
    pub usage: TokenUsage,
    pub total_score: Option<f64>,
    pub estimated_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    pub name: String,
    pub status: ComparisonStatus,
    pub slots: Vec<SlotReport>,
    pub judge_result: Option<JudgeResult>,
    /// "Tie", "Model B Wins", or empty when nothing was judged
    pub verdict: String,
    pub max_total: f64,
    pub judge_model: String,
    pub judge_usage: TokenUsage,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub targets: Vec<TargetReport>,
    pub usage: UsageSummary,
    pub estimated_cost: Option<f64>,
    /// True when the run was interrupted; later targets were not started
    pub cancelled: bool,
}

/// Build the backend named by the run file. Direct mode reads the API key
/// from the configured environment variable.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn ModelBackend>> {
    let api_key = match &config.env_var_api_key {
        Some(var) => Some(
            std::env::var(var).with_context(|| format!("Environment variable {} not found", var))?,
        ),
        None => None,
    };

    match config.mode {
        BackendMode::Proxy => Ok(Arc::new(ProxyBackend::new(
            config.proxy_url.clone(),
            config.api_endpoint.clone(),
            api_key,
        ))),
        BackendMode::Direct => {
            let endpoint = config
                .api_endpoint
                .as_deref()
                .context("direct mode requires backend.api_endpoint")?;
            let api_key = api_key.context("direct mode requires backend.env_var_api_key")?;
            Ok(Arc::new(DirectBackend::new(endpoint, api_key)))
        }
    }
}

/// Runs every target of a run file as its own comparison, in order
pub struct Runner {
    config: Config,
    backend: Arc<dyn ModelBackend>,
    session: CancellationToken,
    usage: UsageAggregator,
    prices: PriceTable,
}

impl Runner {
    pub fn new(config: Config) -> Result<Self> {
        let backend = build_backend(&config.backend)?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: Config, backend: Arc<dyn ModelBackend>) -> Self {
        let prices = PriceTable::new(config.pricing.clone());
        Self {
            config,
            backend,
            session: CancellationToken::new(),
            usage: UsageAggregator::new(),
            prices,
        }
    }

    /// Cancelling this token aborts everything in flight and stops the run
    pub fn session_token(&self) -> CancellationToken {
        self.session.clone()
    }

    pub async fn run(&self) -> Result<SessionReport> {
        let total_targets = self.config.targets.len();
        let mut targets = Vec::with_capacity(total_targets);

        for (index, target) in self.config.targets.iter().enumerate() {
            if self.session.is_cancelled() {
                warn!(remaining = total_targets - index, "run cancelled, skipping remaining targets");
                break;
            }
            info!(name = %target.name, "comparison {}/{}", index + 1, total_targets);
            let report = self
                .run_target(target)
                .await
                .with_context(|| format!("Failed to compare target: {}", target.name))?;
            targets.push(report);
        }

        let usage = self.usage.snapshot().summary(self.config.slots.len());
        let estimated_cost = sum_costs(
            targets
                .iter()
                .flat_map(|t| {
                    t.slots
                        .iter()
                        .map(|s| s.estimated_cost)
                        .chain(std::iter::once(self.judge_cost(t)))
                }),
        );

        Ok(SessionReport {
            targets,
            usage,
            estimated_cost,
            cancelled: self.session.is_cancelled(),
        })
    }

    async fn run_target(&self, target: &TargetConfig) -> Result<TargetReport> {
        let comparison = ComparisonBuilder::new(self.backend.clone())
            .slots(self.config.slot_specs())
            .judge(self.config.judge_settings())
            .session_token(self.session.clone())
            .build()?;

        let input = PromptInput::new(target.prompt.clone())
            .with_system_prompt(Some(self.config.system_prompt.clone()));
        let snapshot = comparison.run(input, target.context.clone()).await?;
        debug!(name = %target.name, status = %snapshot.status, "comparison settled");

        self.record_usage(&snapshot);
        Ok(self.target_report(target, &snapshot, comparison.judge_settings().model.clone()))
    }

    fn record_usage(&self, snapshot: &ComparisonSnapshot) {
        for (index, usage) in snapshot.usage.models.iter().enumerate() {
            if !usage.is_zero() {
                self.usage.add(SlotKey::Model(index), *usage);
            }
        }
        if !snapshot.usage.judge.is_zero() {
            self.usage.add(SlotKey::Judge, snapshot.usage.judge);
        }
    }

    fn target_report(
        &self,
        target: &TargetConfig,
        snapshot: &ComparisonSnapshot,
        judge_model: String,
    ) -> TargetReport {
        let judge_result = snapshot.result.judge_result.clone();
        let labels = self.config.slot_labels();

        let slots = snapshot
            .slots
            .iter()
            .map(|slot| SlotReport {
                label: labels
                    .get(slot.model_index)
                    .cloned()
                    .unwrap_or_else(|| slot.model_name.clone()),
                model: slot.model_name.clone(),
                status: slot.status.clone(),
                output: slot.output.clone(),
                usage: slot.usage,
                total_score: judge_result
                    .as_ref()
                    .and_then(|r| r.total_for(slot.model_index)),
                estimated_cost: self.prices.estimated_cost(&slot.model_name, slot.usage),
            })
            .collect();

        TargetReport {
            name: target.name.clone(),
            status: snapshot.status,
            slots,
            verdict: judge_result
                .as_ref()
                .map(|r| r.winner_label())
                .unwrap_or_default(),
            judge_result,
            max_total: max_total(&self.config.judge.categories),
            judge_model,
            judge_usage: snapshot.usage.judge,
            warnings: snapshot.warnings.clone(),
        }
    }

    fn judge_cost(&self, target: &TargetReport) -> Option<f64> {
        if target.judge_usage.is_zero() {
            return None;
        }
        self.prices.estimated_cost(&target.judge_model, target.judge_usage)
    }
}

/// Sum of the known costs, `None` if none were known
fn sum_costs(costs: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    costs
        .into_iter()
        .flatten()
        .fold(None, |acc, cost| Some(acc.unwrap_or(0.0) + cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JudgeConfig, SlotConfig};
    use crate::models::ScoringCategory;
    use crate::prompts::DEFAULT_SYSTEM_PROMPT;
    use mockito::Matcher;
    use serde_json::json;

    fn test_config(proxy_url: String, targets: usize) -> Config {
        Config {
            backend: BackendConfig {
                mode: BackendMode::Proxy,
                proxy_url,
                api_endpoint: None,
                env_var_api_key: None,
            },
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            slots: vec![
                SlotConfig {
                    model: "gpt-4o-mini".to_string(),
                    label: None,
                    system_prompt: None,
                },
                SlotConfig {
                    model: "local-llama".to_string(),
                    label: Some("Llama".to_string()),
                    system_prompt: None,
                },
            ],
            judge: JudgeConfig {
                categories: vec![
                    ScoringCategory::new("clarity", "Clarity", "", 0.0, 10.0),
                    ScoringCategory::new("accuracy", "Accuracy", "", 0.0, 10.0),
                ],
                ..JudgeConfig::default()
            },
            targets: (0..targets)
                .map(|i| TargetConfig {
                    name: format!("target {i}"),
                    prompt: format!("Describe part {i}"),
                    context: "Columns: id, status".to_string(),
                })
                .collect(),
            pricing: Vec::new(),
        }
    }

    fn sse_body(text: &str, prompt: u64, completion: u64) -> String {
        format!(
            "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            json!({"type": "content", "content": text}),
            json!({"type": "usage", "usage": {
                "promptTokens": prompt,
                "completionTokens": completion,
                "totalTokens": prompt + completion
            }})
        )
    }

    #[tokio::test]
    async fn test_run_judged_comparison_through_proxy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/openai/chat/stream")
            .match_body(Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body("Permit records.", 1_000_000, 0))
            .create_async()
            .await;
        server
            .mock("POST", "/api/openai/chat/stream")
            .match_body(Matcher::PartialJson(json!({"model": "local-llama"})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body("Building permits issued.", 10, 5))
            .create_async()
            .await;
        let judge = server
            .mock("POST", "/api/openai/judge")
            .match_body(Matcher::PartialJson(json!({
                "candidateA": "Permit records.",
                "candidateB": "Building permits issued.",
                "model": "gpt-4o-mini"
            })))
            .with_status(200)
            .with_body(
                json!({
                    "modelA": {"scores": {"clarity": 6, "accuracy": 7}, "reasoning": "short"},
                    "modelB": {"scores": {"clarity": 9, "accuracy": 8}, "reasoning": "specific"},
                    "winner": "B",
                    "winnerReasoning": "More specific",
                    "usage": {"promptTokens": 0, "completionTokens": 1000000, "totalTokens": 1000000}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = test_config(server.url(), 1);
        let backend = build_backend(&config.backend).unwrap();
        let runner = Runner::with_backend(config, backend);

        let report = runner.run().await.unwrap();

        judge.assert_async().await;
        assert!(!report.cancelled);
        let target = &report.targets[0];
        assert_eq!(target.status, ComparisonStatus::Judged);
        assert_eq!(target.verdict, "Model B Wins");
        assert_eq!(target.max_total, 20.0);
        assert_eq!(target.slots[0].label, "Model A");
        assert_eq!(target.slots[1].label, "Llama");
        assert_eq!(target.slots[1].output, "Building permits issued.");
        assert_eq!(target.slots[1].total_score, Some(17.0));
        assert_eq!(target.slots[1].estimated_cost, None);

        assert_eq!(report.usage.judge, TokenUsage::new(0, 1_000_000, 1_000_000));
        assert_eq!(
            report.usage.total,
            TokenUsage::new(1_000_010, 1_000_005, 2_000_015)
        );
        // 1M prompt tokens on gpt-4o-mini plus 1M judge completion tokens on gpt-4o-mini
        let cost = report.estimated_cost.unwrap();
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_slot_reported_without_judge() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/openai/chat/stream")
            .match_body(Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_body(sse_body("Hello world", 3, 2))
            .create_async()
            .await;
        server
            .mock("POST", "/api/openai/chat/stream")
            .match_body(Matcher::PartialJson(json!({"model": "local-llama"})))
            .with_status(200)
            .with_body("data: {\"type\":\"error\",\"error\":\"rate limited\"}\n\n")
            .create_async()
            .await;
        let judge = server
            .mock("POST", "/api/openai/judge")
            .expect(0)
            .create_async()
            .await;

        let runner = Runner::with_backend(
            test_config(server.url(), 1),
            Arc::new(ProxyBackend::new(server.url(), None, None)),
        );
        let report = runner.run().await.unwrap();

        judge.assert_async().await;
        let target = &report.targets[0];
        assert_eq!(target.status, ComparisonStatus::GeneratedNoJudge);
        assert_eq!(target.verdict, "");
        assert_eq!(target.slots[0].output, "Hello world");
        assert!(target.slots[1].status.is_failed());
        assert_eq!(target.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_session_stops_run() {
        let runner = Runner::with_backend(
            test_config("http://127.0.0.1:9".to_string(), 3),
            Arc::new(ProxyBackend::new("http://127.0.0.1:9", None, None)),
        );
        runner.session_token().cancel();

        let report = runner.run().await.unwrap();

        assert!(report.cancelled);
        assert!(report.targets.is_empty());
        assert_eq!(report.estimated_cost, None);
    }

    #[test]
    fn test_build_backend_missing_env_var() {
        let config = BackendConfig {
            mode: BackendMode::Direct,
            proxy_url: String::new(),
            api_endpoint: Some("https://api.openai.com/v1".to_string()),
            env_var_api_key: Some("LLM_METADATA_COMPARE_UNSET_KEY".to_string()),
        };
        let err = build_backend(&config).err().unwrap();
        assert!(err.to_string().contains("LLM_METADATA_COMPARE_UNSET_KEY"));
    }

    #[test]
    fn test_sum_costs() {
        assert_eq!(sum_costs([None, None]), None);
        assert_eq!(sum_costs([Some(1.5), None, Some(0.5)]), Some(2.0));
    }
}
