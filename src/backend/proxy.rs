use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{ByteStream, GenerationRequest, ModelBackend};
use crate::error::{Error, Result};
use crate::judge::{self, JudgeRequest, JudgeVerdict};
use crate::models::ScoringCategory;

const STREAM_PATH: &str = "api/openai/chat/stream";
const JUDGE_PATH: &str = "api/openai/judge";

/// Talks to the credential-injecting proxy. The proxy owns routing and
/// authentication; `base_url`/`api_key` are only forwarded when set, otherwise
/// the proxy falls back to its own environment.
pub struct ProxyBackend {
    client: Client,
    proxy_url: String,
    base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatStreamBody<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<&'a str>,
    model: &'a str,
    #[serde(rename = "baseURL", skip_serializing_if = "Option::is_none")]
    base_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JudgeBody<'a> {
    context: &'a str,
    candidate_a: &'a str,
    candidate_b: &'a str,
    #[serde(rename = "baseURL", skip_serializing_if = "Option::is_none")]
    base_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    judge_system_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    judge_evaluation_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "no_categories")]
    scoring_categories: &'a [ScoringCategory],
}

fn no_categories(categories: &&[ScoringCategory]) -> bool {
    categories.is_empty()
}

impl ProxyBackend {
    pub fn new(proxy_url: impl Into<String>, base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            proxy_url: proxy_url.into(),
            base_url,
            api_key,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.proxy_url.trim_end_matches('/'), path)
    }
}

/// Pull a human-readable reason out of a failed proxy response
async fn error_detail(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
        v.get("detail")
            .or_else(|| v.get("error"))
            .and_then(|d| d.as_str())
            .map(str::to_string)
    });

    match detail {
        Some(detail) => format!("{status}: {detail}"),
        None if body.trim().is_empty() => status.to_string(),
        None => format!("{status}: {}", body.trim()),
    }
}

#[async_trait]
impl ModelBackend for ProxyBackend {
    async fn open_stream(&self, request: GenerationRequest) -> Result<ByteStream> {
        let body = ChatStreamBody {
            prompt: &request.prompt,
            system_prompt: request.system_prompt.as_deref(),
            model: &request.model,
            base_url: self.base_url.as_deref(),
            api_key: self.api_key.as_deref(),
        };

        debug!(model = %request.model, "opening proxy stream");
        let response = self
            .client
            .post(self.endpoint(STREAM_PATH))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Upstream(error_detail(response).await));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }

    async fn judge(&self, request: JudgeRequest) -> Result<JudgeVerdict> {
        let [a, b] = request.candidates.as_slice() else {
            return Err(Error::Config(format!(
                "proxy judge compares exactly two candidates, got {}",
                request.candidates.len()
            )));
        };

        let body = JudgeBody {
            context: &request.context,
            candidate_a: &a.output,
            candidate_b: &b.output,
            base_url: self.base_url.as_deref(),
            api_key: self.api_key.as_deref(),
            model: &request.model,
            judge_system_prompt: request.system_prompt.as_deref(),
            judge_evaluation_prompt: request.evaluation_prompt.as_deref(),
            scoring_categories: &request.categories,
        };

        debug!(model = %request.model, "calling proxy judge");
        let response = self
            .client
            .post(self.endpoint(JUDGE_PATH))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Upstream(error_detail(response).await));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid judge response body: {e}")))?;

        judge::parse_verdict(&parsed, 2, &request.categories)
    }
}
