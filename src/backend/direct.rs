use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionStreamOptions,
    CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde_json::json;
use tracing::debug;

use super::{ByteStream, GenerationRequest, ModelBackend};
use crate::error::{Error, Result};
use crate::judge::{self, JudgeRequest, JudgeVerdict};
use crate::models::TokenUsage;
use crate::prompts;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Calls an OpenAI-compatible provider directly, without the proxy.
///
/// The provider's chunk stream is re-framed into the proxy transport so the
/// stream consumer handles both backends identically.
pub struct DirectBackend {
    client: Client<OpenAIConfig>,
}

impl DirectBackend {
    pub fn new(api_endpoint: &str, api_key: String) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_endpoint);

        Self {
            client: Client::with_config(openai_config),
        }
    }
}

fn map_openai_error(err: OpenAIError) -> Error {
    match err {
        OpenAIError::Reqwest(e) => Error::Network(e.to_string()),
        other => Error::Upstream(other.to_string()),
    }
}

/// Build the message list; an empty system prompt is left out
fn build_messages(system_prompt: Option<&str>, prompt: &str) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();

    if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system.to_string())
                .build()
                .map_err(|e| Error::Config(format!("failed to build system message: {e}")))?
                .into(),
        );
    }

    messages.push(
        ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .map_err(|e| Error::Config(format!("failed to build user message: {e}")))?
            .into(),
    );

    Ok(messages)
}

fn push_frame(out: &mut String, payload: serde_json::Value) {
    out.push_str("data: ");
    out.push_str(&payload.to_string());
    out.push_str("\n\n");
}

/// Re-frame one provider chunk as transport frames
fn frame_chunk(item: std::result::Result<CreateChatCompletionStreamResponse, OpenAIError>) -> Bytes {
    let mut out = String::new();
    match item {
        Ok(chunk) => {
            for choice in &chunk.choices {
                if let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) {
                    push_frame(&mut out, json!({"type": "content", "content": content}));
                }
            }
            if let Some(usage) = chunk.usage {
                let usage = TokenUsage::new(
                    u64::from(usage.prompt_tokens),
                    u64::from(usage.completion_tokens),
                    u64::from(usage.total_tokens),
                );
                push_frame(&mut out, json!({"type": "usage", "usage": usage}));
            }
        }
        Err(err) => push_frame(&mut out, json!({"type": "error", "error": err.to_string()})),
    }
    Bytes::from(out)
}

#[async_trait]
impl ModelBackend for DirectBackend {
    async fn open_stream(&self, request: GenerationRequest) -> Result<ByteStream> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(build_messages(request.system_prompt.as_deref(), &request.prompt)?)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            })
            .build()
            .map_err(|e| Error::Config(format!("failed to build chat completion request: {e}")))?;

        debug!(model = %request.model, "opening provider stream");
        let provider_stream = self
            .client
            .chat()
            .create_stream(chat_request)
            .await
            .map_err(map_openai_error)?;

        Ok(provider_stream
            .map(|item| Ok::<Bytes, Error>(frame_chunk(item)))
            .chain(stream::once(async { Ok::<Bytes, Error>(Bytes::from_static(DONE_FRAME)) }))
            .boxed())
    }

    async fn judge(&self, request: JudgeRequest) -> Result<JudgeVerdict> {
        let candidate_count = request.candidates.len();
        let system_prompt = request
            .system_prompt
            .clone()
            .unwrap_or_else(|| prompts::judge_system_prompt(&request.categories, candidate_count));
        let outputs: Vec<&str> = request.candidates.iter().map(|c| c.output.as_str()).collect();
        let user_prompt =
            prompts::evaluation_prompt(request.evaluation_prompt.as_deref(), &request.context, &outputs);

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(build_messages(Some(&system_prompt), &user_prompt)?)
            .temperature(0.1)
            .build()
            .map_err(|e| Error::Config(format!("failed to build judge request: {e}")))?;

        debug!(model = %request.model, candidates = candidate_count, "calling provider judge");
        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(map_openai_error)?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Upstream("empty response from judge model".to_string()))?;

        let parsed = judge::parse_json_response(&content)?;
        let mut verdict = judge::parse_verdict(&parsed, candidate_count, &request.categories)?;
        if let Some(usage) = response.usage {
            verdict.usage = TokenUsage::new(
                u64::from(usage.prompt_tokens),
                u64::from(usage.completion_tokens),
                u64::from(usage.total_tokens),
            );
        }
        Ok(verdict)
    }
}
