//! Model backends: where streamed generations and judge calls go.
//!
//! Both backends hand back the same framed transport (see [`crate::stream`]),
//! so the consumer never needs to know which one produced the bytes.

mod direct;
mod proxy;

pub use direct::DirectBackend;
pub use proxy::ProxyBackend;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::judge::{JudgeRequest, JudgeVerdict};

/// Framed response bytes of one streamed generation
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One streamed generation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Open a streamed generation. Errors here mean the request never produced
    /// a stream; errors inside the stream arrive as transport items or
    /// `{type:"error"}` frames.
    async fn open_stream(&self, request: GenerationRequest) -> Result<ByteStream>;

    /// Run one judge call to completion
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeVerdict>;
}
