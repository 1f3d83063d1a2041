pub mod client;
pub mod mock;

use async_trait::async_trait;

use crate::error::LlmError;

pub use client::{
    CallKind, InputMessage, LlmClient, LlmRequest, LlmResponse, Role, TextSegment, TokenUsage,
};
pub use mock::MockBackend;

/// A hosted model reachable through the responses API.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn respond(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}
