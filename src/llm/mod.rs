//! LLM access for the decision loop.
//!
//! The model is an opaque request/response oracle reached over the OpenAI
//! Chat Completions API. The loop depends only on [`LlmProvider`], so tests
//! can substitute a scripted model.

mod openai_compatible;
pub mod provider;

use std::sync::Arc;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ResponseFormat,
    Role,
};

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the provider configured for this worker.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible endpoint");
    Ok(Arc::new(OpenAiCompatibleProvider::new(config.clone())?))
}
