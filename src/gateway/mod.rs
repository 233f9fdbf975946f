//! Inference gateway contract.
//!
//! A gateway turns one chat message into one call to an external text-generation
//! backend. Failures come back as a tagged [`InferenceError`] rather than being raised,
//! and [`display_text`] collapses either outcome into the string clients see.

pub mod http;

pub use http::{HttpGatewayConfig, HttpInferenceGateway};

use async_trait::async_trait;
use thiserror::Error;

/// Why an inference call produced no usable reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("{0}")]
    Transport(String),

    #[error("AI service timed out: {0}")]
    Timeout(String),

    #[error("Python AI API failed - {body}")]
    BackendStatus { status: u16, body: String },

    #[error("No response from AI service")]
    EmptyResponse,
}

impl InferenceError {
    /// Stable tag for logs and tests
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Transport(_) => "transport",
            InferenceError::Timeout(_) => "timeout",
            InferenceError::BackendStatus { .. } => "backend_status",
            InferenceError::EmptyResponse => "empty_response",
        }
    }
}

pub type InferenceResult = std::result::Result<String, InferenceError>;

/// Text shown to clients for a gateway outcome
pub fn display_text(result: &InferenceResult) -> String {
    match result {
        Ok(reply) => reply.clone(),
        Err(e) => format!("Error: {}", e),
    }
}

/// Abstract interface for text-generation backends
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    /// Make one best-effort call for `message`. Never panics on backend failure.
    async fn get_response(&self, message: &str) -> InferenceResult;
}
