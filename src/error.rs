//! Error types and result aliases for the chat relay.
//!
//! This module defines the crate error type [`RelayError`] and the [`Result`] type alias
//! used by the hub, the configuration layer, and the transport. Inference failures are
//! not represented here: the gateway reports them through its own
//! [`InferenceError`](crate::gateway::InferenceError) so the hub can display them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Hub is closed")]
    HubClosed,

    #[error("Broadcast error: {0}")]
    BroadcastError(String),

    #[error("Inference gateway error: {0}")]
    GatewayError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
