pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod models;
pub mod transport;

pub use error::{RelayError, Result};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::{RelayError, Result};
    pub use crate::gateway::{
        display_text, HttpInferenceGateway, InferenceError, InferenceGateway, InferenceResult,
    };
    pub use crate::hub::{Broadcaster, ChatHub, ConnectionRegistry};
    pub use crate::models::{ChatMessage, ConnectionId, Sender};
}
