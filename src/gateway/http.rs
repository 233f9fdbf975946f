use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::gateway::{InferenceError, InferenceGateway, InferenceResult};
use crate::models::InferenceRequest;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Deadline for the backend health probe, independent of the inference timeout.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for reaching the inference backend over HTTP
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub endpoint: String,
    pub timeout: Option<Duration>,
    pub headers: HashMap<String, String>,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: crate::config::DEFAULT_BACKEND_URL.to_string(),
            timeout: None,
            headers: HashMap::new(),
        }
    }
}

impl From<&RelayConfig> for HttpGatewayConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            endpoint: config.backend_url.clone(),
            timeout: config.backend_timeout,
            headers: HashMap::new(),
        }
    }
}

/// Gateway that POSTs each message to a plain-text generation endpoint
///
/// The backend receives `{"message": "..."}` and answers with the reply as the raw
/// response body. One attempt per call; nothing is cached between calls.
pub struct HttpInferenceGateway {
    client: Client,
    config: HttpGatewayConfig,
}

impl HttpInferenceGateway {
    /// Create a gateway pointed at the default local backend
    pub fn new() -> Result<Self> {
        Self::with_config(HttpGatewayConfig::default())
    }

    /// Create a gateway with custom configuration
    pub fn with_config(config: HttpGatewayConfig) -> Result<Self> {
        let mut client_builder = Client::builder();

        if let Some(timeout) = config.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        if !config.headers.is_empty() {
            let mut headers = HeaderMap::new();
            for (name, value) in &config.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| RelayError::ConfigError(format!("header '{}': {}", name, e)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| RelayError::ConfigError(format!("header '{}': {}", name, e)))?;
                headers.insert(name, value);
            }
            client_builder = client_builder.default_headers(headers);
        }

        let client = client_builder.build()?;

        Ok(Self { client, config })
    }

    /// Create a gateway for a custom endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_config(HttpGatewayConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Ask the backend's `/health` route whether it is up.
    ///
    /// Transport failures, timeouts and non-success statuses all report `false`.
    pub async fn health_check(&self) -> Result<bool> {
        let url = reqwest::Url::parse(&self.config.endpoint)
            .and_then(|u| u.join("/health"))
            .map_err(|e| {
                RelayError::ConfigError(format!("backend url '{}': {}", self.config.endpoint, e))
            })?;

        match self.client.get(url).timeout(HEALTH_CHECK_TIMEOUT).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                debug!("Backend health check failed: {}", e);
                Ok(false)
            }
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(e.to_string())
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl InferenceGateway for HttpInferenceGateway {
    async fn get_response(&self, message: &str) -> InferenceResult {
        info!("Sending request to inference backend: {}", self.config.endpoint);
        debug!("Message length: {}", message.len());

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&InferenceRequest::new(message))
            .send()
            .await
            .map_err(|e| {
                error!("Error calling inference backend: {}", e);
                self.transport_error(e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Error reading inference backend response: {}", e);
            self.transport_error(e)
        })?;

        if !status.is_success() {
            error!("Inference backend failed with status code {}. Error: {}", status, body);
            return Err(InferenceError::BackendStatus {
                status: status.as_u16(),
                body,
            });
        }

        let reply = body.trim();
        if reply.is_empty() {
            warn!("Inference backend returned empty output");
            return Err(InferenceError::EmptyResponse);
        }

        info!("AI response received ({} chars)", reply.len());
        Ok(reply.to_string())
    }
}
