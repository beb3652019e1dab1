//! HTTP client for cua-core REST endpoints.
//!
//! [`CoreClient`] wraps `reqwest::Client` with typed methods for the small
//! REST surface next to the WebSocket: the model catalog, instruction
//! generation, and step/trace evaluation feedback.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for a `detail` field in the JSON body (the
//! backend's error shape). If parsing fails, the raw response body is
//! returned as the error message. Evaluation updates are opportunistic: the
//! caller applies the local copy on success and only surfaces the error on
//! failure, never rolls back.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::trace::{StepEvaluation, UserEvaluation};

/// HTTP client for a single cua-core backend.
#[derive(Clone)]
pub struct CoreClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    models: Vec<String>,
}

#[derive(Deserialize)]
struct InstructionResponse {
    instruction: String,
}

impl CoreClient {
    /// Create a new client for the backend at the given HTTP base URL.
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The backend's base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health` — liveness probe.
    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// `GET /models` — available model ids for task dispatch.
    pub async fn models(&self) -> Result<Vec<String>, ClientError> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(ClientError::Request)?;
        let value = Self::handle_response(resp).await?;
        let parsed: ModelsResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("bad models response: {}", e)))?;
        Ok(parsed.models)
    }

    /// `POST /generate-instruction` — a random task instruction from the
    /// backend's pregenerated pool.
    pub async fn generate_instruction(&self) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(format!("{}/generate-instruction", self.base_url))
            .send()
            .await
            .map_err(ClientError::Request)?;
        let value = Self::handle_response(resp).await?;
        let parsed: InstructionResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("bad instruction response: {}", e)))?;
        Ok(parsed.instruction)
    }

    /// `PATCH /traces/{trace_id}/steps/{step_id}` — record step feedback.
    pub async fn update_step_evaluation(
        &self,
        trace_id: &str,
        step_id: &str,
        evaluation: StepEvaluation,
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .patch(format!(
                "{}/traces/{}/steps/{}",
                self.base_url, trace_id, step_id
            ))
            .json(&json!({ "step_evaluation": evaluation }))
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await.map(|_| ())
    }

    /// `PATCH /traces/{trace_id}/evaluation` — record whole-trace feedback.
    pub async fn update_trace_evaluation(
        &self,
        trace_id: &str,
        evaluation: UserEvaluation,
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .patch(format!("{}/traces/{}/evaluation", self.base_url, trace_id))
            .json(&json!({ "user_evaluation": evaluation }))
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await.map(|_| ())
    }

    /// Parse an HTTP response — the JSON body on success, or a
    /// [`ClientError`] carrying the backend's `detail` message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<serde_json::Value, ClientError> {
        let status = resp.status();
        let body = resp.text().await.map_err(ClientError::Request)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("invalid JSON from backend: {}", e)))
        } else {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["detail"].as_str().map(String::from))
                .unwrap_or(body);
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Errors returned by [`CoreClient`] methods.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, ...).
    Request(reqwest::Error),
    /// The backend returned a non-2xx HTTP status.
    Api { status: u16, message: String },
    /// The response body was not the expected shape.
    Protocol(String),
}

impl ClientError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Api { status, message } => {
                write!(f, "backend error (HTTP {}): {}", status, message)
            }
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}
