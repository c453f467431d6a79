//! Shared HTTP client for every remote step call.
//!
//! One `reqwest::Client` with the configured per-call timeout. Failures come
//! back as `LeadflowError::Remote` with a kind the retry policy understands.

use leadflow_core::config::HttpConfig;
use leadflow_core::error::truncate_chars;
use leadflow_core::{LeadflowError, RemoteErrorKind, Result};
use std::time::Duration;

/// Response body text kept in error messages.
const MAX_ERROR_BODY: usize = 500;

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

/// Successful (2xx) answer.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    /// Parse the body as JSON; an empty body reads as `null`.
    pub fn json(&self, service: &str) -> Result<serde_json::Value> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| {
            LeadflowError::remote(service, RemoteErrorKind::Decode, format!("invalid JSON: {e}"))
        })
    }

    pub fn parse<T: serde::de::DeserializeOwned>(&self, service: &str) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            LeadflowError::remote(service, RemoteErrorKind::Decode, format!("unexpected body: {e}"))
        })
    }
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LeadflowError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url)
    }

    /// POST a JSON body with optional bearer token and idempotency key.
    pub async fn post_json(
        &self,
        service: &str,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<HttpReply> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer.filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        self.send(service, request).await
    }

    /// Send a prepared request, mapping transport errors and non-2xx answers.
    pub async fn send(&self, service: &str, request: reqwest::RequestBuilder) -> Result<HttpReply> {
        let resp = request.send().await.map_err(|e| classify(service, &e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| classify(service, &e))?;

        if !status.is_success() {
            tracing::debug!("🌐 {} answered {}", service, status);
            return Err(LeadflowError::remote(
                service,
                RemoteErrorKind::Status(status.as_u16()),
                truncate_chars(&body, MAX_ERROR_BODY),
            ));
        }
        Ok(HttpReply {
            status: status.as_u16(),
            body,
        })
    }
}

fn classify(service: &str, e: &reqwest::Error) -> LeadflowError {
    let kind = if e.is_timeout() {
        RemoteErrorKind::Timeout
    } else if e.is_connect() {
        RemoteErrorKind::Connect
    } else if e.is_decode() || e.is_body() {
        RemoteErrorKind::Decode
    } else if let Some(status) = e.status() {
        RemoteErrorKind::Status(status.as_u16())
    } else {
        RemoteErrorKind::Other
    };
    LeadflowError::remote(service, kind, e.to_string())
}
