//! Outbound REST client for the payment processor. Minimal endpoints with
//! bearer auth and `Idempotency-Key` propagation; callers derive keys from
//! their own row identifiers so a retried request never duplicates a side
//! effect.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use shared::{ConnectedAccount, Hold, HoldRequest, Transfer, TransferRequest};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("processor error: {kind} code={code:?} message={message:?}")]
    Api {
        kind: String,
        code: Option<String>,
        message: Option<String>,
        status: Option<u16>,
    },
}

impl ProcessorError {
    /// Card-level rejections are user-facing; everything else is plumbing.
    pub fn is_decline(&self) -> bool {
        matches!(self, Self::Api { kind, .. } if kind == "card_error")
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Decode(_) => false,
            Self::Api { kind, status, .. } => {
                if let Some(s) = status {
                    if (500..600).contains(s) {
                        return true;
                    }
                }
                matches!(kind.as_str(), "api_error" | "api_connection_error" | "rate_limit_error")
            }
        }
    }

    /// Human-readable reason suitable for the payment's `error_message`.
    pub fn reason(&self) -> String {
        match self {
            Self::Api { message: Some(m), .. } => m.clone(),
            other => other.to_string(),
        }
    }
}

// Error envelope: { "error": { "type", "code", "message", "param" } }
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    type_: String,
    code: Option<String>,
    message: Option<String>,
}

fn map_error(status: u16, body: &str) -> ProcessorError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => ProcessorError::Api {
            kind: env.error.type_,
            code: env.error.code,
            message: env.error.message,
            status: Some(status),
        },
        Err(_) => ProcessorError::Http(format!("status={status} body={body}")),
    }
}

#[async_trait]
pub trait ProcessorClient: Send + Sync {
    async fn create_hold(
        &self,
        req: &HoldRequest,
        idempotency_key: &str,
    ) -> Result<Hold, ProcessorError>;
    async fn retrieve_hold(&self, hold_id: &str) -> Result<Hold, ProcessorError>;
    async fn cancel_hold(&self, hold_id: &str) -> Result<Hold, ProcessorError>;
    async fn capture_hold(&self, hold_id: &str) -> Result<Hold, ProcessorError>;
    async fn create_transfer(
        &self,
        req: &TransferRequest,
        idempotency_key: &str,
    ) -> Result<Transfer, ProcessorError>;
    async fn retrieve_account(&self, account_id: &str) -> Result<ConnectedAccount, ProcessorError>;
}

#[derive(Clone)]
pub struct RestProcessorClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl RestProcessorClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(
        &self,
        req: reqwest::RequestBuilder,
        idempotency_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = req.bearer_auth(&self.api_key);
        if let Some(k) = idempotency_key {
            req = req.header("Idempotency-Key", k);
        }
        req
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ProcessorError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ProcessorError::Http(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ProcessorError::Http(e.to_string()))?;
        if !(200..300).contains(&status) {
            let err = map_error(status, &body);
            warn!(status, error = %err, "processor request failed");
            return Err(err);
        }
        serde_json::from_str(&body).map_err(|e| ProcessorError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ProcessorClient for RestProcessorClient {
    async fn create_hold(
        &self,
        req: &HoldRequest,
        idempotency_key: &str,
    ) -> Result<Hold, ProcessorError> {
        let builder = self.http.post(self.url("/v1/holds")).json(req);
        self.send(self.headers(builder, Some(idempotency_key))).await
    }

    async fn retrieve_hold(&self, hold_id: &str) -> Result<Hold, ProcessorError> {
        let builder = self.http.get(self.url(&format!("/v1/holds/{hold_id}")));
        self.send(self.headers(builder, None)).await
    }

    async fn cancel_hold(&self, hold_id: &str) -> Result<Hold, ProcessorError> {
        let builder = self
            .http
            .post(self.url(&format!("/v1/holds/{hold_id}/cancel")));
        self.send(self.headers(builder, None)).await
    }

    async fn capture_hold(&self, hold_id: &str) -> Result<Hold, ProcessorError> {
        let builder = self
            .http
            .post(self.url(&format!("/v1/holds/{hold_id}/capture")));
        self.send(self.headers(builder, None)).await
    }

    async fn create_transfer(
        &self,
        req: &TransferRequest,
        idempotency_key: &str,
    ) -> Result<Transfer, ProcessorError> {
        let builder = self.http.post(self.url("/v1/transfers")).json(req);
        self.send(self.headers(builder, Some(idempotency_key))).await
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<ConnectedAccount, ProcessorError> {
        let builder = self
            .http
            .get(self.url(&format!("/v1/accounts/{account_id}")));
        self.send(self.headers(builder, None)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_the_error_envelope() {
        let body = r#"{"error":{"type":"card_error","code":"card_declined","message":"Your card was declined."}}"#;
        let err = map_error(402, body);
        assert!(err.is_decline());
        assert!(!err.is_transient());
        assert_eq!(err.reason(), "Your card was declined.");
    }

    #[test]
    fn falls_back_to_http_error_on_unparseable_body() {
        let err = map_error(502, "<html>bad gateway</html>");
        assert!(matches!(err, ProcessorError::Http(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn classifies_transient_errors() {
        let rate_limited = map_error(429, r#"{"error":{"type":"rate_limit_error"}}"#);
        assert!(rate_limited.is_transient());

        let server_err = map_error(500, r#"{"error":{"type":"api_error"}}"#);
        assert!(server_err.is_transient());

        let invalid = map_error(400, r#"{"error":{"type":"invalid_request_error"}}"#);
        assert!(!invalid.is_transient());
    }
}
