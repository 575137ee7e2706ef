//! Processor webhook intake: verify authenticity, fence on the event id,
//! dispatch to the per-kind handler, and only then record the event as
//! processed. A handler failure leaves no dedup row and surfaces as a
//! retryable 5xx so the transport redelivers.

use crate::error::EscrowError;
use crate::events;
use crate::models::NewWebhookEvent;
use crate::schema::webhook_events;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use shared::ProcessorEvent;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("timestamp tolerance exceeded: {0}")]
    TimestampTolerance(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing webhook secret")]
    MissingSecret,
    #[error("event processing failed: {0}")]
    ProcessingFailed(String),
}

impl WebhookError {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::MissingSignature | WebhookError::InvalidSignature(_) => 401,
            WebhookError::TimestampTolerance(_) | WebhookError::MalformedPayload(_) => 400,
            WebhookError::MissingSecret => 500,
            // Retryable: the transport must redeliver.
            WebhookError::ProcessingFailed(_) => 500,
        }
    }
}

impl From<EscrowError> for WebhookError {
    fn from(e: EscrowError) -> Self {
        WebhookError::ProcessingFailed(e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct EventAck {
    pub received: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_processed: bool,
}

/// Event kinds this service settles. The dispatch table lives in
/// [`dispatch`]; anything unrecognized is acknowledged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    HoldSucceeded,
    HoldFailed,
    HoldCancelled,
    HoldRequiresAction,
    HoldProcessing,
    PayoutMethodAttached,
    PayoutMethodDetached,
    AccountUpdated,
    ChargeRefunded,
    DisputeCreated,
    TransferCreated,
    TransferFailed,
    PayoutPaid,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Option<Self> {
        match event_type {
            "hold.succeeded" => Some(Self::HoldSucceeded),
            "hold.failed" => Some(Self::HoldFailed),
            "hold.canceled" => Some(Self::HoldCancelled),
            "hold.requires_action" => Some(Self::HoldRequiresAction),
            "hold.processing" => Some(Self::HoldProcessing),
            "payout_method.attached" => Some(Self::PayoutMethodAttached),
            "payout_method.detached" => Some(Self::PayoutMethodDetached),
            "account.updated" => Some(Self::AccountUpdated),
            "charge.refunded" => Some(Self::ChargeRefunded),
            "dispute.created" => Some(Self::DisputeCreated),
            "transfer.created" => Some(Self::TransferCreated),
            "transfer.failed" => Some(Self::TransferFailed),
            "payout.paid" => Some(Self::PayoutPaid),
            _ => None,
        }
    }
}

/// Full intake path for one delivery.
pub async fn handle_event(
    conn: &mut AsyncPgConnection,
    signature_header: Option<&str>,
    payload: &[u8],
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<EventAck, WebhookError> {
    verify_signature(payload, signature_header, webhook_secret, tolerance_seconds)?;

    let event: ProcessorEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedPayload(format!("JSON parse error: {e}")))?;

    debug!(event_id = %event.id, event_type = %event.event_type, "processing webhook event");

    // Idempotency fence: a recorded event has fully committed its side
    // effects; acknowledge without re-running anything.
    let seen = webhook_events::table
        .find(&event.id)
        .select(webhook_events::event_id)
        .first::<String>(conn)
        .await
        .optional()
        .map_err(|e| WebhookError::ProcessingFailed(e.to_string()))?;
    if seen.is_some() {
        info!(event_id = %event.id, "event already processed, skipping");
        return Ok(EventAck {
            received: true,
            already_processed: true,
        });
    }

    match EventKind::from_type(&event.event_type) {
        Some(kind) => events::dispatch(conn, kind, &event).await?,
        None => {
            info!(event_type = %event.event_type, "ignoring unsupported event type");
        }
    }

    // Recorded only after every side effect succeeded. The handlers are
    // row-level idempotent, so a crash between their commit and this
    // insert is safe: redelivery replays onto keyed upserts.
    let record = NewWebhookEvent {
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
    };
    diesel::insert_into(webhook_events::table)
        .values(&record)
        .on_conflict(webhook_events::event_id)
        .do_nothing()
        .execute(conn)
        .await
        .map_err(|e| WebhookError::ProcessingFailed(e.to_string()))?;

    info!(event_id = %event.id, event_type = %event.event_type, "event processed");

    Ok(EventAck {
        received: true,
        already_processed: false,
    })
}

/// Verify the `t=<unix>,v1=<hex>` signature header: HMAC-SHA256 over
/// `"{timestamp}.{payload}"` with the shared secret, constant-time
/// comparison, bounded clock skew.
pub fn verify_signature(
    payload: &[u8],
    signature_header: Option<&str>,
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<(), WebhookError> {
    if webhook_secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    let header = signature_header.ok_or(WebhookError::MissingSignature)?;

    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() != 2 {
            continue;
        }
        match kv[0] {
            "t" => timestamp = kv[1].parse().ok(),
            "v1" => signatures.push(kv[1]),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        WebhookError::InvalidSignature("missing timestamp in signature header".to_string())
    })?;
    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature("no v1 signature found".to_string()));
    }

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WebhookError::InvalidSignature(format!("system time error: {e}")))?
        .as_secs() as i64;

    let time_diff = (current_time - timestamp).abs();
    if time_diff > tolerance_seconds {
        return Err(WebhookError::TimestampTolerance(format!(
            "timestamp {timestamp} differs from current time {current_time} by {time_diff}s (tolerance: {tolerance_seconds}s)"
        )));
    }

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("HMAC init error: {e}")))?;
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let valid = signatures.iter().any(|sig| {
        expected.as_bytes().len() == sig.as_bytes().len()
            && expected
                .as_bytes()
                .iter()
                .zip(sig.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    });

    if !valid {
        warn!("webhook signature mismatch");
        return Err(WebhookError::InvalidSignature("signature mismatch".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_valid_signature() {
        let payload = br#"{"id":"evt_test","type":"hold.succeeded","data":{"object":{}}}"#;
        let secret = "whsec_test_secret";
        let timestamp = 1234567890i64;
        let header = format!("t={},v1={}", timestamp, sign(payload, secret, timestamp));

        let result = verify_signature(payload, Some(&header), secret, i64::MAX);
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_a_wrong_signature() {
        let payload = br#"{"id":"evt_test"}"#;
        let header = format!(
            "t=1234567890,v1={}",
            "0".repeat(64)
        );
        let result = verify_signature(payload, Some(&header), "whsec_test_secret", i64::MAX);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn rejects_a_missing_header() {
        let result = verify_signature(b"test", None, "secret", 300);
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn rejects_a_stale_timestamp() {
        let payload = b"test";
        let secret = "whsec_test_secret";
        let old = 1000i64;
        let header = format!("t={},v1={}", old, sign(payload, secret, old));

        let result = verify_signature(payload, Some(&header), secret, 300);
        assert!(matches!(result, Err(WebhookError::TimestampTolerance(_))));
    }

    #[test]
    fn rejects_an_empty_secret() {
        let result = verify_signature(b"test", Some("t=1,v1=aa"), "", 300);
        assert!(matches!(result, Err(WebhookError::MissingSecret)));
    }

    #[test]
    fn dispatch_table_covers_the_settlement_events() {
        let cases = [
            ("hold.succeeded", EventKind::HoldSucceeded),
            ("hold.failed", EventKind::HoldFailed),
            ("hold.canceled", EventKind::HoldCancelled),
            ("hold.requires_action", EventKind::HoldRequiresAction),
            ("hold.processing", EventKind::HoldProcessing),
            ("payout_method.attached", EventKind::PayoutMethodAttached),
            ("payout_method.detached", EventKind::PayoutMethodDetached),
            ("account.updated", EventKind::AccountUpdated),
            ("charge.refunded", EventKind::ChargeRefunded),
            ("dispute.created", EventKind::DisputeCreated),
            ("transfer.created", EventKind::TransferCreated),
            ("transfer.failed", EventKind::TransferFailed),
            ("payout.paid", EventKind::PayoutPaid),
        ];
        for (name, kind) in cases {
            assert_eq!(EventKind::from_type(name), Some(kind), "{name}");
        }
        assert_eq!(EventKind::from_type("balance.updated"), None);
    }

    #[test]
    fn retryable_errors_map_to_500() {
        assert_eq!(
            WebhookError::ProcessingFailed("db down".into()).status_code(),
            500
        );
        assert_eq!(WebhookError::MissingSignature.status_code(), 401);
        assert_eq!(
            WebhookError::MalformedPayload("not json".into()).status_code(),
            400
        );
    }
}
