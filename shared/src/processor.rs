//! Minimal wire types for the payment processor's REST API and webhook
//! envelope. Only the fields this service actually reads are modeled; the
//! processor is free to send more.

use crate::money::Cents;
use crate::status::PaymentStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request to reserve funds on the customer's payment method without
/// capturing them. `capture_method` is always `manual`; capture is a
/// separate, explicit step tied to job completion.
#[derive(Debug, Clone, Serialize)]
pub struct HoldRequest {
    pub amount: Cents,
    pub currency: String,
    pub capture_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    /// Connected account that receives the mechanic's share on capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_amount: Option<Cents>,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An authorization hold as the processor reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub id: String,
    pub status: String,
    pub amount: Cents,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}

impl Hold {
    /// Processor hold states map onto the payment state machine; anything
    /// unrecognized stays `pending` until a webhook settles it.
    pub fn internal_status(&self) -> PaymentStatus {
        match self.status.as_str() {
            "requires_capture" => PaymentStatus::Authorized,
            "requires_action" => PaymentStatus::RequiresAction,
            "processing" => PaymentStatus::Processing,
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        }
    }

    /// Funds are reserved and waiting for an explicit capture.
    pub fn is_authorized(&self) -> bool {
        self.status == "requires_capture"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub amount: Cents,
    pub currency: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub amount: Cents,
    pub currency: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversed: Option<bool>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub amount: Cents,
    pub currency: String,
    pub destination: String,
    pub status: String,
    /// Unix seconds when the funds land in the bank account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrival_date: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorCharge {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_refunded: Option<Cents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub charge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethodRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
}

/// Webhook event envelope: `{id, type, data: {object}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub livemode: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProcessorEvent {
    /// Decode the inner object into the expected shape for this event type.
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.object.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_status_maps_to_payment_status() {
        let mut hold = Hold {
            id: "hold_1".into(),
            status: "requires_capture".into(),
            amount: Cents(11000),
            currency: "usd".into(),
            client_secret: None,
            latest_charge: None,
            metadata: HashMap::new(),
            last_error_message: None,
        };
        assert_eq!(hold.internal_status(), PaymentStatus::Authorized);
        assert!(hold.is_authorized());

        hold.status = "requires_action".into();
        assert_eq!(hold.internal_status(), PaymentStatus::RequiresAction);

        hold.status = "requires_confirmation".into();
        assert_eq!(hold.internal_status(), PaymentStatus::Pending);
        assert!(!hold.is_authorized());
    }

    #[test]
    fn event_envelope_parses_and_decodes() {
        let raw = r#"{
            "id": "evt_42",
            "type": "hold.succeeded",
            "created": 1700000000,
            "data": {"object": {"id": "hold_9", "status": "succeeded",
                                 "amount": 11000, "currency": "usd"}}
        }"#;
        let evt: ProcessorEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(evt.id, "evt_42");
        assert_eq!(evt.event_type, "hold.succeeded");
        let hold: Hold = evt.object().unwrap();
        assert_eq!(hold.amount, Cents(11000));
        assert_eq!(hold.internal_status(), PaymentStatus::Succeeded);
    }
}
