use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::{Cents, ContractStatus, CreditKind, LedgerStatus, PaymentStatus, PromotionKind};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Serialize)]
#[diesel(table_name = crate::schema::payments)]
pub struct Payment {
    pub id: Uuid,
    pub job_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub mechanic_id: Uuid,
    pub amount_cents: Cents,
    pub fee_before_discount_cents: Cents,
    pub platform_fee_cents: Cents,
    pub mechanic_net_cents: Cents,
    pub processor_hold_id: Option<String>,
    pub processor_charge_id: Option<String>,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub id: Uuid,
    pub job_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub mechanic_id: Uuid,
    pub amount_cents: Cents,
    pub fee_before_discount_cents: Cents,
    pub platform_fee_cents: Cents,
    pub mechanic_net_cents: Cents,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::promo_credits)]
pub struct PromoCredit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: CreditKind,
    pub remaining_uses: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::promo_credits)]
pub struct NewPromoCredit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: CreditKind,
    pub remaining_uses: i32,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::promo_applications)]
pub struct PromoApplication {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub credit_id: Uuid,
    pub discount_cents: Cents,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::promo_applications)]
pub struct NewPromoApplication {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub credit_id: Uuid,
    pub discount_cents: Cents,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::webhook_events)]
pub struct NewWebhookEvent {
    pub event_id: String,
    pub event_type: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::ledger_entries)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub mechanic_id: Uuid,
    pub payment_id: Uuid,
    pub job_id: Uuid,
    pub processor_account_id: String,
    pub amount_cents: Cents,
    pub status: LedgerStatus,
    pub available_for_transfer_at: DateTime<Utc>,
    pub processor_transfer_id: Option<String>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub processor_payout_id: Option<String>,
    pub paid_out_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::ledger_entries)]
pub struct NewLedgerEntry {
    pub id: Uuid,
    pub mechanic_id: Uuid,
    pub payment_id: Uuid,
    pub job_id: Uuid,
    pub processor_account_id: String,
    pub amount_cents: Cents,
    pub status: LedgerStatus,
    pub available_for_transfer_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::transfers)]
pub struct TransferRecord {
    pub id: Uuid,
    pub mechanic_id: Uuid,
    pub processor_account_id: String,
    pub processor_transfer_id: String,
    pub amount_cents: Cents,
    pub status: String,
    pub ledger_entry_ids: Vec<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::transfers)]
pub struct NewTransferRecord {
    pub id: Uuid,
    pub mechanic_id: Uuid,
    pub processor_account_id: String,
    pub processor_transfer_id: String,
    pub amount_cents: Cents,
    pub status: String,
    pub ledger_entry_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::invitations)]
pub struct Invitation {
    pub id: Uuid,
    pub inviter_id: Uuid,
    pub invited_id: Uuid,
    pub invited_role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::invitation_awards)]
pub struct NewInvitationAward {
    pub id: Uuid,
    pub invitation_id: Uuid,
    pub invited_id: Uuid,
    pub payment_id: Uuid,
    pub processor_event_id: String,
    pub award_kind: CreditKind,
}

#[derive(Debug, Clone, Queryable, Serialize)]
#[diesel(table_name = crate::schema::notifications)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::promotions)]
pub struct Promotion {
    pub id: Uuid,
    pub code: String,
    pub kind: PromotionKind,
    pub description: Option<String>,
    pub percent_off: Option<i32>,
    pub amount_cents: Option<Cents>,
    pub minimum_amount_cents: Option<Cents>,
    pub max_redemptions: Option<i32>,
    pub max_redemptions_per_user: i32,
    pub current_redemptions: i32,
    pub active: bool,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::promotion_redemptions)]
pub struct NewPromotionRedemption {
    pub id: Uuid,
    pub promotion_id: Uuid,
    pub user_id: Uuid,
    pub discount_cents: Cents,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::jobs)]
pub struct Job {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub mechanic_id: Option<Uuid>,
    pub title: String,
    pub status: String,
    pub mechanic_verified_at: Option<DateTime<Utc>>,
    pub customer_verified_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::job_invoices)]
pub struct JobInvoice {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: String,
    pub total_cents: Cents,
    pub platform_fee_cents: Cents,
    pub mechanic_net_cents: Cents,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::job_contracts)]
pub struct JobContract {
    pub id: Uuid,
    pub job_id: Uuid,
    pub customer_id: Uuid,
    pub mechanic_id: Uuid,
    pub status: ContractStatus,
    pub total_cents: Cents,
    pub platform_fee_cents: Cents,
    pub processor_hold_id: Option<String>,
    pub payment_authorized_at: Option<DateTime<Utc>>,
    pub payment_captured_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::mechanic_accounts)]
pub struct MechanicAccount {
    pub mechanic_id: Uuid,
    pub processor_account_id: String,
    pub onboarding_completed: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
