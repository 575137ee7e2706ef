//! Per-event-type settlement handlers. Every handler is independently
//! idempotent at the row level: updates are keyed by processor identifiers
//! and inserts are fenced by unique constraints, so a replay after a
//! partial dedup-record failure converges on the same state.
//!
//! Handlers never assume the synchronous orchestration path has already
//! written its side of the row; lookups go through the processor's
//! reference fields with a metadata fallback.

use crate::error::EscrowError;
use crate::invitation;
use crate::ledger;
use crate::models::Payment;
use crate::notify;
use crate::schema::{job_invoices, jobs, mechanic_accounts, payments, transfers};
use crate::webhook::EventKind;
use chrono::{DateTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::json;
use shared::{
    ConnectedAccount, Dispute, Hold, PaymentMethodRef, Payout, PaymentStatus, ProcessorCharge,
    ProcessorEvent, Transfer,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Payment states that have not yet settled one way or the other.
const OPEN_STATES: [PaymentStatus; 5] = [
    PaymentStatus::PendingHold,
    PaymentStatus::Pending,
    PaymentStatus::Processing,
    PaymentStatus::RequiresAction,
    PaymentStatus::Authorized,
];

pub async fn dispatch(
    conn: &mut AsyncPgConnection,
    kind: EventKind,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    match kind {
        EventKind::HoldSucceeded => hold_succeeded(conn, event).await,
        EventKind::HoldFailed => hold_failed(conn, event).await,
        EventKind::HoldCancelled => hold_cancelled(conn, event).await,
        EventKind::HoldRequiresAction => {
            hold_status_update(conn, event, PaymentStatus::RequiresAction).await
        }
        EventKind::HoldProcessing => {
            hold_status_update(conn, event, PaymentStatus::Processing).await
        }
        EventKind::PayoutMethodAttached => payout_method_changed(conn, event, true).await,
        EventKind::PayoutMethodDetached => payout_method_changed(conn, event, false).await,
        EventKind::AccountUpdated => account_updated(conn, event).await,
        EventKind::ChargeRefunded => charge_refunded(conn, event).await,
        EventKind::DisputeCreated => dispute_created(conn, event).await,
        EventKind::TransferCreated => transfer_created(conn, event).await,
        EventKind::TransferFailed => transfer_failed(conn, event).await,
        EventKind::PayoutPaid => payout_paid(conn, event).await,
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    event: &ProcessorEvent,
    what: &str,
) -> Result<T, EscrowError> {
    event
        .object()
        .map_err(|e| EscrowError::Internal(format!("malformed {what} object in {}: {e}", event.id)))
}

/// Settlement timestamps come from the event itself when the processor
/// provides one; redelivery then lands on the same ledger release slot.
fn event_time(event: &ProcessorEvent) -> DateTime<Utc> {
    event
        .created
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Find the payment a hold event refers to. Primary key is the stored hold
/// id; the metadata fallback covers the interleaving where this event
/// lands before the orchestrator persisted the hold id, in which case the
/// id is backfilled here.
async fn find_payment_for_hold(
    conn: &mut AsyncPgConnection,
    hold: &Hold,
) -> Result<Option<Payment>, EscrowError> {
    let by_hold = payments::table
        .filter(payments::processor_hold_id.eq(&hold.id))
        .first::<Payment>(conn)
        .await
        .optional()?;
    if by_hold.is_some() {
        return Ok(by_hold);
    }

    let Some(payment_id) = hold
        .metadata
        .get("payment_id")
        .and_then(|v| v.parse::<Uuid>().ok())
    else {
        return Ok(None);
    };

    let by_id = payments::table
        .find(payment_id)
        .first::<Payment>(conn)
        .await
        .optional()?;

    if let Some(payment) = &by_id {
        if payment.processor_hold_id.is_none() {
            diesel::update(payments::table.find(payment.id))
                .set((
                    payments::processor_hold_id.eq(Some(hold.id.clone())),
                    payments::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
        }
    }

    Ok(by_id)
}

async fn find_payment_for_charge(
    conn: &mut AsyncPgConnection,
    charge: &ProcessorCharge,
) -> Result<Option<Payment>, EscrowError> {
    let by_charge = payments::table
        .filter(payments::processor_charge_id.eq(&charge.id))
        .first::<Payment>(conn)
        .await
        .optional()?;
    if by_charge.is_some() {
        return Ok(by_charge);
    }

    let Some(hold_id) = &charge.payment_intent else {
        return Ok(None);
    };
    Ok(payments::table
        .filter(payments::processor_hold_id.eq(hold_id))
        .first::<Payment>(conn)
        .await
        .optional()?)
}

async fn hold_succeeded(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let hold: Hold = decode(event, "hold")?;

    let Some(payment) = find_payment_for_hold(conn, &hold).await? else {
        warn!(hold_id = %hold.id, "hold succeeded for unknown payment, nothing to settle");
        return Ok(());
    };

    let payment_id = payment.id;
    let account_id = mechanic_account_id(conn, &payment, &hold).await?;
    let event_id = event.id.clone();
    let settled_at = event_time(event);

    conn.transaction::<(), EscrowError, _>(|conn| {
        Box::pin(async move {
            let now = settled_at;

            // First settle wins; replays see zero rows here and stay quiet.
            let newly_settled = diesel::update(
                payments::table
                    .find(payment.id)
                    .filter(payments::status.ne(PaymentStatus::Succeeded)),
            )
            .set((
                payments::status.eq(PaymentStatus::Succeeded),
                payments::processor_charge_id.eq(hold.latest_charge.clone()),
                payments::paid_at.eq(Some(now)),
                payments::updated_at.eq(now),
            ))
            .execute(conn)
            .await?
                > 0;

            if let Some(invoice_id) = payment.invoice_id {
                diesel::update(job_invoices::table.find(invoice_id))
                    .set((
                        job_invoices::status.eq("paid"),
                        job_invoices::paid_at.eq(Some(now)),
                    ))
                    .execute(conn)
                    .await?;
            }

            diesel::update(jobs::table.find(payment.job_id))
                .set((
                    jobs::status.eq("paid"),
                    jobs::paid_at.eq(Some(now)),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

            ledger::post_earning(conn, &payment, &account_id, now).await?;

            invitation::maybe_award(conn, &event_id, &payment).await?;

            if newly_settled {
                notify::enqueue(
                    conn,
                    payment.customer_id,
                    "payment_succeeded",
                    "Payment Successful",
                    "Your payment has been processed successfully.".to_string(),
                    json!({
                        "job_id": payment.job_id,
                        "payment_id": payment.id,
                        "charge_id": hold.latest_charge,
                    }),
                )
                .await?;

                notify::enqueue(
                    conn,
                    payment.mechanic_id,
                    "payment_received",
                    "Payment Received",
                    format!("You received {} for this job.", payment.mechanic_net_cents),
                    json!({
                        "job_id": payment.job_id,
                        "payment_id": payment.id,
                        "amount_cents": payment.mechanic_net_cents,
                    }),
                )
                .await?;
            }

            Ok(())
        })
    })
    .await?;

    info!(payment_id = %payment_id, event_id = %event.id, "payment settled as succeeded");
    Ok(())
}

/// The connected account receiving this payment's transfer: taken from the
/// hold metadata when present, otherwise from the mechanic's account row.
async fn mechanic_account_id(
    conn: &mut AsyncPgConnection,
    payment: &Payment,
    hold: &Hold,
) -> Result<String, EscrowError> {
    if let Some(id) = hold.metadata.get("mechanic_account_id") {
        if !id.is_empty() {
            return Ok(id.clone());
        }
    }
    mechanic_accounts::table
        .find(payment.mechanic_id)
        .select(mechanic_accounts::processor_account_id)
        .first::<String>(conn)
        .await
        .optional()?
        .ok_or_else(|| {
            EscrowError::Internal(format!(
                "no payout account on record for mechanic {}",
                payment.mechanic_id
            ))
        })
}

async fn hold_failed(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let hold: Hold = decode(event, "hold")?;

    let Some(payment) = find_payment_for_hold(conn, &hold).await? else {
        warn!(hold_id = %hold.id, "hold failed for unknown payment");
        return Ok(());
    };

    let reason = hold
        .last_error_message
        .clone()
        .unwrap_or_else(|| "Payment failed".to_string());

    let newly_failed = diesel::update(
        payments::table
            .find(payment.id)
            .filter(payments::status.eq_any(OPEN_STATES)),
    )
    .set((
        payments::status.eq(PaymentStatus::Failed),
        payments::error_message.eq(Some(reason.clone())),
        payments::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?
        > 0;

    if newly_failed {
        notify::enqueue(
            conn,
            payment.customer_id,
            "payment_failed",
            "Payment Failed",
            format!("{reason} Please try again."),
            json!({ "job_id": payment.job_id, "payment_id": payment.id }),
        )
        .await?;
    }

    info!(payment_id = %payment.id, hold_id = %hold.id, "payment marked failed");
    Ok(())
}

async fn hold_cancelled(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let hold: Hold = decode(event, "hold")?;

    let Some(payment) = find_payment_for_hold(conn, &hold).await? else {
        return Ok(());
    };

    diesel::update(
        payments::table
            .find(payment.id)
            .filter(payments::status.eq_any(OPEN_STATES)),
    )
    .set((
        payments::status.eq(PaymentStatus::Cancelled),
        payments::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    info!(payment_id = %payment.id, hold_id = %hold.id, "payment cancelled");
    Ok(())
}

/// Intermediate hold states: only move forward from earlier open states,
/// never regress a settled or authorized payment.
async fn hold_status_update(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
    status: PaymentStatus,
) -> Result<(), EscrowError> {
    let hold: Hold = decode(event, "hold")?;

    let Some(payment) = find_payment_for_hold(conn, &hold).await? else {
        return Ok(());
    };

    diesel::update(
        payments::table.find(payment.id).filter(payments::status.eq_any([
            PaymentStatus::PendingHold,
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::RequiresAction,
        ])),
    )
    .set((
        payments::status.eq(status),
        payments::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    Ok(())
}

/// Card-on-file state belongs to the profile collaborator; this service
/// only observes the events for the audit log.
async fn payout_method_changed(
    _conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
    attached: bool,
) -> Result<(), EscrowError> {
    let method: PaymentMethodRef = decode(event, "payment method")?;
    info!(
        payment_method = %method.id,
        customer = method.customer.as_deref().unwrap_or("-"),
        attached,
        "payout method change observed"
    );
    Ok(())
}

async fn account_updated(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let account: ConnectedAccount = decode(event, "account")?;

    let updated = diesel::update(
        mechanic_accounts::table
            .filter(mechanic_accounts::processor_account_id.eq(&account.id)),
    )
    .set((
        mechanic_accounts::onboarding_completed.eq(account.details_submitted),
        mechanic_accounts::charges_enabled.eq(account.charges_enabled),
        mechanic_accounts::payouts_enabled.eq(account.payouts_enabled),
        mechanic_accounts::details_submitted.eq(account.details_submitted),
        mechanic_accounts::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    info!(
        account_id = %account.id,
        charges_enabled = account.charges_enabled,
        payouts_enabled = account.payouts_enabled,
        updated,
        "connected account updated"
    );
    Ok(())
}

async fn charge_refunded(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let charge: ProcessorCharge = decode(event, "charge")?;

    let Some(payment) = find_payment_for_charge(conn, &charge).await? else {
        warn!(charge_id = %charge.id, "refund for unknown charge");
        return Ok(());
    };

    let full_refund = charge.refunded.unwrap_or(false);
    let target = if full_refund {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    };

    conn.transaction::<(), EscrowError, _>(|conn| {
        let payment = payment.clone();
        Box::pin(async move {
            let now = Utc::now();

            diesel::update(payments::table.find(payment.id))
                .set((
                    payments::status.eq(target),
                    payments::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

            if full_refund {
                if let Some(invoice_id) = payment.invoice_id {
                    diesel::update(job_invoices::table.find(invoice_id))
                        .set(job_invoices::status.eq("refunded"))
                        .execute(conn)
                        .await?;
                }

                ledger::divert_refunded(conn, payment.id).await?;

                notify::enqueue(
                    conn,
                    payment.customer_id,
                    "refund_issued",
                    "Refund Issued",
                    "Your payment has been refunded.".to_string(),
                    json!({ "job_id": payment.job_id, "payment_id": payment.id }),
                )
                .await?;
                notify::enqueue(
                    conn,
                    payment.mechanic_id,
                    "refund_issued",
                    "Payment Refunded",
                    "A payment has been refunded and will be deducted from your balance."
                        .to_string(),
                    json!({ "job_id": payment.job_id, "payment_id": payment.id }),
                )
                .await?;
            }

            Ok(())
        })
    })
    .await?;

    info!(payment_id = %payment.id, charge_id = %charge.id, full_refund, "refund processed");
    Ok(())
}

async fn dispute_created(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let dispute: Dispute = decode(event, "dispute")?;
    let charge = ProcessorCharge {
        id: dispute.charge.clone(),
        payment_intent: None,
        amount_refunded: None,
        refunded: None,
    };

    let Some(payment) = find_payment_for_charge(conn, &charge).await? else {
        warn!(charge_id = %dispute.charge, "dispute for unknown charge");
        return Ok(());
    };

    conn.transaction::<(), EscrowError, _>(|conn| {
        let payment = payment.clone();
        let dispute_id = dispute.id.clone();
        Box::pin(async move {
            let now = Utc::now();

            diesel::update(jobs::table.find(payment.job_id))
                .set((jobs::status.eq("disputed"), jobs::updated_at.eq(now)))
                .execute(conn)
                .await?;

            if let Some(invoice_id) = payment.invoice_id {
                diesel::update(job_invoices::table.find(invoice_id))
                    .set(job_invoices::status.eq("disputed"))
                    .execute(conn)
                    .await?;
            }

            let data = json!({
                "job_id": payment.job_id,
                "payment_id": payment.id,
                "dispute_id": dispute_id,
            });
            notify::enqueue(
                conn,
                payment.customer_id,
                "dispute_created",
                "Payment Dispute",
                "A dispute has been filed for this payment.".to_string(),
                data.clone(),
            )
            .await?;
            notify::enqueue(
                conn,
                payment.mechanic_id,
                "dispute_created",
                "Payment Dispute",
                "A dispute has been filed. Funds may be held pending resolution.".to_string(),
                data,
            )
            .await?;

            Ok(())
        })
    })
    .await?;

    warn!(payment_id = %payment.id, dispute_id = %dispute.id, "dispute recorded");
    Ok(())
}

async fn transfer_created(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let transfer: Transfer = decode(event, "transfer")?;

    let updated = diesel::update(
        transfers::table.filter(transfers::processor_transfer_id.eq(&transfer.id)),
    )
    .set(transfers::status.eq("succeeded"))
    .execute(conn)
    .await?;

    if updated == 0 {
        // The payout cycle records the transfer right after creating it;
        // this event outran that write. Redelivery will land it.
        warn!(transfer_id = %transfer.id, "transfer confirmed before local record exists");
    } else {
        info!(transfer_id = %transfer.id, amount = %transfer.amount, "transfer confirmed");
    }
    Ok(())
}

async fn transfer_failed(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let transfer: Transfer = decode(event, "transfer")?;
    ledger::revert_failed_transfer(conn, &transfer.id).await
}

async fn payout_paid(
    conn: &mut AsyncPgConnection,
    event: &ProcessorEvent,
) -> Result<(), EscrowError> {
    let payout: Payout = decode(event, "payout")?;

    if let Some((mechanic_id, entry_count)) = ledger::mark_paid_out(conn, &payout).await? {
        notify::enqueue(
            conn,
            mechanic_id,
            "payout_completed",
            "Payout Completed",
            format!("Your payout of {} has been sent to your bank.", payout.amount),
            json!({
                "payout_id": payout.id,
                "amount_cents": payout.amount,
                "entry_count": entry_count,
            }),
        )
        .await?;
    }

    info!(payout_id = %payout.id, amount = %payout.amount, "payout paid");
    Ok(())
}
