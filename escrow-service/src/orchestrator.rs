//! Payment intent orchestration: one open payment per job, promo applied
//! exactly once, then a manual-capture authorization hold for the net
//! amount. The hold idempotency key is derived from the payment row id, so
//! a client retry can never create a second hold.

use crate::collab;
use crate::error::EscrowError;
use crate::models::{NewPayment, Payment};
use crate::processor::ProcessorClient;
use crate::promo::{self, PromoOutcome};
use crate::schema::payments;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::{Cents, Hold, HoldRequest, PaymentStatus, CURRENCY};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Processor minimum charge.
pub const MIN_CHARGE_CENTS: Cents = Cents(50);

#[derive(Debug, Serialize)]
pub struct PaymentHandle {
    pub payment_id: Uuid,
    pub hold_id: String,
    pub client_secret: Option<String>,
    pub status: PaymentStatus,
    pub amount_cents: Cents,
    pub original_amount_cents: Cents,
    pub discount_cents: Cents,
    pub platform_fee_cents: Cents,
    pub promo_applied: bool,
    pub already_exists: bool,
}

/// Idempotent by job: an existing open payment with a hold is returned
/// unchanged; an open payment that died before hold creation is resumed.
pub async fn create_or_get_payment(
    conn: &mut AsyncPgConnection,
    processor: &dyn ProcessorClient,
    customer_id: Uuid,
    job_id: Uuid,
) -> Result<PaymentHandle, EscrowError> {
    let job = collab::load_job_for_customer(conn, job_id, customer_id).await?;
    collab::require_payable(&job)?;
    let invoice = collab::load_locked_invoice(conn, job_id).await?;
    let mechanic_id = job
        .mechanic_id
        .ok_or_else(|| EscrowError::validation("Job has no assigned mechanic"))?;
    let account = collab::load_ready_mechanic_account(conn, mechanic_id).await?;

    if invoice.total_cents < MIN_CHARGE_CENTS {
        return Err(EscrowError::validation(
            "Payment amount too low (minimum $0.50)",
        ));
    }

    let payment = match open_payment_for_job(conn, job_id).await? {
        Some(existing) => {
            if let Some(hold_id) = existing.processor_hold_id.clone() {
                // Hold already issued: hand back the same payment rather
                // than creating a duplicate reservation.
                let hold = processor.retrieve_hold(&hold_id).await?;
                return Ok(handle_for(&existing, &hold, true));
            }
            // A previous attempt inserted the row but never reached the
            // processor; resume it.
            existing
        }
        None => insert_payment(conn, &job, &invoice, customer_id, mechanic_id).await?,
    };

    // Apply at most one promo credit. Failure of the promo unit degrades
    // to "no promo"; it must not fail the payment.
    let promo = match promo::apply_promo(conn, payment.id, customer_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(payment_id = %payment.id, error = %e, "promo application failed, continuing without promo");
            PromoOutcome::skipped(payment.platform_fee_cents, "Promo unavailable")
        }
    };

    // Reload for post-discount amounts.
    let payment: Payment = payments::table.find(payment.id).first(conn).await?;
    let net = payment.amount_cents.require_non_negative()?;
    if net < MIN_CHARGE_CENTS {
        return Err(EscrowError::Internal(format!(
            "net charge {net} below processor minimum after discount"
        )));
    }

    let request = hold_request(&payment, &job.title, &account.processor_account_id, &promo);
    let idempotency_key = format!("hold_{}_v1", payment.id);

    let hold = match processor.create_hold(&request, &idempotency_key).await {
        Ok(hold) => hold,
        Err(e) => {
            // Surface the rejection but leave the payment non-terminal;
            // the processor's asynchronous event is the authority on
            // whether this attempt is dead.
            diesel::update(payments::table.find(payment.id))
                .set((
                    payments::error_message.eq(Some(e.reason())),
                    payments::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            return Err(e.into());
        }
    };

    persist_hold(conn, payment.id, &hold).await?;

    info!(
        payment_id = %payment.id,
        hold_id = %hold.id,
        amount = %payment.amount_cents,
        fee = %payment.platform_fee_cents,
        promo_applied = promo.applied,
        "authorization hold created"
    );

    let payment: Payment = payments::table.find(payment.id).first(conn).await?;
    Ok(handle_for(&payment, &hold, false))
}

async fn open_payment_for_job(
    conn: &mut AsyncPgConnection,
    job_id: Uuid,
) -> Result<Option<Payment>, EscrowError> {
    let payment = payments::table
        .filter(payments::job_id.eq(job_id))
        .filter(payments::status.eq_any(PaymentStatus::NON_TERMINAL))
        .order(payments::created_at.desc())
        .first::<Payment>(conn)
        .await
        .optional()?;
    Ok(payment)
}

async fn insert_payment(
    conn: &mut AsyncPgConnection,
    job: &crate::models::Job,
    invoice: &crate::models::JobInvoice,
    customer_id: Uuid,
    mechanic_id: Uuid,
) -> Result<Payment, EscrowError> {
    let row = NewPayment {
        id: Uuid::new_v4(),
        job_id: job.id,
        invoice_id: Some(invoice.id),
        customer_id,
        mechanic_id,
        amount_cents: invoice.total_cents,
        fee_before_discount_cents: invoice.platform_fee_cents,
        platform_fee_cents: invoice.platform_fee_cents,
        mechanic_net_cents: invoice.mechanic_net_cents,
        status: PaymentStatus::PendingHold,
    };

    let inserted = diesel::insert_into(payments::table)
        .values(&row)
        .get_result::<Payment>(conn)
        .await;

    match inserted {
        Ok(payment) => Ok(payment),
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            // Lost the one-open-payment-per-job race; adopt the winner.
            open_payment_for_job(conn, job.id)
                .await?
                .ok_or_else(|| EscrowError::conflict("Concurrent payment attempt, retry"))
        }
        Err(e) => Err(e.into()),
    }
}

fn hold_request(
    payment: &Payment,
    job_title: &str,
    processor_account_id: &str,
    promo: &PromoOutcome,
) -> HoldRequest {
    let mut metadata = HashMap::new();
    metadata.insert("payment_id".to_string(), payment.id.to_string());
    metadata.insert("job_id".to_string(), payment.job_id.to_string());
    metadata.insert("customer_id".to_string(), payment.customer_id.to_string());
    metadata.insert("mechanic_id".to_string(), payment.mechanic_id.to_string());
    metadata.insert(
        "mechanic_account_id".to_string(),
        processor_account_id.to_string(),
    );
    metadata.insert(
        "mechanic_net_cents".to_string(),
        payment.mechanic_net_cents.0.to_string(),
    );
    metadata.insert(
        "platform_fee_cents".to_string(),
        payment.platform_fee_cents.0.to_string(),
    );
    metadata.insert(
        "discount_cents".to_string(),
        promo.discount_cents.0.to_string(),
    );
    if let Some(invoice_id) = payment.invoice_id {
        metadata.insert("invoice_id".to_string(), invoice_id.to_string());
    }

    HoldRequest {
        amount: payment.amount_cents,
        currency: CURRENCY.to_string(),
        capture_method: "manual".to_string(),
        customer: None,
        payment_method: None,
        transfer_destination: Some(processor_account_id.to_string()),
        transfer_amount: Some(payment.mechanic_net_cents),
        metadata,
        description: Some(format!(
            "Job #{}: {}",
            &payment.job_id.to_string()[..8],
            job_title
        )),
    }
}

async fn persist_hold(
    conn: &mut AsyncPgConnection,
    payment_id: Uuid,
    hold: &Hold,
) -> Result<(), EscrowError> {
    diesel::update(payments::table.find(payment_id))
        .set((
            payments::processor_hold_id.eq(Some(hold.id.clone())),
            payments::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    // Only advance out of pending_hold; the asynchronous webhook path may
    // already have settled this row and must not be overwritten.
    diesel::update(
        payments::table
            .find(payment_id)
            .filter(payments::status.eq(PaymentStatus::PendingHold)),
    )
    .set(payments::status.eq(hold.internal_status()))
    .execute(conn)
    .await?;

    Ok(())
}

fn handle_for(payment: &Payment, hold: &Hold, already_exists: bool) -> PaymentHandle {
    // A corrupted fee pair would have failed earlier; fall back to the
    // stored amount rather than erroring in a read path.
    let discount = payment
        .fee_before_discount_cents
        .checked_sub(payment.platform_fee_cents)
        .unwrap_or(Cents::ZERO);
    let original_amount = payment
        .amount_cents
        .checked_add(discount)
        .unwrap_or(payment.amount_cents);

    PaymentHandle {
        payment_id: payment.id,
        hold_id: hold.id.clone(),
        client_secret: hold.client_secret.clone(),
        status: payment.status,
        amount_cents: payment.amount_cents,
        original_amount_cents: original_amount,
        discount_cents: discount,
        platform_fee_cents: payment.platform_fee_cents,
        promo_applied: discount.is_positive(),
        already_exists,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promo::discount_for;
    use shared::CreditKind;

    // Quote $100.00 with a $15.00 platform fee: the customer total is
    // $115.00 before any credit.
    const QUOTE: Cents = Cents(10_000);
    const FEE: Cents = Cents(1_500);

    #[test]
    fn full_waiver_charges_the_quote_alone() {
        let total = QUOTE.checked_add(FEE).unwrap();
        let discount = discount_for(CreditKind::FullWaiver, FEE);
        assert_eq!(discount, Cents(1_500));
        assert_eq!(total.checked_sub(discount).unwrap(), Cents(10_000));
        assert_eq!(FEE.checked_sub(discount).unwrap(), Cents::ZERO);
    }

    #[test]
    fn partial_discount_takes_five_dollars_off() {
        let total = QUOTE.checked_add(FEE).unwrap();
        let discount = discount_for(CreditKind::PartialDiscount, FEE);
        assert_eq!(discount, Cents(500));
        assert_eq!(total.checked_sub(discount).unwrap(), Cents(11_000));
        assert_eq!(FEE.checked_sub(discount).unwrap(), Cents(1_000));
    }

    #[test]
    fn a_discount_can_never_exceed_the_total() {
        // The fee is part of the total, and every discount is capped at
        // the fee, so net < 0 is unreachable through the public paths.
        let discount = discount_for(CreditKind::PartialDiscount, Cents(40));
        assert_eq!(discount, Cents(40));
        assert!(Cents(40).checked_sub(Cents(41)).is_err());
    }

    #[test]
    fn minimum_charge_guard() {
        assert!(Cents(49) < MIN_CHARGE_CENTS);
        assert!(Cents(50) >= MIN_CHARGE_CENTS);
    }
}
