//! Contract authorization gate. A contract goes `pending_payment →
//! active` only once the processor confirms the hold and the reserved
//! amount matches our books exactly. Any failure after that confirmation
//! releases the hold before surfacing the error — a reserved hold must
//! never be left dangling behind a failed local transition.

use crate::collab;
use crate::error::EscrowError;
use crate::models::Payment;
use crate::processor::ProcessorClient;
use crate::schema::{job_contracts, payments};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::{ContractStatus, PaymentStatus};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct AuthorizeOutcome {
    pub authorized: bool,
    pub already_authorized: bool,
}

#[derive(Debug, Serialize)]
pub struct CaptureOutcome {
    pub captured: bool,
    pub already_captured: bool,
    pub status: PaymentStatus,
}

pub async fn authorize_contract(
    conn: &mut AsyncPgConnection,
    processor: &dyn ProcessorClient,
    user_id: Uuid,
    contract_id: Uuid,
    hold_id: Option<String>,
) -> Result<AuthorizeOutcome, EscrowError> {
    let contract = collab::load_contract(conn, contract_id).await?;
    if contract.customer_id != user_id {
        return Err(EscrowError::Forbidden("Not your contract"));
    }

    if contract.status == ContractStatus::Active || contract.payment_authorized_at.is_some() {
        return Ok(AuthorizeOutcome {
            authorized: true,
            already_authorized: true,
        });
    }
    if contract.status == ContractStatus::Cancelled {
        return Err(EscrowError::conflict("Contract is cancelled"));
    }

    let hold_id = hold_id
        .or(contract.processor_hold_id.clone())
        .ok_or_else(|| {
            EscrowError::validation(
                "Contract has no authorization hold yet; create the payment first",
            )
        })?;

    let hold = processor.retrieve_hold(&hold_id).await?;
    if !hold.is_authorized() {
        return Err(EscrowError::validation(format!(
            "Hold not authorized (processor status: {})",
            hold.status
        )));
    }

    let payment = payments::table
        .filter(payments::processor_hold_id.eq(&hold_id))
        .first::<Payment>(conn)
        .await
        .optional()?
        .ok_or_else(|| EscrowError::Internal(format!("No payment record for hold {hold_id}")))?;

    // Defense against the fee state changing between hold creation and
    // confirmation: the reserved amount must match our books exactly.
    if payment.amount_cents != hold.amount {
        warn!(
            contract_id = %contract_id,
            hold_id = %hold_id,
            local = %payment.amount_cents,
            reserved = %hold.amount,
            "reserved amount mismatch, cancelling hold"
        );
        return Err(compensate(
            processor,
            &hold_id,
            EscrowError::conflict("Payment amount changed. Please retry payment."),
        )
        .await);
    }

    let activated = conn
        .transaction::<(), EscrowError, _>(|conn| {
            let hold_id = hold_id.clone();
            Box::pin(async move {
                let now = Utc::now();
                let updated = diesel::update(
                    job_contracts::table
                        .find(contract_id)
                        .filter(job_contracts::status.eq(ContractStatus::PendingPayment)),
                )
                .set((
                    job_contracts::status.eq(ContractStatus::Active),
                    job_contracts::processor_hold_id.eq(Some(hold_id)),
                    job_contracts::payment_authorized_at.eq(Some(now)),
                    job_contracts::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;
                if updated == 0 {
                    return Err(EscrowError::conflict("Contract state changed, retry"));
                }

                diesel::update(
                    payments::table
                        .find(payment.id)
                        .filter(payments::status.eq_any([
                            PaymentStatus::PendingHold,
                            PaymentStatus::Pending,
                            PaymentStatus::Processing,
                            PaymentStatus::RequiresAction,
                        ])),
                )
                .set((
                    payments::status.eq(PaymentStatus::Authorized),
                    payments::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                Ok(())
            })
        })
        .await;

    if let Err(e) = activated {
        // The hold is confirmed but the local transition failed: release
        // the funds before reporting the error.
        return Err(compensate(processor, &hold_id, e).await);
    }

    info!(contract_id = %contract_id, hold_id = %hold_id, "contract activated, escrow authorized");

    Ok(AuthorizeOutcome {
        authorized: true,
        already_authorized: false,
    })
}

/// Capture the reserved funds once the job is done. The authoritative
/// `succeeded` flip still comes from the processor's asynchronous event.
pub async fn capture_contract_payment(
    conn: &mut AsyncPgConnection,
    processor: &dyn ProcessorClient,
    user_id: Uuid,
    contract_id: Uuid,
) -> Result<CaptureOutcome, EscrowError> {
    let contract = collab::load_contract(conn, contract_id).await?;
    if contract.customer_id != user_id {
        return Err(EscrowError::Forbidden("Not your contract"));
    }

    if contract.payment_captured_at.is_some() {
        return Ok(CaptureOutcome {
            captured: true,
            already_captured: true,
            status: PaymentStatus::Processing,
        });
    }

    if contract.payment_authorized_at.is_none() {
        return Err(EscrowError::validation("Contract payment not authorized yet"));
    }

    let job = collab::load_job(conn, contract.job_id).await?;
    if job.status != "completed" {
        return Err(EscrowError::conflict("Job must be completed before capture"));
    }

    let hold_id = contract
        .processor_hold_id
        .clone()
        .ok_or_else(|| EscrowError::Internal("Authorized contract without a hold id".into()))?;

    let hold = processor.capture_hold(&hold_id).await?;
    let mapped = hold.internal_status();

    let now = Utc::now();
    diesel::update(job_contracts::table.find(contract_id))
        .set((
            job_contracts::payment_captured_at.eq(Some(now)),
            job_contracts::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;

    // Advance the payment unless the webhook already settled it.
    diesel::update(
        payments::table
            .filter(payments::processor_hold_id.eq(&hold_id))
            .filter(payments::status.eq_any([
                PaymentStatus::Authorized,
                PaymentStatus::Pending,
                PaymentStatus::Processing,
            ])),
    )
    .set((payments::status.eq(mapped), payments::updated_at.eq(now)))
    .execute(conn)
    .await?;

    info!(contract_id = %contract_id, hold_id = %hold_id, status = %mapped, "hold captured");

    Ok(CaptureOutcome {
        captured: true,
        already_captured: false,
        status: mapped,
    })
}

/// Cancel the hold after a failed local transition. If cancellation itself
/// fails, money is in an inconsistent state: escalate as a compensation
/// failure, which is operator-visible by contract.
async fn compensate(
    processor: &dyn ProcessorClient,
    hold_id: &str,
    cause: EscrowError,
) -> EscrowError {
    match processor.cancel_hold(hold_id).await {
        Ok(_) => {
            info!(hold_id = %hold_id, "hold cancelled after failed local transition");
            cause
        }
        Err(cancel_err) => EscrowError::Compensation {
            hold_id: hold_id.to_string(),
            reason: format!("{cause}; cancellation failed: {cancel_err}"),
        },
    }
}
