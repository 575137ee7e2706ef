//! Typed lookups over collaborator-owned tables. These systems (job
//! intake, invoicing, mechanic onboarding) live outside this service; we
//! read their state to validate a payment attempt and flip a handful of
//! settlement fields on their rows.

use crate::error::EscrowError;
use crate::models::{Job, JobContract, JobInvoice, MechanicAccount};
use crate::schema::{job_contracts, job_invoices, jobs, mechanic_accounts};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

pub async fn load_job(
    conn: &mut AsyncPgConnection,
    job_id: Uuid,
) -> Result<Job, EscrowError> {
    jobs::table
        .find(job_id)
        .first::<Job>(conn)
        .await
        .optional()?
        .ok_or_else(|| EscrowError::not_found("Job not found"))
}

pub async fn load_job_for_customer(
    conn: &mut AsyncPgConnection,
    job_id: Uuid,
    customer_id: Uuid,
) -> Result<Job, EscrowError> {
    let job = load_job(conn, job_id).await?;
    if job.customer_id != customer_id {
        return Err(EscrowError::Forbidden("Only the customer can initiate payment"));
    }
    Ok(job)
}

/// A job is payable once both parties verified completion.
pub fn require_payable(job: &Job) -> Result<(), EscrowError> {
    if job.status != "completed" {
        return Err(EscrowError::validation("Job not completed yet"));
    }
    if job.mechanic_verified_at.is_none() || job.customer_verified_at.is_none() {
        return Err(EscrowError::validation(
            "Both parties must verify completion",
        ));
    }
    Ok(())
}

/// Only a locked invoice has final totals; drafts are still editable by the
/// invoicing flow and must not be charged.
pub async fn load_locked_invoice(
    conn: &mut AsyncPgConnection,
    job_id: Uuid,
) -> Result<JobInvoice, EscrowError> {
    let invoice = job_invoices::table
        .filter(job_invoices::job_id.eq(job_id))
        .first::<JobInvoice>(conn)
        .await
        .optional()?
        .ok_or_else(|| EscrowError::not_found("Invoice not found"))?;
    if invoice.status != "locked" {
        return Err(EscrowError::validation("Invoice not locked"));
    }
    Ok(invoice)
}

pub async fn load_ready_mechanic_account(
    conn: &mut AsyncPgConnection,
    mechanic_id: Uuid,
) -> Result<MechanicAccount, EscrowError> {
    let account = mechanic_accounts::table
        .find(mechanic_id)
        .first::<MechanicAccount>(conn)
        .await
        .optional()?
        .ok_or_else(|| EscrowError::validation("Mechanic not onboarded to the payment processor"))?;
    if !account.onboarding_completed || !account.charges_enabled {
        return Err(EscrowError::validation(
            "Mechanic payout account not ready for payments",
        ));
    }
    Ok(account)
}

pub async fn load_contract(
    conn: &mut AsyncPgConnection,
    contract_id: Uuid,
) -> Result<JobContract, EscrowError> {
    job_contracts::table
        .find(contract_id)
        .first::<JobContract>(conn)
        .await
        .optional()?
        .ok_or_else(|| EscrowError::not_found("Contract not found"))
}
