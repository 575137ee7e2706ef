//! Mechanic payout ledger. One entry per captured payment, released in
//! weekly batches: earnings become transferable the Monday after capture,
//! a scheduled cycle bundles due entries into one processor transfer per
//! mechanic, and the payout-paid event stamps the real-world arrival.

use crate::error::EscrowError;
use crate::models::{LedgerEntry, NewLedgerEntry, NewTransferRecord, Payment, TransferRecord};
use crate::notify;
use crate::processor::ProcessorClient;
use crate::schema::{ledger_entries, transfers};
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde_json::json;
use shared::{Cents, LedgerStatus, Payout, TransferRequest, CURRENCY};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

type DbPool = Pool<AsyncPgConnection>;

/// Earnings captured during a week are released together the following
/// Monday at 00:00 UTC. A capture landing exactly at the boundary waits
/// for the next full cycle.
pub fn next_release_time(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_until_monday = 8 - i64::from(now.weekday().number_from_monday());
    let date = (now + Duration::days(days_until_monday)).date_naive();
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Post a mechanic's net earnings for a captured payment. Idempotent per
/// payment: the unique constraint swallows handler replays.
pub async fn post_earning(
    conn: &mut AsyncPgConnection,
    payment: &Payment,
    processor_account_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, EscrowError> {
    let entry = NewLedgerEntry {
        id: Uuid::new_v4(),
        mechanic_id: payment.mechanic_id,
        payment_id: payment.id,
        job_id: payment.job_id,
        processor_account_id: processor_account_id.to_string(),
        amount_cents: payment.mechanic_net_cents,
        status: LedgerStatus::AvailableForTransfer,
        available_for_transfer_at: next_release_time(now),
    };

    let inserted = diesel::insert_into(ledger_entries::table)
        .values(&entry)
        .on_conflict(ledger_entries::payment_id)
        .do_nothing()
        .execute(conn)
        .await?;

    if inserted == 0 {
        return Ok(None);
    }

    info!(
        entry_id = %entry.id,
        mechanic_id = %payment.mechanic_id,
        amount = %payment.mechanic_net_cents,
        release_at = %entry.available_for_transfer_at,
        "earning posted to ledger"
    );
    Ok(Some(entry.id))
}

/// Divert a refunded payment's earnings out of the payout pipeline. An
/// entry that already reached `paid_out` cannot be clawed back here; it is
/// flagged for out-of-band reconciliation instead.
pub async fn divert_refunded(
    conn: &mut AsyncPgConnection,
    payment_id: Uuid,
) -> Result<(), EscrowError> {
    diesel::update(
        ledger_entries::table
            .filter(ledger_entries::payment_id.eq(payment_id))
            .filter(ledger_entries::status.eq_any([
                LedgerStatus::AvailableForTransfer,
                LedgerStatus::Transferred,
            ])),
    )
    .set(ledger_entries::status.eq(LedgerStatus::Refunded))
    .execute(conn)
    .await?;

    let paid_out = ledger_entries::table
        .filter(ledger_entries::payment_id.eq(payment_id))
        .filter(ledger_entries::status.eq(LedgerStatus::PaidOut))
        .load::<LedgerEntry>(conn)
        .await?;
    for entry in paid_out {
        error!(
            entry_id = %entry.id,
            payment_id = %payment_id,
            payout_id = entry.processor_payout_id.as_deref().unwrap_or("-"),
            "refund arrived after payout; funds already sent, manual reconciliation required"
        );
    }

    Ok(())
}

/// A failed bulk transfer returns its entries to the pool for the next
/// cycle.
pub async fn revert_failed_transfer(
    conn: &mut AsyncPgConnection,
    processor_transfer_id: &str,
) -> Result<(), EscrowError> {
    let record = transfers::table
        .filter(transfers::processor_transfer_id.eq(processor_transfer_id))
        .first::<TransferRecord>(conn)
        .await
        .optional()?;

    let Some(record) = record else {
        warn!(transfer_id = %processor_transfer_id, "transfer failure for unknown transfer");
        return Ok(());
    };

    diesel::update(transfers::table.find(record.id))
        .set((
            transfers::status.eq("failed"),
            transfers::error_message.eq(Some("Transfer failed".to_string())),
        ))
        .execute(conn)
        .await?;

    let reverted = diesel::update(
        ledger_entries::table
            .filter(ledger_entries::id.eq_any(&record.ledger_entry_ids))
            .filter(ledger_entries::status.eq(LedgerStatus::Transferred)),
    )
    .set((
        ledger_entries::status.eq(LedgerStatus::AvailableForTransfer),
        ledger_entries::processor_transfer_id.eq(None::<String>),
        ledger_entries::transferred_at.eq(None::<DateTime<Utc>>),
    ))
    .execute(conn)
    .await?;

    warn!(
        transfer_id = %processor_transfer_id,
        reverted,
        "transfer failed, entries returned for retry next cycle"
    );
    Ok(())
}

/// Mark every transferred entry for the payout's destination account as
/// paid out, stamping the real-world arrival time.
pub async fn mark_paid_out(
    conn: &mut AsyncPgConnection,
    payout: &Payout,
) -> Result<Option<(Uuid, usize)>, EscrowError> {
    let entries = ledger_entries::table
        .filter(ledger_entries::processor_account_id.eq(&payout.destination))
        .filter(ledger_entries::status.eq(LedgerStatus::Transferred))
        .filter(ledger_entries::paid_out_at.is_null())
        .load::<LedgerEntry>(conn)
        .await?;

    if entries.is_empty() {
        return Ok(None);
    }

    let paid_out_at = payout
        .arrival_date
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
    diesel::update(ledger_entries::table.filter(ledger_entries::id.eq_any(&ids)))
        .set((
            ledger_entries::status.eq(LedgerStatus::PaidOut),
            ledger_entries::processor_payout_id.eq(Some(payout.id.clone())),
            ledger_entries::paid_out_at.eq(Some(paid_out_at)),
        ))
        .execute(conn)
        .await?;

    Ok(Some((entries[0].mechanic_id, entries.len())))
}

/// Scheduled release of due earnings: one bulk transfer per mechanic per
/// cycle, idempotent per mechanic per day.
pub struct PayoutScheduler {
    pool: DbPool,
    processor: Arc<dyn ProcessorClient>,
    interval: std::time::Duration,
}

impl PayoutScheduler {
    pub fn new(
        pool: DbPool,
        processor: Arc<dyn ProcessorClient>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            pool,
            processor,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.run_cycle().await {
                error!("Error running payout cycle: {}", e);
            }
        }
    }

    async fn run_cycle(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let due = ledger_entries::table
            .filter(ledger_entries::status.eq(LedgerStatus::AvailableForTransfer))
            .filter(ledger_entries::available_for_transfer_at.le(now))
            .load::<LedgerEntry>(&mut conn)
            .await?;

        if due.is_empty() {
            return Ok(());
        }

        let mut by_mechanic: HashMap<Uuid, Vec<LedgerEntry>> = HashMap::new();
        for entry in due {
            by_mechanic.entry(entry.mechanic_id).or_default().push(entry);
        }

        let mechanics = by_mechanic.len();
        let mut succeeded = 0usize;
        for (mechanic_id, entries) in by_mechanic {
            match self
                .transfer_batch(&mut conn, mechanic_id, &entries, now)
                .await
            {
                Ok(transfer_id) => {
                    succeeded += 1;
                    info!(
                        mechanic_id = %mechanic_id,
                        transfer_id = %transfer_id,
                        entries = entries.len(),
                        "weekly transfer created"
                    );
                }
                Err(e) => {
                    // One mechanic's failure must not starve the rest of
                    // the batch; their entries stay due for next cycle.
                    error!(mechanic_id = %mechanic_id, "Failed to create transfer: {}", e);
                }
            }
        }

        info!(mechanics, succeeded, "payout cycle complete");
        Ok(())
    }

    async fn transfer_batch(
        &self,
        conn: &mut AsyncPgConnection,
        mechanic_id: Uuid,
        entries: &[LedgerEntry],
        now: DateTime<Utc>,
    ) -> Result<String, EscrowError> {
        let first = entries
            .first()
            .ok_or_else(|| EscrowError::Internal("empty transfer batch".into()))?;
        let account_id = first.processor_account_id.clone();
        let total = Cents::sum(entries.iter().map(|e| e.amount_cents))?;
        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();

        // Skip accounts the processor won't pay out to; entries stay due
        // and get picked up again once the account recovers.
        let account = self.processor.retrieve_account(&account_id).await?;
        if !account.payouts_enabled {
            return Err(EscrowError::validation(format!(
                "payouts disabled for account {account_id}"
            )));
        }

        let mut metadata = HashMap::new();
        metadata.insert("mechanic_id".to_string(), mechanic_id.to_string());
        metadata.insert("entry_count".to_string(), entries.len().to_string());
        metadata.insert("payout_date".to_string(), now.to_rfc3339());

        let request = TransferRequest {
            amount: total,
            currency: CURRENCY.to_string(),
            destination: account_id.clone(),
            description: Some(format!("Weekly payout for {} job(s)", entries.len())),
            metadata,
        };

        // Same key for the whole day: a crash between the processor call
        // and the local record replays into the same transfer.
        let idempotency_key = format!("transfer_{}_{}", mechanic_id, now.format("%Y-%m-%d"));
        let transfer = self
            .processor
            .create_transfer(&request, &idempotency_key)
            .await?;

        let record = NewTransferRecord {
            id: Uuid::new_v4(),
            mechanic_id,
            processor_account_id: account_id,
            processor_transfer_id: transfer.id.clone(),
            amount_cents: total,
            status: "pending".to_string(),
            ledger_entry_ids: ids.clone(),
        };
        diesel::insert_into(transfers::table)
            .values(&record)
            .on_conflict(transfers::processor_transfer_id)
            .do_nothing()
            .execute(conn)
            .await?;

        diesel::update(
            ledger_entries::table
                .filter(ledger_entries::id.eq_any(&ids))
                .filter(ledger_entries::status.eq(LedgerStatus::AvailableForTransfer)),
        )
        .set((
            ledger_entries::status.eq(LedgerStatus::Transferred),
            ledger_entries::processor_transfer_id.eq(Some(transfer.id.clone())),
            ledger_entries::transferred_at.eq(Some(now)),
        ))
        .execute(conn)
        .await?;

        notify::enqueue(
            conn,
            mechanic_id,
            "transfer_created",
            "Weekly Payout Initiated",
            format!("Your payout of {total} has been initiated."),
            json!({
                "transfer_id": transfer.id,
                "amount_cents": total,
                "job_count": entries.len(),
            }),
        )
        .await?;

        Ok(transfer.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    // 2024-02-05 was a Monday.
    #[test]
    fn midweek_releases_the_following_monday() {
        assert_eq!(next_release_time(at(2024, 2, 6, 15)), at(2024, 2, 12, 0)); // Tuesday
        assert_eq!(next_release_time(at(2024, 2, 9, 9)), at(2024, 2, 12, 0)); // Friday
        assert_eq!(next_release_time(at(2024, 2, 10, 23)), at(2024, 2, 12, 0)); // Saturday
    }

    #[test]
    fn sunday_releases_the_next_day() {
        assert_eq!(next_release_time(at(2024, 2, 11, 12)), at(2024, 2, 12, 0));
    }

    #[test]
    fn monday_waits_a_full_week() {
        assert_eq!(next_release_time(at(2024, 2, 5, 10)), at(2024, 2, 12, 0));
        // Exactly at the boundary still waits for the next cycle.
        assert_eq!(next_release_time(at(2024, 2, 5, 0)), at(2024, 2, 12, 0));
    }

    #[test]
    fn release_time_is_always_midnight_utc() {
        let release = next_release_time(at(2024, 7, 18, 17));
        assert_eq!(release.time(), NaiveTime::MIN);
        assert_eq!(release.weekday(), chrono::Weekday::Mon);
    }
}
