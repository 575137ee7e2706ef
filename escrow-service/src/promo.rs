//! Promo credit ledger. A credit entitles a user to a discount on the
//! platform fee: a full waiver wipes the whole fee, a partial discount
//! takes a fixed amount off. At most one credit is consumed per payment,
//! enforced by the unique `promo_applications.payment_id` constraint and a
//! guarded decrement on `remaining_uses`.

use crate::error::EscrowError;
use crate::models::{NewPromoApplication, Payment, PromoApplication, PromoCredit};
use crate::schema::{payments, promo_applications, promo_credits};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::{Cents, CreditKind};
use tracing::info;
use uuid::Uuid;

/// Fixed denomination of a partial-discount credit.
pub const PARTIAL_DISCOUNT_CENTS: Cents = Cents(500);

#[derive(Debug, Clone, Serialize)]
pub struct PromoOutcome {
    pub applied: bool,
    pub credit_kind: Option<CreditKind>,
    pub discount_cents: Cents,
    pub fee_after_cents: Cents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl PromoOutcome {
    pub fn skipped(fee: Cents, reason: &'static str) -> Self {
        Self {
            applied: false,
            credit_kind: None,
            discount_cents: Cents::ZERO,
            fee_after_cents: fee,
            reason: Some(reason),
        }
    }
}

/// Total order for credit selection: full waivers strictly before partial
/// discounts regardless of age, FIFO within a kind.
fn priority(kind: CreditKind) -> u8 {
    match kind {
        CreditKind::FullWaiver => 0,
        CreditKind::PartialDiscount => 1,
    }
}

pub fn select_credit(credits: &[PromoCredit]) -> Option<&PromoCredit> {
    credits
        .iter()
        .filter(|c| c.remaining_uses > 0)
        .min_by_key(|c| (priority(c.kind), c.created_at, c.id))
}

pub fn discount_for(kind: CreditKind, fee: Cents) -> Cents {
    match kind {
        CreditKind::FullWaiver => fee,
        CreditKind::PartialDiscount => PARTIAL_DISCOUNT_CENTS.min(fee),
    }
}

/// Apply at most one promo credit to a payment's platform fee, atomically:
/// decrement the credit, insert the unique application row, and fold the
/// discount into the payment's amount and fee. A repeat call for the same
/// payment is a no-op that touches no counter.
pub async fn apply_promo(
    conn: &mut AsyncPgConnection,
    payment_id: Uuid,
    user_id: Uuid,
) -> Result<PromoOutcome, EscrowError> {
    conn.transaction::<PromoOutcome, EscrowError, _>(|conn| {
        Box::pin(async move {
            let payment: Payment = payments::table
                .find(payment_id)
                .for_update()
                .first(conn)
                .await
                .optional()?
                .ok_or_else(|| EscrowError::not_found("Payment not found"))?;

            let existing = promo_applications::table
                .filter(promo_applications::payment_id.eq(payment_id))
                .first::<PromoApplication>(conn)
                .await
                .optional()?;
            if existing.is_some() {
                return Ok(PromoOutcome::skipped(
                    payment.platform_fee_cents,
                    "Promo already applied to this payment",
                ));
            }

            // No consumption on zero fee.
            if !payment.platform_fee_cents.is_positive() {
                return Ok(PromoOutcome::skipped(
                    payment.platform_fee_cents,
                    "No platform fee to discount",
                ));
            }

            let credits = promo_credits::table
                .filter(promo_credits::user_id.eq(user_id))
                .filter(promo_credits::remaining_uses.gt(0))
                .order((
                    promo_credits::kind.eq(CreditKind::FullWaiver).desc(),
                    promo_credits::created_at.asc(),
                ))
                .for_update()
                .load::<PromoCredit>(conn)
                .await?;

            let Some(credit) = select_credit(&credits) else {
                return Ok(PromoOutcome::skipped(
                    payment.platform_fee_cents,
                    "No promo credits available",
                ));
            };

            let discount = discount_for(credit.kind, payment.platform_fee_cents);
            let fee_after = payment.platform_fee_cents.checked_sub(discount)?;
            let amount_after = payment.amount_cents.checked_sub(discount)?;

            // Guarded decrement; the CHECK constraint backs this up.
            let decremented = diesel::update(
                promo_credits::table
                    .filter(promo_credits::id.eq(credit.id))
                    .filter(promo_credits::remaining_uses.gt(0)),
            )
            .set(promo_credits::remaining_uses.eq(promo_credits::remaining_uses - 1))
            .execute(conn)
            .await?;
            if decremented == 0 {
                return Ok(PromoOutcome::skipped(
                    payment.platform_fee_cents,
                    "Promo credit no longer available",
                ));
            }

            let application = NewPromoApplication {
                id: Uuid::new_v4(),
                payment_id,
                credit_id: credit.id,
                discount_cents: discount,
            };
            let inserted = diesel::insert_into(promo_applications::table)
                .values(&application)
                .on_conflict(promo_applications::payment_id)
                .do_nothing()
                .execute(conn)
                .await?;
            if inserted == 0 {
                // A concurrent request won the unique constraint; abort so
                // the decrement above rolls back.
                return Err(EscrowError::conflict("Promo already applied concurrently"));
            }

            diesel::update(payments::table.find(payment_id))
                .set((
                    payments::amount_cents.eq(amount_after),
                    payments::platform_fee_cents.eq(fee_after),
                    payments::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

            info!(
                payment_id = %payment_id,
                credit_id = %credit.id,
                kind = %credit.kind,
                discount = %discount,
                "promo credit applied"
            );

            Ok(PromoOutcome {
                applied: true,
                credit_kind: Some(credit.kind),
                discount_cents: discount,
                fee_after_cents: fee_after,
                reason: None,
            })
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn credit(kind: CreditKind, remaining: i32, age_days: i64) -> PromoCredit {
        PromoCredit {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind,
            remaining_uses: remaining,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn full_waiver_beats_older_partial_discount() {
        let credits = vec![
            credit(CreditKind::PartialDiscount, 3, 30),
            credit(CreditKind::FullWaiver, 1, 1),
        ];
        let chosen = select_credit(&credits).unwrap();
        assert_eq!(chosen.kind, CreditKind::FullWaiver);
    }

    #[test]
    fn fifo_within_the_same_kind() {
        let older = credit(CreditKind::PartialDiscount, 2, 10);
        let newer = credit(CreditKind::PartialDiscount, 2, 1);
        let credits = vec![newer.clone(), older.clone()];
        assert_eq!(select_credit(&credits).unwrap().id, older.id);
    }

    #[test]
    fn exhausted_credits_are_never_selected() {
        let credits = vec![
            credit(CreditKind::FullWaiver, 0, 5),
            credit(CreditKind::PartialDiscount, 1, 1),
        ];
        assert_eq!(
            select_credit(&credits).unwrap().kind,
            CreditKind::PartialDiscount
        );

        let all_spent = vec![credit(CreditKind::FullWaiver, 0, 5)];
        assert!(select_credit(&all_spent).is_none());
    }

    #[test]
    fn full_waiver_discounts_the_entire_fee() {
        assert_eq!(discount_for(CreditKind::FullWaiver, Cents(1500)), Cents(1500));
    }

    #[test]
    fn partial_discount_is_fixed_and_capped_at_the_fee() {
        assert_eq!(
            discount_for(CreditKind::PartialDiscount, Cents(1500)),
            Cents(500)
        );
        assert_eq!(
            discount_for(CreditKind::PartialDiscount, Cents(300)),
            Cents(300)
        );
    }
}
