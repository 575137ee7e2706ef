//! Referral awards: when an invited user's first fee-bearing payment
//! settles, the inviter is granted promo credits. The award is unique per
//! invited user, so webhook redelivery and concurrent settlements cannot
//! grant twice.

use crate::error::EscrowError;
use crate::models::{Invitation, NewInvitationAward, NewPromoCredit, Payment};
use crate::notify;
use crate::schema::{invitation_awards, invitations, payments, promo_credits};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::json;
use shared::{Cents, CreditKind, PaymentStatus};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AwardOutcome {
    pub inviter_id: Uuid,
    pub kind: CreditKind,
    pub uses: i32,
}

/// Fixed award table, keyed by the invited user's role.
pub fn award_for_role(role: &str) -> Option<(CreditKind, i32)> {
    match role {
        "customer" => Some((CreditKind::FullWaiver, 1)),
        "mechanic" => Some((CreditKind::PartialDiscount, 5)),
        _ => None,
    }
}

pub fn describe_award(kind: CreditKind, uses: i32) -> String {
    match kind {
        CreditKind::FullWaiver if uses == 1 => "1 free platform fee credit".to_string(),
        CreditKind::FullWaiver => format!("{uses} free platform fee credits"),
        CreditKind::PartialDiscount => format!("{uses} x $5 off platform fee credits"),
    }
}

/// Award the inviter if this settlement is the invited user's first
/// qualifying (fee-bearing, succeeded) payment. No-op without an
/// invitation, on zero fee, or on any repeat.
pub async fn maybe_award(
    conn: &mut AsyncPgConnection,
    event_id: &str,
    payment: &Payment,
) -> Result<Option<AwardOutcome>, EscrowError> {
    if !payment.platform_fee_cents.is_positive() {
        return Ok(None);
    }

    let invitation = invitations::table
        .filter(invitations::invited_id.eq(payment.customer_id))
        .first::<Invitation>(conn)
        .await
        .optional()?;
    let Some(invitation) = invitation else {
        return Ok(None);
    };

    let Some((kind, uses)) = award_for_role(&invitation.invited_role) else {
        warn!(
            invitation_id = %invitation.id,
            role = %invitation.invited_role,
            "invitation with unknown role, no award"
        );
        return Ok(None);
    };

    let payment = payment.clone();
    let event_id = event_id.to_string();
    let outcome = conn
        .transaction::<Option<AwardOutcome>, EscrowError, _>(|conn| {
            Box::pin(async move {
                // First-qualifying check, evaluated against the award
                // insert in the same transaction; the unique constraint on
                // invited_id settles any remaining race.
                let earlier: i64 = payments::table
                    .filter(payments::customer_id.eq(payment.customer_id))
                    .filter(payments::status.eq(PaymentStatus::Succeeded))
                    .filter(payments::platform_fee_cents.gt(Cents::ZERO))
                    .filter(payments::id.ne(payment.id))
                    .count()
                    .get_result(conn)
                    .await?;
                if earlier > 0 {
                    return Ok(None);
                }

                let award = NewInvitationAward {
                    id: Uuid::new_v4(),
                    invitation_id: invitation.id,
                    invited_id: invitation.invited_id,
                    payment_id: payment.id,
                    processor_event_id: event_id,
                    award_kind: kind,
                };
                let inserted = diesel::insert_into(invitation_awards::table)
                    .values(&award)
                    .on_conflict(invitation_awards::invited_id)
                    .do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 0 {
                    return Ok(None);
                }

                let credit = NewPromoCredit {
                    id: Uuid::new_v4(),
                    user_id: invitation.inviter_id,
                    kind,
                    remaining_uses: uses,
                };
                diesel::insert_into(promo_credits::table)
                    .values(&credit)
                    .execute(conn)
                    .await?;

                notify::enqueue(
                    conn,
                    invitation.inviter_id,
                    "invitation_reward",
                    "Referral Reward Earned!",
                    format!(
                        "Your friend completed their first job! You earned {}.",
                        describe_award(kind, uses)
                    ),
                    json!({ "credit_kind": kind, "uses": uses }),
                )
                .await?;

                Ok(Some(AwardOutcome {
                    inviter_id: invitation.inviter_id,
                    kind,
                    uses,
                }))
            })
        })
        .await?;

    if let Some(award) = &outcome {
        info!(
            inviter_id = %award.inviter_id,
            kind = %award.kind,
            uses = award.uses,
            "invitation award granted"
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn award_table_by_invited_role() {
        assert_eq!(
            award_for_role("customer"),
            Some((CreditKind::FullWaiver, 1))
        );
        assert_eq!(
            award_for_role("mechanic"),
            Some((CreditKind::PartialDiscount, 5))
        );
        assert_eq!(award_for_role("admin"), None);
    }

    #[test]
    fn award_descriptions_read_naturally() {
        assert_eq!(
            describe_award(CreditKind::FullWaiver, 1),
            "1 free platform fee credit"
        );
        assert_eq!(
            describe_award(CreditKind::PartialDiscount, 5),
            "5 x $5 off platform fee credits"
        );
    }
}
