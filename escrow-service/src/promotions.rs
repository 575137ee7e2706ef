//! Opt-in promotion codes. Separate path from the auto-applied referral
//! credits in `promo.rs`: the customer types a code, we validate it
//! against its window and caps, and record the redemption atomically.
//! Invalid codes are a normal answer, not an error.

use crate::error::EscrowError;
use crate::models::{NewPromotionRedemption, Promotion};
use crate::schema::{promotion_redemptions, promotions};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::{Cents, PromotionKind};
use tracing::info;
use uuid::Uuid;

/// Flat platform fee used when computing fee-relative discounts.
pub const PLATFORM_FEE_CENTS: Cents = Cents(1500);

#[derive(Debug, Serialize)]
pub struct ApplyCodeOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<PromotionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub discount_cents: Cents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApplyCodeOutcome {
    fn invalid(reason: String) -> Self {
        Self {
            valid: false,
            code: None,
            kind: None,
            description: None,
            discount_cents: Cents::ZERO,
            reason: Some(reason),
        }
    }
}

/// Check a promotion against its own rules and compute the discount.
/// `user_redemptions` is the caller's prior redemption count for this code.
pub fn validate(
    promotion: &Promotion,
    quote_amount: Cents,
    user_redemptions: i64,
    now: DateTime<Utc>,
) -> Result<Cents, String> {
    if !promotion.active {
        return Err("Promotion code not found or inactive".to_string());
    }
    if now < promotion.starts_at {
        return Err("Promotion has not started yet".to_string());
    }
    if let Some(ends_at) = promotion.ends_at {
        if now > ends_at {
            return Err("Promotion has expired".to_string());
        }
    }
    if let Some(max) = promotion.max_redemptions {
        if promotion.current_redemptions >= max {
            return Err("Promotion has reached maximum redemptions".to_string());
        }
    }
    if user_redemptions >= i64::from(promotion.max_redemptions_per_user) {
        return Err("You have already used this promotion code".to_string());
    }
    if let Some(minimum) = promotion.minimum_amount_cents {
        if quote_amount < minimum {
            return Err(format!("Minimum order amount is {minimum}"));
        }
    }

    let discount = match promotion.kind {
        PromotionKind::PercentDiscount => {
            let percent = i64::from(promotion.percent_off.unwrap_or(0));
            let base = quote_amount.checked_add(PLATFORM_FEE_CENTS).map_err(|_| {
                "Promotion amount out of range".to_string()
            })?;
            // Round half up, in integer cents.
            Cents((base.0 * percent + 50) / 100)
        }
        PromotionKind::FixedDiscount => promotion.amount_cents.unwrap_or(Cents::ZERO),
        PromotionKind::WaivePlatformFee => PLATFORM_FEE_CENTS,
    };

    Ok(discount)
}

/// Validate and redeem a code in one transaction: the promotion row is
/// locked so the global counter and the per-user cap cannot be raced past.
pub async fn apply_code(
    conn: &mut AsyncPgConnection,
    user_id: Uuid,
    code: &str,
    quote_amount: Cents,
) -> Result<ApplyCodeOutcome, EscrowError> {
    let normalized = code.trim().to_uppercase();

    conn.transaction::<ApplyCodeOutcome, EscrowError, _>(|conn| {
        Box::pin(async move {
            let promotion = promotions::table
                .filter(promotions::code.eq(&normalized))
                .for_update()
                .first::<Promotion>(conn)
                .await
                .optional()?;

            let Some(promotion) = promotion else {
                return Ok(ApplyCodeOutcome::invalid(
                    "Promotion code not found or inactive".to_string(),
                ));
            };

            let user_redemptions: i64 = promotion_redemptions::table
                .filter(promotion_redemptions::promotion_id.eq(promotion.id))
                .filter(promotion_redemptions::user_id.eq(user_id))
                .count()
                .get_result(conn)
                .await?;

            let discount = match validate(&promotion, quote_amount, user_redemptions, Utc::now())
            {
                Ok(discount) => discount,
                Err(reason) => return Ok(ApplyCodeOutcome::invalid(reason)),
            };

            let redemption = NewPromotionRedemption {
                id: Uuid::new_v4(),
                promotion_id: promotion.id,
                user_id,
                discount_cents: discount,
            };
            diesel::insert_into(promotion_redemptions::table)
                .values(&redemption)
                .execute(conn)
                .await?;

            diesel::update(promotions::table.find(promotion.id))
                .set(promotions::current_redemptions.eq(promotions::current_redemptions + 1))
                .execute(conn)
                .await?;

            info!(
                code = %promotion.code,
                user_id = %user_id,
                discount = %discount,
                "promotion code redeemed"
            );

            Ok(ApplyCodeOutcome {
                valid: true,
                code: Some(promotion.code.clone()),
                kind: Some(promotion.kind),
                description: promotion.description.clone(),
                discount_cents: discount,
                reason: None,
            })
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn promotion(kind: PromotionKind) -> Promotion {
        Promotion {
            id: Uuid::new_v4(),
            code: "SPRING".to_string(),
            kind,
            description: None,
            percent_off: None,
            amount_cents: None,
            minimum_amount_cents: None,
            max_redemptions: None,
            max_redemptions_per_user: 1,
            current_redemptions: 0,
            active: true,
            starts_at: Utc::now() - Duration::days(1),
            ends_at: None,
            created_at: Utc::now() - Duration::days(1),
        }
    }

    #[test]
    fn waives_the_flat_platform_fee() {
        let promo = promotion(PromotionKind::WaivePlatformFee);
        assert_eq!(
            validate(&promo, Cents(10_000), 0, Utc::now()),
            Ok(Cents(1500))
        );
    }

    #[test]
    fn percent_discount_applies_to_quote_plus_fee() {
        let mut promo = promotion(PromotionKind::PercentDiscount);
        promo.percent_off = Some(10);
        // 10% of $115.00
        assert_eq!(
            validate(&promo, Cents(10_000), 0, Utc::now()),
            Ok(Cents(1150))
        );
    }

    #[test]
    fn fixed_discount_uses_the_configured_amount() {
        let mut promo = promotion(PromotionKind::FixedDiscount);
        promo.amount_cents = Some(Cents(750));
        assert_eq!(
            validate(&promo, Cents(10_000), 0, Utc::now()),
            Ok(Cents(750))
        );
    }

    #[test]
    fn rejects_outside_the_window() {
        let mut promo = promotion(PromotionKind::WaivePlatformFee);
        promo.starts_at = Utc::now() + Duration::days(1);
        assert!(validate(&promo, Cents(10_000), 0, Utc::now())
            .unwrap_err()
            .contains("not started"));

        let mut promo = promotion(PromotionKind::WaivePlatformFee);
        promo.ends_at = Some(Utc::now() - Duration::hours(1));
        assert!(validate(&promo, Cents(10_000), 0, Utc::now())
            .unwrap_err()
            .contains("expired"));
    }

    #[test]
    fn rejects_exhausted_and_repeated_redemptions() {
        let mut promo = promotion(PromotionKind::WaivePlatformFee);
        promo.max_redemptions = Some(100);
        promo.current_redemptions = 100;
        assert!(validate(&promo, Cents(10_000), 0, Utc::now())
            .unwrap_err()
            .contains("maximum redemptions"));

        let promo = promotion(PromotionKind::WaivePlatformFee);
        assert!(validate(&promo, Cents(10_000), 1, Utc::now())
            .unwrap_err()
            .contains("already used"));
    }

    #[test]
    fn enforces_the_minimum_order_amount() {
        let mut promo = promotion(PromotionKind::WaivePlatformFee);
        promo.minimum_amount_cents = Some(Cents(5_000));
        assert!(validate(&promo, Cents(4_999), 0, Utc::now()).is_err());
        assert!(validate(&promo, Cents(5_000), 0, Utc::now()).is_ok());
    }
}
