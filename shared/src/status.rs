//! Status enums persisted as `Varchar` columns. The database stores the
//! `as_str` form; parsing back is fallible so a bad row surfaces instead of
//! silently mapping to a default.

use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash,
            Serialize, Deserialize, AsExpression, FromSqlRow,
        )]
        #[diesel(sql_type = Text)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let s = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                s.parse().map_err(|e: ParseStatusError| e.into())
            }
        }
    };
}

text_enum!(PaymentStatus, "payment status", {
    PendingHold => "pending_hold",
    Pending => "pending",
    Processing => "processing",
    RequiresAction => "requires_action",
    Authorized => "authorized",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
    Refunded => "refunded",
    PartiallyRefunded => "partially_refunded",
});

impl PaymentStatus {
    /// Terminal payments never come back; a new payment row supersedes them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancelled | Self::Refunded | Self::PartiallyRefunded
        )
    }

    /// Statuses that count as an open payment for the one-per-job rule.
    pub const NON_TERMINAL: [PaymentStatus; 6] = [
        Self::PendingHold,
        Self::Pending,
        Self::Processing,
        Self::RequiresAction,
        Self::Authorized,
        Self::Succeeded,
    ];
}

text_enum!(ContractStatus, "contract status", {
    PendingPayment => "pending_payment",
    Active => "active",
    Cancelled => "cancelled",
});

text_enum!(LedgerStatus, "ledger status", {
    AvailableForTransfer => "available_for_transfer",
    Transferred => "transferred",
    PaidOut => "paid_out",
    Refunded => "refunded",
});

text_enum!(CreditKind, "credit kind", {
    FullWaiver => "full_waiver",
    PartialDiscount => "partial_discount",
});

text_enum!(PromotionKind, "promotion kind", {
    PercentDiscount => "percent_discount",
    FixedDiscount => "fixed_discount",
    WaivePlatformFee => "waive_platform_fee",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_round_trips() {
        for s in [
            PaymentStatus::PendingHold,
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::RequiresAction,
            PaymentStatus::Authorized,
            PaymentStatus::Succeeded,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
            PaymentStatus::Refunded,
            PaymentStatus::PartiallyRefunded,
        ] {
            assert_eq!(s.as_str().parse::<PaymentStatus>().unwrap(), s);
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = "definitely_not_a_status".parse::<PaymentStatus>().unwrap_err();
        assert_eq!(err.kind, "payment status");
    }

    #[test]
    fn terminal_classification() {
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
        assert!(!PaymentStatus::Succeeded.is_terminal());
        assert!(!PaymentStatus::PendingHold.is_terminal());
    }

    #[test]
    fn ledger_status_round_trips() {
        assert_eq!(
            "available_for_transfer".parse::<LedgerStatus>().unwrap(),
            LedgerStatus::AvailableForTransfer
        );
        assert_eq!(LedgerStatus::PaidOut.as_str(), "paid_out");
    }
}
