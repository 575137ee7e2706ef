//! Integer-cent money. Every amount in the system is a `Cents` value in
//! USD minor units; nothing downstream is allowed to do float arithmetic
//! on money.

use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The single supported currency code, lowercase as the processor expects it.
pub const CURRENCY: &str = "usd";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount must be non-negative cents")]
    Negative,
    #[error("amount arithmetic overflowed")]
    Overflow,
}

/// An amount of money in USD cents.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
)]
#[diesel(sql_type = BigInt)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Guard for amounts entering the system from the outside.
    pub fn require_non_negative(self) -> Result<Cents, MoneyError> {
        if self.0 < 0 {
            return Err(MoneyError::Negative);
        }
        Ok(self)
    }

    pub fn checked_add(self, other: Cents) -> Result<Cents, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Cents)
            .ok_or(MoneyError::Overflow)
    }

    /// Subtraction that refuses to go below zero. A discount exceeding the
    /// amount it discounts is a configuration error, not a negative charge.
    pub fn checked_sub(self, other: Cents) -> Result<Cents, MoneyError> {
        let v = self.0.checked_sub(other.0).ok_or(MoneyError::Overflow)?;
        if v < 0 {
            return Err(MoneyError::Negative);
        }
        Ok(Cents(v))
    }

    pub fn min(self, other: Cents) -> Cents {
        Cents(self.0.min(other.0))
    }

    /// Sum an iterator of amounts, failing on overflow.
    pub fn sum<I: IntoIterator<Item = Cents>>(amounts: I) -> Result<Cents, MoneyError> {
        amounts
            .into_iter()
            .try_fold(Cents::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl fmt::Display for Cents {
    /// Dollar rendering for user-facing notification copy, e.g. `$85.00`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl ToSql<BigInt, Pg> for Cents {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <i64 as ToSql<BigInt, Pg>>::to_sql(&self.0, out)
    }
}

impl FromSql<BigInt, Pg> for Cents {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        <i64 as FromSql<BigInt, Pg>>::from_sql(bytes).map(Cents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_sub_refuses_negative_result() {
        assert_eq!(Cents(1500).checked_sub(Cents(500)), Ok(Cents(1000)));
        assert_eq!(Cents(500).checked_sub(Cents(1500)), Err(MoneyError::Negative));
    }

    #[test]
    fn checked_add_detects_overflow() {
        assert!(Cents(i64::MAX).checked_add(Cents(1)).is_err());
        assert_eq!(Cents(100).checked_add(Cents(23)), Ok(Cents(123)));
    }

    #[test]
    fn require_non_negative_rejects_negative_input() {
        assert_eq!(Cents(-1).require_non_negative(), Err(MoneyError::Negative));
        assert_eq!(Cents(0).require_non_negative(), Ok(Cents(0)));
    }

    #[test]
    fn sums_an_iterator() {
        let total = Cents::sum([Cents(100), Cents(250), Cents(50)]).unwrap();
        assert_eq!(total, Cents(400));
    }

    #[test]
    fn displays_as_dollars() {
        assert_eq!(Cents(8500).to_string(), "$85.00");
        assert_eq!(Cents(7).to_string(), "$0.07");
        assert_eq!(Cents(-150).to_string(), "-$1.50");
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Cents(11000)).unwrap();
        assert_eq!(json, "11000");
        let back: Cents = serde_json::from_str("11000").unwrap();
        assert_eq!(back, Cents(11000));
    }
}
