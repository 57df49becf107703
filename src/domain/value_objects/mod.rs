//! Value Objects for order pricing

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, StorefrontError};

/// Monetary amounts are kept to cents.
pub const MONEY_DECIMAL_PLACES: u32 = 2;

/// Upper bound for a single line quantity; keeps the value within an `INTEGER` column.
pub const MAX_QUANTITY: i64 = 9999;

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Quantity value object, always in `1..=MAX_QUANTITY`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: i64) -> Result<Self> {
        if value <= 0 || value > MAX_QUANTITY { return Err(StorefrontError::InvalidQuantity); }
        Ok(Self(value as u32))
    }
    pub fn value(&self) -> u32 { self.0 }
    pub fn as_decimal(&self) -> Decimal { Decimal::from(self.0) }
}

impl TryFrom<i64> for Quantity {
    type Error = StorefrontError;
    fn try_from(value: i64) -> Result<Self> { Self::new(value) }
}

impl From<Quantity> for u32 {
    fn from(q: Quantity) -> u32 { q.0 }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}
