//! Order total recalculation.
//!
//! Totals are always a fold over the full set of line totals, never a delta
//! applied to previously stored amounts, so recomputing is idempotent and
//! independent of the order in which item mutations happened.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::value_objects::round_money;

/// 16% VAT.
pub const DEFAULT_TAX_RATE: Decimal = Decimal::from_parts(16, 0, 0, false, 2);
pub const DEFAULT_FREE_SHIPPING_THRESHOLD: Decimal = Decimal::from_parts(5000, 0, 0, false, 0);
pub const DEFAULT_FLAT_SHIPPING_FEE: Decimal = Decimal::from_parts(500, 0, 0, false, 0);

/// Tax and shipping rules applied to every order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub tax_rate: Decimal,
    pub free_shipping_threshold: Decimal,
    pub flat_shipping_fee: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate: DEFAULT_TAX_RATE,
            free_shipping_threshold: DEFAULT_FREE_SHIPPING_THRESHOLD,
            flat_shipping_fee: DEFAULT_FLAT_SHIPPING_FEE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub final_amount: Decimal,
}

impl PricingPolicy {
    /// Compute totals from the current line totals of an order.
    ///
    /// An empty ledger is not an error: it yields a zero subtotal and tax, and
    /// the flat shipping fee still applies because the threshold is not met.
    pub fn totals<I>(&self, line_totals: I) -> OrderTotals
    where
        I: IntoIterator<Item = Decimal>,
    {
        let subtotal: Decimal = line_totals.into_iter().sum();
        let tax_amount = round_money(subtotal * self.tax_rate);
        let shipping_amount = self.shipping_for(subtotal);
        OrderTotals {
            subtotal,
            tax_amount,
            shipping_amount,
            final_amount: subtotal + tax_amount + shipping_amount,
        }
    }

    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal >= self.free_shipping_threshold { Decimal::ZERO } else { self.flat_shipping_fee }
    }
}

impl OrderTotals {
    pub fn is_consistent(&self) -> bool {
        self.final_amount == self.subtotal + self.tax_amount + self.shipping_amount
    }
}
