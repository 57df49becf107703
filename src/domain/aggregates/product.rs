//! Product quote as answered by the catalog.
//!
//! The catalog itself is owned elsewhere; orders only need the current price
//! and whether the product can be sold right now.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Result, StorefrontError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price: Option<Decimal>,
    pub status: ProductStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus { #[default] Draft, Active, Archived }

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Draft => "draft", Self::Active => "active", Self::Archived => "archived" }
    }
}

impl FromStr for ProductStatus {
    type Err = StorefrontError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "archived" | "deleted" => Ok(Self::Archived),
            other => Err(StorefrontError::Internal(format!("unknown product status '{other}'"))),
        }
    }
}

impl Product {
    pub fn active(id: Uuid, name: impl Into<String>, price: Decimal) -> Self {
        Self { id, name: name.into(), price: Some(price), status: ProductStatus::Active }
    }

    /// Current unit price, if the product is active and priced.
    pub fn quote(&self) -> Result<Decimal> {
        match (self.status, self.price) {
            (ProductStatus::Active, Some(price)) if price >= Decimal::ZERO => Ok(price),
            _ => Err(StorefrontError::ProductNotFound { product_id: self.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_requires_active_and_priced() {
        let id = Uuid::new_v4();
        let p = Product::active(id, "Kettle", Decimal::new(2500, 0));
        assert_eq!(p.quote().unwrap(), Decimal::new(2500, 0));

        let draft = Product { status: ProductStatus::Draft, ..p.clone() };
        assert!(matches!(draft.quote(), Err(StorefrontError::ProductNotFound { product_id }) if product_id == id));

        let unpriced = Product { price: None, ..p };
        assert!(unpriced.quote().is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("active".parse::<ProductStatus>().unwrap(), ProductStatus::Active);
        assert_eq!("deleted".parse::<ProductStatus>().unwrap(), ProductStatus::Archived);
        assert!("bogus".parse::<ProductStatus>().is_err());
    }
}
