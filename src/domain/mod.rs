//! Domain layer: aggregates, pricing and payment reconciliation rules.
pub mod aggregates;
pub mod events;
pub mod pricing;
pub mod reconciliation;
pub mod value_objects;
