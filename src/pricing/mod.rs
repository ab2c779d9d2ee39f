//! Pricing Registry (PR) and Cost Calculator (CC) — pure leaves per the
//! component dependency order: no shared-store access, only a file on disk
//! and an in-process cache.

pub mod calculator;
pub mod catalog;

pub use calculator::{calculate_cost, CostBreakdown, UsageInput};
pub use catalog::{ModelPriceRow, PricingCatalog, PricingRegistry};
