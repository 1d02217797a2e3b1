// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Valora shared types
//!
//! Domain types used by both the API server and the billing crate:
//! the quota sum type, subscription/plan records, and database pool helpers.

pub mod db;
pub mod models;
pub mod quota;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use models::{
    ChatSender, Plan, PlanQuotas, SessionStatus, SubscriptionStatus, TokenPlan, UserRole,
};
pub use quota::{Quota, QuotaDefaults, QuotaKind};
