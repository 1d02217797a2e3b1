//! Billing invariants
//!
//! Runnable consistency checks for the entitlement system. Intended to be run
//! after webhook replays or on demand from the admin panel; since webhook
//! endpoints acknowledge the provider even when reconciliation fails, these
//! checks are the out-of-band audit that surfaces silent drift.
//!
//! Each invariant is a real SQL query, read-only, and reports enough context
//! to debug a violation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected users (or products, for counter checks)
    pub subject_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may hold entitlements they did not pay for
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProviderMismatchRow {
    user_id: Uuid,
    stripe_subscription_id: Option<String>,
    paypal_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct NoEndDateRow {
    user_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct NoPlanRow {
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterDriftRow {
    product_id: Uuid,
    kind: String,
    counter: i32,
    cardinality: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaDriftRow {
    user_id: Uuid,
    geo_listing: Option<i32>,
    geo_search_tokens: Option<i32>,
    product_valuation: Option<i32>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_provider_reference().await?);
        violations.extend(self.check_ended_has_end_date().await?);
        violations.extend(self.check_active_has_plan().await?);
        violations.extend(self.check_interaction_counters().await?);
        violations.extend(self.check_cancelled_has_free_defaults().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: exactly one provider reference per active paid subscription
    ///
    /// Dual-provider billing is supported, but never simultaneously; an
    /// active subscription with both provider ids (or neither) means the
    /// reconciler and a provider disagree about who is billing this user.
    async fn check_single_provider_reference(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ProviderMismatchRow> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id, paypal_subscription_id
            FROM subscriptions
            WHERE status IN ('active', 'canceling', 'past_due')
              AND plan_id IS NOT NULL
              AND (
                  (stripe_subscription_id IS NOT NULL AND paypal_subscription_id IS NOT NULL)
                  OR (stripe_subscription_id IS NULL AND paypal_subscription_id IS NULL)
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_provider_reference".to_string(),
                subject_ids: vec![row.user_id],
                description: "Active paid subscription must reference exactly one provider"
                    .to_string(),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "paypal_subscription_id": row.paypal_subscription_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: canceling/cancelled subscriptions carry an end date
    ///
    /// Without one we cannot know when to revoke access.
    async fn check_ended_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NoEndDateRow> = sqlx::query_as(
            r#"
            SELECT user_id, status
            FROM subscriptions
            WHERE status IN ('canceling', 'cancelled')
              AND end_date IS NULL
              AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ended_has_end_date".to_string(),
                subject_ids: vec![row.user_id],
                description: format!(
                    "Subscription in status '{}' has no end date or cancellation timestamp",
                    row.status
                ),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: an active subscription references a plan
    async fn check_active_has_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NoPlanRow> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM subscriptions
            WHERE status IN ('active', 'canceling', 'past_due')
              AND plan_id IS NULL
              AND (stripe_subscription_id IS NOT NULL OR paypal_subscription_id IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_plan".to_string(),
                subject_ids: vec![row.user_id],
                description: "Provider-billed subscription references no plan".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: denormalized interaction counters equal list cardinality
    ///
    /// Toggles maintain the counter and the row set in one transaction; drift
    /// means a mutation path bypassed the guarded toggle.
    async fn check_interaction_counters(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CounterDriftRow> = sqlx::query_as(
            r#"
            SELECT p.id AS product_id,
                   k.kind,
                   CASE k.kind
                       WHEN 'favourite' THEN p.favourites_count
                       WHEN 'follower' THEN p.followers_count
                       ELSE p.views_count
                   END AS counter,
                   COUNT(i.id) AS cardinality
            FROM products p
            CROSS JOIN (VALUES ('favourite'), ('follower'), ('view')) AS k(kind)
            LEFT JOIN product_interactions i
                   ON i.product_id = p.id AND i.kind = k.kind
            GROUP BY p.id, k.kind, p.favourites_count, p.followers_count, p.views_count
            HAVING COUNT(i.id) <> CASE k.kind
                       WHEN 'favourite' THEN p.favourites_count
                       WHEN 'follower' THEN p.followers_count
                       ELSE p.views_count
                   END
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "interaction_counters_match".to_string(),
                subject_ids: vec![row.product_id],
                description: format!(
                    "Product {} counter {} but {} {} rows exist",
                    row.kind, row.counter, row.cardinality, row.kind
                ),
                context: serde_json::json!({
                    "kind": row.kind,
                    "counter": row.counter,
                    "cardinality": row.cardinality,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: cancelled subscriptions sit at the free-tier defaults
    async fn check_cancelled_has_free_defaults(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<QuotaDriftRow> = sqlx::query_as(
            r#"
            SELECT user_id, geo_listing, geo_search_tokens, product_valuation
            FROM subscriptions
            WHERE status = 'cancelled'
              AND plan_id IS NULL
              AND (
                  geo_listing IS NULL OR geo_listing > 5
                  OR geo_search_tokens IS NULL OR geo_search_tokens > 0
                  OR product_valuation IS NULL OR product_valuation > 5
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_free_defaults".to_string(),
                subject_ids: vec![row.user_id],
                description: "Cancelled subscription retains paid-tier quota values".to_string(),
                context: serde_json::json!({
                    "geo_listing": row.geo_listing,
                    "geo_search_tokens": row.geo_search_tokens,
                    "product_valuation": row.product_valuation,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_provider_reference" => self.check_single_provider_reference().await,
            "ended_has_end_date" => self.check_ended_has_end_date().await,
            "active_has_plan" => self.check_active_has_plan().await,
            "interaction_counters_match" => self.check_interaction_counters().await,
            "cancelled_has_free_defaults" => self.check_cancelled_has_free_defaults().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_provider_reference",
            "ended_has_end_date",
            "active_has_plan",
            "interaction_counters_match",
            "cancelled_has_free_defaults",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_provider_reference"));
        assert!(checks.contains(&"cancelled_has_free_defaults"));
    }
}
