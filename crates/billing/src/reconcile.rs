//! Entitlement reconciliation
//!
//! Mirrors provider subscription state into the `subscriptions` row. The
//! provider is the system of record for billing; every transition here is a
//! reaction to a verified webhook event.
//!
//! Transitions:
//! - activation: wholesale snapshot of the plan onto the subscription row
//!   (quota already consumed under a previous plan is discarded). Idempotent
//!   keyed on the provider subscription id.
//! - update: cancel-at-period-end / past-due flags, located by reverse lookup
//!   on the stored provider subscription id.
//! - cancellation: plan reference cleared, quotas reset to the fixed
//!   free-tier defaults regardless of the prior plan.
//! - token pack: additive wallet credit; never touches subscription state.
//!
//! Every transition runs inside a single transaction.

use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use valora_shared::models::PlanRow;
use valora_shared::{Plan, QuotaDefaults, TokenPlan};

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType, NewBillingEvent};
use crate::provider::{ProviderEvent, ProviderKind, VerifiedEvent};

/// Fallback period lengths when the provider event carries no period end.
const MONTHLY_PERIOD_DAYS: i64 = 30;
const YEARLY_PERIOD_DAYS: i64 = 365;

pub struct EntitlementService {
    pool: PgPool,
    events: BillingEventLogger,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Apply one verified event. Returns Ok(()) for events we deliberately
    /// ignore.
    pub async fn apply(&self, verified: &VerifiedEvent) -> BillingResult<()> {
        match &verified.event {
            ProviderEvent::SubscriptionActivated {
                email,
                plan_id,
                subscription_id,
                customer_ref,
                payer_ref,
                period_end,
                is_yearly,
            } => {
                self.apply_activation(
                    verified,
                    email,
                    *plan_id,
                    subscription_id,
                    customer_ref.as_deref(),
                    payer_ref.as_deref(),
                    *period_end,
                    *is_yearly,
                )
                .await
            }
            ProviderEvent::SubscriptionUpdated {
                subscription_id,
                cancel_at_period_end,
                past_due,
                period_end,
            } => {
                self.apply_update(
                    verified,
                    subscription_id,
                    *cancel_at_period_end,
                    *past_due,
                    *period_end,
                )
                .await
            }
            ProviderEvent::SubscriptionCancelled { subscription_id } => {
                self.apply_cancellation(verified, subscription_id).await
            }
            ProviderEvent::TokenPackPurchased {
                email,
                token_plan_id,
            } => self.apply_token_credit(verified, email, *token_plan_id).await,
            ProviderEvent::Ignored { event_type } => {
                tracing::info!(
                    provider = %verified.provider,
                    event_type = %event_type,
                    "Ignoring unhandled provider event"
                );
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_activation(
        &self,
        verified: &VerifiedEvent,
        email: &str,
        plan_id: Uuid,
        subscription_id: &str,
        customer_ref: Option<&str>,
        payer_ref: Option<&str>,
        period_end: Option<OffsetDateTime>,
        is_yearly: bool,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // Replay guard: an activation for a provider subscription id we have
        // already recorded is a no-op.
        let already: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE stripe_subscription_id = $1 OR paypal_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((user_id,)) = already {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                "Activation replay, subscription already recorded"
            );
            return Ok(());
        }

        let plan = self.load_plan(&mut tx, plan_id).await?;
        let user_id = self.load_user_id(&mut tx, email).await?;

        let now = OffsetDateTime::now_utc();
        let end_date = period_end.unwrap_or_else(|| {
            let days = if is_yearly {
                YEARLY_PERIOD_DAYS
            } else {
                MONTHLY_PERIOD_DAYS
            };
            now + Duration::days(days)
        });

        let (stripe_sub, paypal_sub) = match verified.provider {
            ProviderKind::Stripe => (Some(subscription_id), None),
            ProviderKind::Paypal => (None, Some(subscription_id)),
        };

        // Full snapshot, not a merge: every field of the subscription record
        // is overwritten, quotas copied verbatim from the plan.
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_id, status, start_date, end_date,
                canceled_at, cancel_at_period_end, is_yearly,
                stripe_customer_id, stripe_subscription_id,
                paypal_payer_id, paypal_subscription_id,
                geo_listing, geo_search_tokens, product_valuation, updated_at
            )
            VALUES ($1, $2, 'active', $3, $4, NULL, FALSE, $5,
                    $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = 'active',
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                canceled_at = NULL,
                cancel_at_period_end = FALSE,
                is_yearly = EXCLUDED.is_yearly,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                paypal_payer_id = EXCLUDED.paypal_payer_id,
                paypal_subscription_id = EXCLUDED.paypal_subscription_id,
                geo_listing = EXCLUDED.geo_listing,
                geo_search_tokens = EXCLUDED.geo_search_tokens,
                product_valuation = EXCLUDED.product_valuation,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(plan.id)
        .bind(now)
        .bind(end_date)
        .bind(is_yearly)
        .bind(customer_ref)
        .bind(stripe_sub)
        .bind(payer_ref)
        .bind(paypal_sub)
        .bind(plan.quotas.geo_listing.to_db())
        .bind(plan.quotas.geo_search_tokens.to_db())
        .bind(plan.quotas.product_valuation.to_db())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Err(e) = self
            .events
            .log(
                NewBillingEvent::new(BillingEventType::SubscriptionActivated)
                    .user(user_id)
                    .provider(verified.provider)
                    .provider_event(&verified.event_id)
                    .provider_subscription(subscription_id)
                    .data(serde_json::json!({
                        "plan": plan.title,
                        "is_yearly": is_yearly,
                        "end_date": end_date.to_string(),
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log activation event");
        }

        tracing::info!(
            user_id = %user_id,
            plan = %plan.title,
            subscription_id = %subscription_id,
            provider = %verified.provider,
            "Subscription activated"
        );
        Ok(())
    }

    async fn apply_update(
        &self,
        verified: &VerifiedEvent,
        subscription_id: &str,
        cancel_at_period_end: bool,
        past_due: bool,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE stripe_subscription_id = $1 OR paypal_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id,)) = row else {
            return Err(BillingError::SubscriptionNotFound(
                subscription_id.to_string(),
            ));
        };

        if cancel_at_period_end {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'canceling',
                    cancel_at_period_end = TRUE,
                    canceled_at = NOW(),
                    end_date = COALESCE($2, end_date),
                    updated_at = NOW()
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .bind(period_end)
            .execute(&mut *tx)
            .await?;
        } else if past_due {
            sqlx::query(
                "UPDATE subscriptions SET status = 'past_due', updated_at = NOW() WHERE user_id = $1",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        } else {
            // Provider reports the subscription healthy again.
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'active',
                    cancel_at_period_end = FALSE,
                    canceled_at = NULL,
                    end_date = COALESCE($2, end_date),
                    updated_at = NOW()
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .bind(period_end)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if let Err(e) = self
            .events
            .log(
                NewBillingEvent::new(BillingEventType::SubscriptionUpdated)
                    .user(user_id)
                    .provider(verified.provider)
                    .provider_event(&verified.event_id)
                    .provider_subscription(subscription_id)
                    .data(serde_json::json!({
                        "cancel_at_period_end": cancel_at_period_end,
                        "past_due": past_due,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log update event");
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            cancel_at_period_end,
            past_due,
            "Subscription updated"
        );
        Ok(())
    }

    async fn apply_cancellation(
        &self,
        verified: &VerifiedEvent,
        subscription_id: &str,
    ) -> BillingResult<()> {
        let defaults = QuotaDefaults::FREE_TIER;
        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET plan_id = NULL,
                status = 'cancelled',
                canceled_at = NOW(),
                cancel_at_period_end = FALSE,
                stripe_customer_id = NULL,
                stripe_subscription_id = NULL,
                paypal_payer_id = NULL,
                paypal_subscription_id = NULL,
                geo_listing = $2,
                geo_search_tokens = $3,
                product_valuation = $4,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1 OR paypal_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(subscription_id)
        .bind(defaults.geo_listing.to_db())
        .bind(defaults.geo_search_tokens.to_db())
        .bind(defaults.product_valuation.to_db())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id,)) = row else {
            return Err(BillingError::SubscriptionNotFound(
                subscription_id.to_string(),
            ));
        };

        tx.commit().await?;

        if let Err(e) = self
            .events
            .log(
                NewBillingEvent::new(BillingEventType::SubscriptionCancelled)
                    .user(user_id)
                    .provider(verified.provider)
                    .provider_event(&verified.event_id)
                    .provider_subscription(subscription_id),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log cancellation event");
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Subscription cancelled, quotas reset to free-tier defaults"
        );
        Ok(())
    }

    async fn apply_token_credit(
        &self,
        verified: &VerifiedEvent,
        email: &str,
        token_plan_id: Uuid,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let token_plan: Option<TokenPlan> = sqlx::query_as(
            "SELECT id, name, price_cents, tokens FROM token_plans WHERE id = $1",
        )
        .bind(token_plan_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(token_plan) = token_plan else {
            return Err(BillingError::TokenPlanNotFound(token_plan_id.to_string()));
        };

        let row: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE users SET tokens = tokens + $1, updated_at = NOW() WHERE email = $2 RETURNING id",
        )
        .bind(token_plan.tokens)
        .bind(email)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id,)) = row else {
            return Err(BillingError::UserNotFound(email.to_string()));
        };

        tx.commit().await?;

        if let Err(e) = self
            .events
            .log(
                NewBillingEvent::new(BillingEventType::TokensCredited)
                    .user(user_id)
                    .provider(verified.provider)
                    .provider_event(&verified.event_id)
                    .data(serde_json::json!({
                        "token_plan": token_plan.name,
                        "tokens": token_plan.tokens,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log token credit event");
        }

        tracing::info!(
            user_id = %user_id,
            tokens = token_plan.tokens,
            "Token pack credited"
        );
        Ok(())
    }

    async fn load_plan(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan_id: Uuid,
    ) -> BillingResult<Plan> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, title, monthly_price_cents, features, is_popular, is_yearly,
                   paypal_plan_id, geo_listing, geo_search_tokens, product_valuation
            FROM plans WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Plan::from)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    async fn load_user_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
    ) -> BillingResult<Uuid> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&mut **tx)
            .await?;

        row.map(|(id,)| id)
            .ok_or_else(|| BillingError::UserNotFound(email.to_string()))
    }
}
