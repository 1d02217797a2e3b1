//! Webhook event processing
//!
//! Every verified provider event passes through an atomic idempotency claim
//! before reconciliation. The INSERT...ON CONFLICT...RETURNING pattern
//! ensures only one concurrent request can claim processing rights for a
//! given provider event id; events stuck in `processing` for over 30 minutes
//! can be re-claimed.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType, NewBillingEvent};
use crate::provider::VerifiedEvent;
use crate::reconcile::EntitlementService;

const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

pub struct WebhookProcessor {
    pool: PgPool,
    entitlements: EntitlementService,
    events: BillingEventLogger,
}

impl WebhookProcessor {
    pub fn new(pool: PgPool) -> Self {
        let entitlements = EntitlementService::new(pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            entitlements,
            events,
        }
    }

    /// Claim and process one verified event.
    ///
    /// A duplicate event (already processed or currently claimed elsewhere)
    /// returns Ok(()) without re-applying. Reconciliation failures are
    /// recorded on the ledger and propagated; the HTTP layer decides how to
    /// answer the provider.
    pub async fn process(&self, verified: &VerifiedEvent) -> BillingResult<()> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider, provider_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = 'recovered from stuck state'
            WHERE webhook_events.processing_result = 'processing'
              AND webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(verified.provider.as_str())
        .bind(&verified.event_id)
        .bind(&verified.event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %verified.event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %verified.event_id,
                event_type = %verified.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            provider = %verified.provider,
            event_id = %verified.event_id,
            event_type = %verified.event_type,
            "Processing webhook event"
        );

        let result = self.entitlements.apply(verified).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        let update = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, error_message = $2
            WHERE provider_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&verified.event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            // The ledger row is what makes replays idempotent; a failed
            // write-back leaves the event stuck in 'processing' until the
            // timeout recovery window passes.
            tracing::error!(
                event_id = %verified.event_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        if let Err(e) = &result {
            if let Err(log_err) = self
                .events
                .log(
                    NewBillingEvent::new(BillingEventType::ReconciliationFailed)
                        .provider(verified.provider)
                        .provider_event(&verified.event_id)
                        .data(serde_json::json!({
                            "event_type": verified.event_type,
                            "error": e.to_string(),
                        })),
                )
                .await
            {
                tracing::warn!(error = %log_err, "Failed to log reconciliation failure");
            }
        }

        result
    }
}
