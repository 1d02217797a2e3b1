//! Centralized quota consumption guard
//!
//! Every metered mutation goes through [`charge_quota`]; no handler touches
//! quota columns or the token wallet directly. The decision itself is a pure
//! function over a snapshot of the user's state, so the precedence order
//! (admin bypass, unlimited, capped decrement, wallet debit, reject) is unit
//! testable without a database. The application of the decision runs in the
//! same transaction as the guarded mutation.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use valora_shared::models::UserRole;
use valora_shared::quota::{Quota, QuotaKind};

use crate::error::{ApiError, ApiResult};

/// Token price of each metered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteredAction {
    /// Saving a geo-listing to the user's collection
    SaveGeoListing,
    /// One image edit
    ImageEdit,
    /// One AI-assisted search
    AiSearch,
}

impl MeteredAction {
    pub fn quota_kind(&self) -> QuotaKind {
        match self {
            MeteredAction::SaveGeoListing => QuotaKind::GeoListing,
            MeteredAction::ImageEdit => QuotaKind::ProductValuation,
            MeteredAction::AiSearch => QuotaKind::GeoSearchTokens,
        }
    }

    /// Wallet price when the quota is exhausted. AI search is cheaper on a
    /// paid tier.
    pub fn token_price(&self, on_paid_tier: bool) -> i64 {
        match self {
            MeteredAction::SaveGeoListing => 500,
            MeteredAction::ImageEdit => 20,
            MeteredAction::AiSearch => {
                if on_paid_tier {
                    10
                } else {
                    20
                }
            }
        }
    }
}

/// Snapshot of the user state the decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct ChargeInput {
    pub role: UserRole,
    pub quota: Quota,
    pub wallet_tokens: i64,
    pub token_price: i64,
}

/// What the guard decided. `Rejected` maps to 403 with `reason: "token"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeDecision {
    /// Admins are never metered.
    AdminBypass,
    /// Unlimited quota: pass with no decrement.
    UnlimitedPass,
    /// Capped quota available: decrement it by one, wallet untouched.
    ConsumeQuota { remaining: u32 },
    /// Quota exhausted but the wallet covers the price: debit it.
    DebitWallet { price: i64, remaining_tokens: i64 },
    /// Quota exhausted and wallet short.
    Rejected,
}

/// Pure decision function; precedence is fixed and total.
pub fn decide(input: ChargeInput) -> ChargeDecision {
    if input.role.is_admin() {
        return ChargeDecision::AdminBypass;
    }
    match input.quota.consume_one() {
        Some(Quota::Unlimited) => ChargeDecision::UnlimitedPass,
        Some(Quota::Capped(remaining)) => ChargeDecision::ConsumeQuota { remaining },
        None => {
            if input.wallet_tokens >= input.token_price {
                ChargeDecision::DebitWallet {
                    price: input.token_price,
                    remaining_tokens: input.wallet_tokens - input.token_price,
                }
            } else {
                ChargeDecision::Rejected
            }
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GuardSnapshot {
    quota: Option<i32>,
    tokens: i64,
    has_plan: bool,
}

/// Charge a user for one metered action inside an open transaction.
///
/// Locks the subscription and user rows (FOR UPDATE) so concurrent charges
/// serialize, applies [`decide`], and writes the decrement or debit. The
/// caller performs the guarded mutation on the same transaction and commits;
/// a rejection rolls everything back together.
pub async fn charge_quota(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    role: UserRole,
    action: MeteredAction,
) -> ApiResult<ChargeDecision> {
    if role.is_admin() {
        return Ok(ChargeDecision::AdminBypass);
    }

    let kind = action.quota_kind();
    let snapshot: GuardSnapshot = sqlx::query_as(&format!(
        r#"
        SELECT s.{column} AS quota,
               u.tokens,
               (s.plan_id IS NOT NULL AND s.status = 'active') AS has_plan
        FROM users u
        JOIN subscriptions s ON s.user_id = u.id
        WHERE u.id = $1
        FOR UPDATE OF u, s
        "#,
        column = kind.column()
    ))
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(ApiError::NotFound("subscription"))?;

    let decision = decide(ChargeInput {
        role,
        quota: Quota::from_db(snapshot.quota),
        wallet_tokens: snapshot.tokens,
        token_price: action.token_price(snapshot.has_plan),
    });

    match decision {
        ChargeDecision::AdminBypass | ChargeDecision::UnlimitedPass => {}
        ChargeDecision::ConsumeQuota { remaining } => {
            sqlx::query(&format!(
                "UPDATE subscriptions SET {column} = $1, updated_at = NOW() WHERE user_id = $2",
                column = kind.column()
            ))
            .bind(remaining as i32)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        }
        ChargeDecision::DebitWallet {
            remaining_tokens, ..
        } => {
            sqlx::query("UPDATE users SET tokens = $1, updated_at = NOW() WHERE id = $2")
                .bind(remaining_tokens)
                .bind(user_id)
                .execute(&mut **tx)
                .await?;
        }
        ChargeDecision::Rejected => return Err(ApiError::InsufficientTokens),
    }

    tracing::debug!(
        user_id = %user_id,
        action = ?action,
        decision = ?decision,
        "quota charge applied"
    );

    Ok(decision)
}

/// Convenience wrapper for actions whose guarded mutation is the charge
/// itself (AI search, image edits): opens a transaction, charges, commits.
pub async fn charge_quota_standalone(
    pool: &PgPool,
    user_id: Uuid,
    role: UserRole,
    action: MeteredAction,
) -> ApiResult<ChargeDecision> {
    let mut tx = pool.begin().await?;
    let decision = charge_quota(&mut tx, user_id, role, action).await?;
    tx.commit().await?;
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(quota: Quota, tokens: i64, price: i64) -> ChargeInput {
        ChargeInput {
            role: UserRole::User,
            quota,
            wallet_tokens: tokens,
            token_price: price,
        }
    }

    #[test]
    fn test_admin_bypasses_everything() {
        let decision = decide(ChargeInput {
            role: UserRole::Admin,
            quota: Quota::Capped(0),
            wallet_tokens: 0,
            token_price: 500,
        });
        assert_eq!(decision, ChargeDecision::AdminBypass);
    }

    #[test]
    fn test_unlimited_never_decrements() {
        assert_eq!(
            decide(input(Quota::Unlimited, 0, 500)),
            ChargeDecision::UnlimitedPass
        );
    }

    #[test]
    fn test_positive_quota_decrements_wallet_untouched() {
        assert_eq!(
            decide(input(Quota::Capped(5), 0, 500)),
            ChargeDecision::ConsumeQuota { remaining: 4 }
        );
    }

    #[test]
    fn test_exhausted_quota_debits_wallet() {
        assert_eq!(
            decide(input(Quota::Capped(0), 600, 500)),
            ChargeDecision::DebitWallet {
                price: 500,
                remaining_tokens: 100
            }
        );
    }

    #[test]
    fn test_short_wallet_rejected() {
        assert_eq!(decide(input(Quota::Capped(0), 100, 500)), ChargeDecision::Rejected);
        // Exact cover is allowed
        assert_eq!(
            decide(input(Quota::Capped(0), 500, 500)),
            ChargeDecision::DebitWallet {
                price: 500,
                remaining_tokens: 0
            }
        );
    }

    /// geo_listing=0, wallet 600: first save debits to 100, second rejects.
    #[test]
    fn test_sequential_saves_exhaust_wallet() {
        let first = decide(input(Quota::Capped(0), 600, 500));
        assert_eq!(
            first,
            ChargeDecision::DebitWallet {
                price: 500,
                remaining_tokens: 100
            }
        );

        let second = decide(input(Quota::Capped(0), 100, 500));
        assert_eq!(second, ChargeDecision::Rejected);
    }

    #[test]
    fn test_ai_search_price_depends_on_tier() {
        assert_eq!(MeteredAction::AiSearch.token_price(true), 10);
        assert_eq!(MeteredAction::AiSearch.token_price(false), 20);
        assert_eq!(MeteredAction::SaveGeoListing.token_price(false), 500);
        assert_eq!(MeteredAction::ImageEdit.token_price(true), 20);
    }
}
