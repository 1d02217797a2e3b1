//! Shared domain records

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::quota::Quota;

/// Platform role carried on the user row.
///
/// Replaces the legacy system's ADMIN_EMAIL environment comparison: admin
/// privileges come from this claim, validated in the auth layer, never from a
/// string match against configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> UserRole {
        match s {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

/// Subscription lifecycle state mirrored from the payment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceling,
    Cancelled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceling => "canceling",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }

    pub fn from_str(s: &str) -> Option<SubscriptionStatus> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "canceling" => Some(SubscriptionStatus::Canceling),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "past_due" => Some(SubscriptionStatus::PastDue),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three quota template fields a plan carries.
///
/// Copied verbatim onto the user's subscription on activation (a full
/// snapshot, not a merge — partially consumed quotas under a previous plan
/// are discarded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanQuotas {
    pub geo_listing: Quota,
    pub geo_search_tokens: Quota,
    pub product_valuation: Quota,
}

/// A subscription tier.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub title: String,
    pub monthly_price_cents: i64,
    pub features: Vec<String>,
    pub is_popular: bool,
    pub is_yearly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paypal_plan_id: Option<String>,
    pub quotas: PlanQuotas,
}

/// Raw plan row as stored; quota columns use NULL-means-Unlimited.
#[derive(Debug, FromRow)]
pub struct PlanRow {
    pub id: Uuid,
    pub title: String,
    pub monthly_price_cents: i64,
    pub features: serde_json::Value,
    pub is_popular: bool,
    pub is_yearly: bool,
    pub paypal_plan_id: Option<String>,
    pub geo_listing: Option<i32>,
    pub geo_search_tokens: Option<i32>,
    pub product_valuation: Option<i32>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Plan {
        let features = row
            .features
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Plan {
            id: row.id,
            title: row.title,
            monthly_price_cents: row.monthly_price_cents,
            features,
            is_popular: row.is_popular,
            is_yearly: row.is_yearly,
            paypal_plan_id: row.paypal_plan_id,
            quotas: PlanQuotas {
                geo_listing: Quota::from_db(row.geo_listing),
                geo_search_tokens: Quota::from_db(row.geo_search_tokens),
                product_valuation: Quota::from_db(row.product_valuation),
            },
        }
    }
}

/// A one-time token pack SKU, independent of the subscription model.
///
/// Purchase adds `tokens` to the buyer's wallet; packs never expire.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenPlan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub tokens: i64,
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    User,
    Admin,
    System,
}

impl ChatSender {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatSender::User => "user",
            ChatSender::Admin => "admin",
            ChatSender::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<ChatSender> {
        match s {
            "user" => Some(ChatSender::User),
            "admin" => Some(ChatSender::Admin),
            "system" => Some(ChatSender::System),
            _ => None,
        }
    }
}

/// Chat session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

/// A persisted chat message, as returned to both REST and socket clients.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender: String,
    pub body: String,
    pub is_read_by_admin: bool,
    pub is_read_by_user: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        assert_eq!(UserRole::from_str("admin"), UserRole::Admin);
        assert_eq!(UserRole::from_str("user"), UserRole::User);
        // Unknown roles degrade to the least privilege
        assert_eq!(UserRole::from_str("superuser"), UserRole::User);
    }

    #[test]
    fn chat_sender_round_trips() {
        for sender in [ChatSender::User, ChatSender::Admin, ChatSender::System] {
            assert_eq!(ChatSender::from_str(sender.as_str()), Some(sender));
        }
        assert_eq!(ChatSender::from_str("bot"), None);
    }

    #[test]
    fn subscription_status_round_trips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceling,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::PastDue,
        ] {
            assert_eq!(SubscriptionStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::from_str("trialing"), None);
    }

    #[test]
    fn plan_row_decodes_features_and_quotas() {
        let row = PlanRow {
            id: Uuid::new_v4(),
            title: "Pro".to_string(),
            monthly_price_cents: 2900,
            features: serde_json::json!(["Geo listings", "Valuations"]),
            is_popular: true,
            is_yearly: false,
            paypal_plan_id: None,
            geo_listing: Some(50),
            geo_search_tokens: None,
            product_valuation: Some(25),
        };

        let plan: Plan = row.into();
        assert_eq!(plan.features.len(), 2);
        assert_eq!(plan.quotas.geo_listing, Quota::Capped(50));
        assert_eq!(plan.quotas.geo_search_tokens, Quota::Unlimited);
        assert_eq!(plan.quotas.product_valuation, Quota::Capped(25));
    }
}
