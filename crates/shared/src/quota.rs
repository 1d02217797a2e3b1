//! Union-typed quota counters
//!
//! Every metered allowance in the system (geo-listings, geo-search tokens,
//! product valuations) is either a capped non-negative integer or the literal
//! string `"Unlimited"` on the wire. This module gives that union a real sum
//! type; all arithmetic and comparisons dispatch on the tag.
//!
//! Storage encoding is `INTEGER NULL` where NULL means Unlimited.

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// The literal the frontend and the legacy documents use for an uncapped quota.
const UNLIMITED_LITERAL: &str = "Unlimited";

/// A per-user allowance: a capped counter or unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// Decremented by one on each consumption; exhausted at zero.
    Capped(u32),
    /// Never decremented.
    Unlimited,
}

impl Quota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Quota::Capped(0))
    }

    /// Consume one unit. `Unlimited` passes through untouched; an exhausted
    /// capped quota returns `None` (the caller falls back to the token wallet).
    pub fn consume_one(self) -> Option<Quota> {
        match self {
            Quota::Unlimited => Some(Quota::Unlimited),
            Quota::Capped(0) => None,
            Quota::Capped(n) => Some(Quota::Capped(n - 1)),
        }
    }

    /// Decode from the `INTEGER NULL` storage column.
    ///
    /// Negative values cannot be produced by the guard but may exist in
    /// migrated data; they are clamped to zero rather than rejected.
    pub fn from_db(value: Option<i32>) -> Quota {
        match value {
            None => Quota::Unlimited,
            Some(n) => Quota::Capped(n.max(0) as u32),
        }
    }

    /// Encode for the `INTEGER NULL` storage column.
    pub fn to_db(self) -> Option<i32> {
        match self {
            Quota::Unlimited => None,
            Quota::Capped(n) => Some(n as i32),
        }
    }
}

impl Serialize for Quota {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Quota::Capped(n) => serializer.serialize_u32(*n),
            Quota::Unlimited => serializer.serialize_str(UNLIMITED_LITERAL),
        }
    }
}

impl<'de> Deserialize<'de> for Quota {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuotaVisitor;

        impl<'de> Visitor<'de> for QuotaVisitor {
            type Value = Quota;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a non-negative integer or the string \"Unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quota, E> {
                u32::try_from(v)
                    .map(Quota::Capped)
                    .map_err(|_| E::custom("quota out of range"))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quota, E> {
                if v < 0 {
                    return Err(E::custom("quota cannot be negative"));
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quota, E> {
                if v == UNLIMITED_LITERAL {
                    Ok(Quota::Unlimited)
                } else {
                    Err(E::custom(format!("unknown quota literal '{v}'")))
                }
            }
        }

        deserializer.deserialize_any(QuotaVisitor)
    }
}

impl std::fmt::Display for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quota::Capped(n) => write!(f, "{n}"),
            Quota::Unlimited => write!(f, "{UNLIMITED_LITERAL}"),
        }
    }
}

/// Which quota counter an action draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    GeoListing,
    GeoSearchTokens,
    ProductValuation,
}

impl QuotaKind {
    /// Column name on the `subscriptions` table.
    pub fn column(&self) -> &'static str {
        match self {
            QuotaKind::GeoListing => "geo_listing",
            QuotaKind::GeoSearchTokens => "geo_search_tokens",
            QuotaKind::ProductValuation => "product_valuation",
        }
    }
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// The quota snapshot applied when a subscription is cancelled.
///
/// These are fixed free-tier values, applied regardless of what plan the user
/// previously had.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDefaults {
    pub geo_listing: Quota,
    pub geo_search_tokens: Quota,
    pub product_valuation: Quota,
}

impl QuotaDefaults {
    pub const FREE_TIER: QuotaDefaults = QuotaDefaults {
        geo_listing: Quota::Capped(5),
        geo_search_tokens: Quota::Capped(0),
        product_valuation: Quota::Capped(5),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_decrements() {
        assert_eq!(Quota::Unlimited.consume_one(), Some(Quota::Unlimited));
    }

    #[test]
    fn capped_decrements_by_one() {
        assert_eq!(Quota::Capped(5).consume_one(), Some(Quota::Capped(4)));
        assert_eq!(Quota::Capped(1).consume_one(), Some(Quota::Capped(0)));
    }

    #[test]
    fn exhausted_returns_none() {
        assert_eq!(Quota::Capped(0).consume_one(), None);
        assert!(Quota::Capped(0).is_exhausted());
        assert!(!Quota::Unlimited.is_exhausted());
    }

    #[test]
    fn db_roundtrip() {
        assert_eq!(Quota::from_db(None), Quota::Unlimited);
        assert_eq!(Quota::from_db(Some(7)), Quota::Capped(7));
        assert_eq!(Quota::from_db(Some(-3)), Quota::Capped(0));
        assert_eq!(Quota::Unlimited.to_db(), None);
        assert_eq!(Quota::Capped(7).to_db(), Some(7));
    }

    #[test]
    fn serializes_as_number_or_literal() {
        assert_eq!(serde_json::to_string(&Quota::Capped(12)).unwrap(), "12");
        assert_eq!(
            serde_json::to_string(&Quota::Unlimited).unwrap(),
            "\"Unlimited\""
        );
    }

    #[test]
    fn deserializes_number_and_literal() {
        assert_eq!(serde_json::from_str::<Quota>("12").unwrap(), Quota::Capped(12));
        assert_eq!(
            serde_json::from_str::<Quota>("\"Unlimited\"").unwrap(),
            Quota::Unlimited
        );
        assert!(serde_json::from_str::<Quota>("\"unlimited\"").is_err());
        assert!(serde_json::from_str::<Quota>("-1").is_err());
    }

    #[test]
    fn free_tier_defaults_are_five_zero_five() {
        let d = QuotaDefaults::FREE_TIER;
        assert_eq!(d.geo_listing, Quota::Capped(5));
        assert_eq!(d.geo_search_tokens, Quota::Capped(0));
        assert_eq!(d.product_valuation, Quota::Capped(5));
    }

    #[test]
    fn quota_kind_columns() {
        assert_eq!(QuotaKind::GeoListing.column(), "geo_listing");
        assert_eq!(QuotaKind::GeoSearchTokens.column(), "geo_search_tokens");
        assert_eq!(QuotaKind::ProductValuation.column(), "product_valuation");
    }
}
