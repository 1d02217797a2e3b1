//! JWT issuing and validation

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use valora_shared::models::UserRole;

use crate::error::{ApiError, ApiResult};

/// JWT claims
///
/// The role is embedded so admin checks don't need a user lookup per request;
/// a demotion takes effect at the next token issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    pub email: String,
    pub role: UserRole,
    /// Expiration (unix seconds)
    pub exp: i64,
    /// Issued at (unix seconds)
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry: Duration,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry: Duration::hours(expiry_hours),
        }
    }

    pub fn issue(&self, user_id: Uuid, email: &str, role: UserRole) -> ApiResult<String> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            role,
            exp: (now + self.expiry).unix_timestamp(),
            iat: now.unix_timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(e.into()))
    }

    /// Validate a token and return its claims. Any decoding or expiry failure
    /// collapses to `Unauthorized`; the distinction is not client-visible.
    pub fn validate(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JwtManager {
        JwtManager::new("test-secret-that-is-long-enough-000", 24)
    }

    #[test]
    fn test_round_trip_preserves_claims() {
        let user_id = Uuid::new_v4();
        let token = manager()
            .issue(user_id, "a@example.com", UserRole::Admin)
            .unwrap();

        let claims = manager().validate(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "a@example.com");
        assert_eq!(claims.role, UserRole::Admin);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = manager()
            .issue(Uuid::new_v4(), "a@example.com", UserRole::User)
            .unwrap();

        let other = JwtManager::new("a-different-secret-also-long-enough", 24);
        assert!(other.validate(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(manager().validate("not.a.jwt").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let expired = JwtManager::new("test-secret-that-is-long-enough-000", -1);
        let token = expired
            .issue(Uuid::new_v4(), "a@example.com", UserRole::User)
            .unwrap();
        assert!(manager().validate(&token).is_err());
    }
}
