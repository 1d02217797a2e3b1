//! Server configuration loaded from environment variables

use anyhow::Context;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection URL
    pub database_url: String,
    /// Direct (non-pooler) URL for migrations, when different
    pub database_direct_url: Option<String>,
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Secret for signing JWTs
    pub jwt_secret: String,
    /// Access token lifetime in hours
    pub jwt_expiry_hours: i64,
    /// Bootstrap admin: this email is promoted to the admin role on startup.
    /// Authorization itself is role-based; the variable is only a seed.
    pub admin_email: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 characters");
        }
        let jwt_expiry_hours = std::env::var("JWT_EXPIRY_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24);
        let admin_email = std::env::var("ADMIN_EMAIL").ok().filter(|e| !e.is_empty());

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
            jwt_secret,
            jwt_expiry_hours,
            admin_email,
        })
    }
}
