// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Valora API Library
//!
//! HTTP server components: auth, quota guard, catalog routes, billing
//! endpoints and the chat relay.

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod quota;
pub mod routes;
pub mod shuffle;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
