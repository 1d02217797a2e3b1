//! Authentication for Valora

pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_admin, require_auth, AuthUser};
pub use password::{hash_password, verify_password};
