//! Authentication.
//!
//! Tokens are validated once, at request or WebSocket handshake time, and
//! turned into a [`Principal`]. Nothing downstream re-derives identity from
//! individual messages.
//!
//! Supported tokens:
//! - HS256 JWTs signed with the configured secret
//! - `dev:<user_id>` tokens for configured dev users (dev mode only)

mod claims;
mod config;
mod error;
mod middleware;
mod principal;

pub use claims::{Claims, Role};
pub use config::{AuthConfig, ConfigValidationError, DevUser};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, RequireAdmin, auth_middleware};
pub use principal::Principal;
