//! HTTP API module.
//!
//! REST endpoints for mutations and reconciliation reads, plus the hub's
//! WebSocket upgrade.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
