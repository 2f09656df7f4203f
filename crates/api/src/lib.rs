// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
#![allow(clippy::format_in_format_args)] // Intentional in logging macros
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Paywire API Library
//!
//! HTTP surface for the webhook pipeline: gateway ingress, health probes,
//! subscription management and the operator routes.

pub mod config;
pub mod error;
pub mod routes;
pub mod startup;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
