//! HTTP surface for the shipkit payments service
//!
//! Checkout, vendor webhooks, the browser callback, and account views over
//! credits, orders, and subscriptions. All routes hang off a shared
//! [`AppState`]; authentication is a JWT bearer token.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
