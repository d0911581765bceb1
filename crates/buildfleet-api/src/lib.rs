//! API server for BuildFleet.
//!
//! Serves the worker output and completion channel, operator endpoints and
//! a WebSocket event feed.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
