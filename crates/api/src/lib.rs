//! HTTPS management API for the berth coordinator.

pub mod auth;
pub mod config;
pub mod error;
pub mod extract;
pub mod notify;
pub mod router;
pub mod routes;
pub mod server;
pub mod state;
pub mod sync;
pub mod telemetry;

pub use config::Options;
pub use state::AppState;
