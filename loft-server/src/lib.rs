//! HTTP surface of the Loft album server. The ingestion pipeline and
//! catalog live in `loft-core`; this crate wires them to axum.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::Config;
pub use state::AppState;
