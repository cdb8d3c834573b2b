//! Core of the `agrosense-core` service: windowed aggregation and history of
//! parcel sensor readings, latest node state, and threshold-rule evaluation
//! with idempotent task/alert emission.
//!
//! Services depend on the store capability traits in [`store`] and on the
//! window types in [`window`]; concrete stores are chosen once in
//! [`state::AppState::build`]. The root re-exports below are the surface the
//! binary and the HTTP routes (EMBP gateway in [`routes`]) use.

pub mod aggregation;
pub mod alerts;
pub mod config;
pub mod error;
pub mod history;
pub mod latest;
pub mod models;
pub mod routes;
pub mod rules;
pub mod schema;
pub mod state;
pub mod store;
pub mod window;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use state::AppState;
