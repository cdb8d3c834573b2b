use axum::Router;

use crate::AppState;

mod alerts;
mod health;
mod readings;
mod rules;

// ---

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(rules::router())
        .merge(alerts::router())
        .merge(health::router())
        .with_state(state)
}
