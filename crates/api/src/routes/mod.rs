pub mod accounts;
pub mod health;
pub mod messages;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the `/api` route tree.
///
/// ```text
/// /status                 connectivity overview (GET)
/// /accounts               list (GET), register (POST)
/// /accounts/{id}          get (GET), unregister (DELETE)
/// /send                   send a chat message (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(handlers::status::get_status))
        .nest("/accounts", accounts::router())
        .merge(messages::router())
}
