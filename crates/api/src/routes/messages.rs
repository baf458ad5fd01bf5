use axum::routing::post;
use axum::Router;

use crate::handlers::messages;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/send", post(messages::send_message))
}
