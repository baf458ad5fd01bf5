use axum::routing::get;
use axum::Router;

use crate::handlers::accounts;
use crate::state::AppState;

/// Routes mounted at `/api/accounts`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(accounts::list_accounts).post(accounts::register_account))
        .route(
            "/{id}",
            get(accounts::get_account).delete(accounts::unregister_account),
        )
}
