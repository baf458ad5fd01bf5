use axum::extract::State;
use axum::Json;
use relay_core::status::ConnectionStatus;
use serde::Serialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Process-wide connectivity overview.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub accounts: usize,
    pub ready: usize,
    /// Accounts that exhausted their reconnect bound.
    pub fatal: usize,
    pub dashboards: usize,
    pub statuses: Vec<ConnectionStatus>,
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> AppResult<Json<DataResponse<StatusSummary>>> {
    let statuses = state.clients.statuses().await;

    let summary = StatusSummary {
        accounts: statuses.len(),
        ready: statuses.iter().filter(|s| s.is_ready()).count(),
        fatal: statuses.iter().filter(|s| s.is_terminated()).count(),
        dashboards: state.ws_manager.connection_count().await,
        statuses,
    };
    Ok(Json(DataResponse { data: summary }))
}
