//! Handlers for account registration and lookup.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use relay_core::error::CoreError;
use relay_core::status::ConnectionStatus;

use crate::accounts::AccountSpec;
use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/accounts
pub async fn list_accounts(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<ConnectionStatus>>>> {
    Ok(Json(DataResponse {
        data: state.clients.statuses().await,
    }))
}

/// POST /api/accounts
///
/// Register an account and start its connection. The returned status is
/// the initial one; progress is visible through `GET /api/accounts/{id}`
/// and the dashboard push.
pub async fn register_account(
    State(state): State<AppState>,
    Json(spec): Json<AccountSpec>,
) -> AppResult<(StatusCode, Json<DataResponse<ConnectionStatus>>)> {
    let credential = spec.into_credential()?;
    let account_id = credential.account_id.clone();

    let handle = state.clients.register(credential).await?;
    tracing::info!(account_id = %account_id, "Account registered via API");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: handle.status(),
        }),
    ))
}

/// GET /api/accounts/{id}
pub async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> AppResult<Json<DataResponse<ConnectionStatus>>> {
    let status = state
        .clients
        .status(&account_id)
        .await
        .ok_or_else(|| {
            AppError::Core(CoreError::NotFound {
                entity: "Account",
                id: account_id.clone(),
            })
        })?;
    Ok(Json(DataResponse { data: status }))
}

/// DELETE /api/accounts/{id}
///
/// Stops the connection and forgets the account. Deleting an unknown
/// account is not an error.
pub async fn unregister_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> StatusCode {
    state.clients.unregister(&account_id).await;
    StatusCode::NO_CONTENT
}
