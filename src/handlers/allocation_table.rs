use axum::{
    extract::{Json, Path, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use super::common::{validate_input, PaginationMeta};
use crate::errors::ServiceError;
use crate::models::{AllocationChange, TableFilters};
use crate::notifications::Toast;
use crate::services::{KeepOutcome, KeepStart, PartnerSelection, SuggestOutcome, TableView};
use crate::{ApiResponse, AppState};

#[derive(Debug, Default, Deserialize, Validate)]
pub struct LoadTableRequest {
    #[validate(range(min = 1))]
    pub page: Option<u64>,
    #[validate(range(min = 1))]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub filters: TableFilters,
}

/// Table state plus the toasts raised while handling the request.
#[derive(Debug, Serialize)]
pub struct TableResponse<T> {
    pub result: T,
    pub table: TableView,
    pub pagination: PaginationMeta,
    pub toasts: Vec<Toast>,
}

#[derive(Debug, Serialize)]
pub struct SelectResult {
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct UndoResult {
    pub restored: bool,
}

/// Create the allocation table router
///
/// Every response carries the toasts buffered since the previous response.
/// The buffer is shared by the whole session, so with concurrent requests a
/// toast is delivered by whichever response drains it first.
pub fn allocation_table_routes() -> Router<AppState> {
    Router::new()
        .route("/table", get(get_table))
        .route("/table/load", post(load_table))
        .route("/table/suggest", post(suggest_allocations))
        .route("/table/undo", post(undo_suggestions))
        .route("/table/cancel", post(cancel_suggestions))
        .route("/table/changes", get(pending_changes))
        .route("/table/keep", post(keep_suggestions))
        .route(
            "/table/items/:general_item_id/line-items/:line_item_id/select",
            post(select_partner),
        )
}

async fn respond<T>(state: &AppState, result: T) -> Json<ApiResponse<TableResponse<T>>> {
    let table = state.table.lock().await.view();
    let pagination = PaginationMeta::new(table.page, table.page_size, table.total);
    Json(ApiResponse::success(TableResponse {
        result,
        table,
        pagination,
        toasts: state.toasts.drain(),
    }))
}

/// Current table state. Also delivers toasts left over from failed requests.
pub async fn get_table(State(state): State<AppState>) -> Json<ApiResponse<TableResponse<()>>> {
    respond(&state, ()).await
}

/// Fetch one page of items, abandoning any interaction session.
pub async fn load_table(
    State(state): State<AppState>,
    Json(payload): Json<LoadTableRequest>,
) -> Result<Json<ApiResponse<TableResponse<()>>>, ServiceError> {
    validate_input(&payload)?;
    let page = payload.page.unwrap_or(1);
    let page_size = state.config.page_size_or_default(payload.page_size);

    state
        .table
        .lock()
        .await
        .load(state.source.as_ref(), page, page_size, payload.filters)
        .await?;

    Ok(respond(&state, ()).await)
}

/// Run a suggestion cycle.
///
/// The table lock is released while the suggestion and solver services
/// run, so Undo and Cancel stay responsive.
pub async fn suggest_allocations(
    State(state): State<AppState>,
) -> Json<ApiResponse<TableResponse<SuggestOutcome>>> {
    let ticket = state.table.lock().await.begin_suggest();

    let outcome = match ticket {
        None => SuggestOutcome::Skipped,
        Some(ticket) => {
            let result = ticket
                .resolve(state.suggester.as_ref(), state.solver.as_ref())
                .await;
            state.table.lock().await.finish_suggest(ticket, result)
        }
    };

    info!(?outcome, "suggest request finished");
    respond(&state, outcome).await
}

pub async fn undo_suggestions(
    State(state): State<AppState>,
) -> Json<ApiResponse<TableResponse<UndoResult>>> {
    let restored = state.table.lock().await.undo();
    respond(&state, UndoResult { restored }).await
}

pub async fn cancel_suggestions(
    State(state): State<AppState>,
) -> Json<ApiResponse<TableResponse<UndoResult>>> {
    let restored = state.table.lock().await.cancel();
    respond(&state, UndoResult { restored }).await
}

/// Changes Keep would submit right now.
pub async fn pending_changes(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<AllocationChange>>> {
    let changes = state.table.lock().await.pending_changes();
    Json(ApiResponse::success(changes))
}

/// Persist the previewed changes, then reload so proposed allocations are
/// replaced with stored ones.
///
/// The save runs on its own task, so a request that times out or is
/// abandoned by the client still lands the table in a settled phase. The
/// table lock is released while the changes are submitted.
pub async fn keep_suggestions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<TableResponse<KeepOutcome>>>, ServiceError> {
    let task_state = state.clone();
    let outcome = tokio::spawn(async move { run_keep(&task_state).await })
        .await
        .map_err(|e| ServiceError::InternalError(format!("keep task failed: {}", e)))?;

    info!(?outcome, "keep request finished");
    Ok(respond(&state, outcome).await)
}

async fn run_keep(state: &AppState) -> KeepOutcome {
    let ticket = match state.table.lock().await.begin_keep() {
        KeepStart::Submit(ticket) => ticket,
        KeepStart::Finished(outcome) => return outcome,
    };

    let result = ticket.submit(state.suggester.as_ref()).await;

    let mut table = state.table.lock().await;
    let outcome = table.finish_keep(ticket, result);
    if table.needs_refresh() {
        if let Err(err) = table.refresh(state.source.as_ref()).await {
            warn!(error = %err, "reload after keep failed");
        }
    }
    outcome
}

pub async fn select_partner(
    State(state): State<AppState>,
    Path((general_item_id, line_item_id)): Path<(i64, i64)>,
    Json(selection): Json<PartnerSelection>,
) -> Result<Json<ApiResponse<TableResponse<SelectResult>>>, ServiceError> {
    let changed = state
        .table
        .lock()
        .await
        .select_partner(&state.chip, general_item_id, line_item_id, selection)
        .await?;
    Ok(respond(&state, SelectResult { changed }).await)
}
