//! Allocation Workbench Library
//!
//! Interactive preview and commit of line item allocations: load a page of
//! general items, ask for suggested allocations, review them as a local
//! preview, then undo or keep them.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod clients;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod services;
pub mod tracing;

use axum::{extract::State, middleware, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::clients::{
    AllocationApi, AllocationSolver, DistributionEnsurer, ItemSource, SuggestionService,
    UpstreamClient,
};
use crate::notifications::ToastBuffer;
use crate::services::{AllocationTable, ChipController, TablePhase};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub table: Arc<Mutex<AllocationTable>>,
    /// Current table phase, readable without the table lock
    pub phase: watch::Receiver<TablePhase>,
    pub toasts: ToastBuffer,
    pub chip: Arc<ChipController>,
    pub source: Arc<dyn ItemSource>,
    pub suggester: Arc<dyn SuggestionService>,
    pub solver: Arc<dyn AllocationSolver>,
    pub started_at: DateTime<Utc>,
}

/// Collaborators an [`AppState`] is assembled from.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ItemSource>,
    pub suggester: Arc<dyn SuggestionService>,
    pub solver: Arc<dyn AllocationSolver>,
    pub allocations: Arc<dyn AllocationApi>,
    pub distributions: Arc<dyn DistributionEnsurer>,
}

impl Collaborators {
    /// Every collaborator backed by the same upstream client.
    pub fn upstream(client: UpstreamClient) -> Self {
        let client = Arc::new(client);
        Self {
            source: client.clone(),
            suggester: client.clone(),
            solver: client.clone(),
            allocations: client.clone(),
            distributions: client,
        }
    }
}

impl AppState {
    pub fn new(config: config::AppConfig, collaborators: Collaborators) -> Self {
        let toasts = ToastBuffer::new();
        let notifier: Arc<dyn notifications::Notifier> = Arc::new(toasts.clone());

        let mut chip = ChipController::new(collaborators.allocations, notifier.clone());
        if config.allocate_into_distributions {
            chip = chip.with_distributions(collaborators.distributions);
        }

        let table = AllocationTable::new(notifier, config.default_page_size);
        let phase = table.subscribe_phase();

        Self {
            table: Arc::new(Mutex::new(table)),
            phase,
            config,
            toasts,
            chip: Arc::new(chip),
            source: collaborators.source,
            suggester: collaborators.suggester,
            solver: collaborators.solver,
            started_at: Utc::now(),
        }
    }
}

// Common response wrappers
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Routes served under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Status and health endpoints
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        .merge(handlers::allocation_table::allocation_table_routes())
}

/// Full application router with request id propagation and request logging.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(crate::tracing::request_id_middleware))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let status_data = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "allocation-workbench",
        "environment": state.config.environment,
        "timestamp": Utc::now().to_rfc3339(),
    });

    Json(ApiResponse::success(status_data))
}

async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let phase = *state.phase.borrow();
    let uptime = Utc::now().signed_duration_since(state.started_at);

    let health_data = json!({
        "status": "healthy",
        "table_phase": phase,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_secs": uptime.num_seconds(),
    });

    Json(ApiResponse::success(health_data))
}

// Request logging middleware
async fn request_logging_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    ::tracing::info!(method = %method, uri = %uri, "Incoming request");

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    ::tracing::info!(
        method = %method,
        uri = %uri,
        status = status.as_u16(),
        elapsed_ms = duration.as_millis() as u64,
        "Request completed"
    );

    response
}
