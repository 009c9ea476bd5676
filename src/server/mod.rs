//! Local HTTP backend for the front-end extensions
//!
//! Every route does its file system work on the blocking pool. JSON routes
//! answer with `{"success": true, "payload": ...}` or
//! `{"success": false, "error": "..."}`.

pub mod files;
pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::BackendConfig;
use crate::error::{NodeError, NodeErrorKind, Result};
use crate::folders::FolderPaths;
use crate::settings::SettingsStore;

/// Largest accepted request body, uploads included
pub const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// State shared by every request
pub struct AppState {
    pub config: BackendConfig,
    pub folders: FolderPaths,
    pub settings: Mutex<SettingsStore>,
    /// Set by the cancellation route, cleared when a long task starts
    pub cancel: Arc<AtomicBool>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build the state, opening the settings database named by the config
    pub fn new(config: BackendConfig) -> Result<Self> {
        let settings = SettingsStore::open(&config.settings_db_path())?;
        Ok(Self::with_settings(config, settings))
    }

    pub fn with_settings(config: BackendConfig, settings: SettingsStore) -> Self {
        let folders = FolderPaths::new(&config);
        Self {
            config,
            folders,
            settings: Mutex::new(settings),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clear a pending cancellation before starting a long task
    pub fn begin_task(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn request_cancellation(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn with_settings_store<T>(
        &self,
        f: impl FnOnce(&mut SettingsStore) -> Result<T>,
    ) -> Result<T> {
        let mut store = self
            .settings
            .lock()
            .map_err(|_| NodeError::database_error("Settings store lock poisoned"))?;
        f(&mut store)
    }
}

/// Every backend route
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/jnodes_list_comfyui_subdirectories",
            get(handlers::list_comfyui_subdirectories),
        )
        .route(
            "/jnodes_list_immediate_subdirectories",
            get(handlers::list_immediate_subdirectories),
        )
        .route(
            "/jnodes_get_comfyui_subdirectory_images",
            get(handlers::get_comfyui_subdirectory_images),
        )
        .route("/jnodes_model_items", get(handlers::model_items))
        .route("/jnodes_save_model_config", get(handlers::save_model_config))
        .route("/jnodes_view_image", get(handlers::view_image))
        .route("/jnodes_copy_item", post(handlers::copy_item))
        .route("/jnodes_load_info", get(handlers::load_info))
        .route(
            "/jnodes_request_open_file_manager",
            post(handlers::request_open_file_manager),
        )
        .route(
            "/jnodes_request_task_cancellation",
            post(handlers::request_task_cancellation),
        )
        .route("/jnodes_save_text", post(handlers::save_text))
        .route("/jnodes_load_text", post(handlers::load_text))
        .route("/jnodes_post_setting", post(handlers::post_setting))
        .route("/jnodes_post_all_settings", post(handlers::post_all_settings))
        .route("/jnodes_get_setting", get(handlers::get_setting))
        .route("/jnodes_get_all_settings", get(handlers::get_all_settings))
        .route("/jnodes_upload_image", post(handlers::upload_image))
        .route("/jnodes_delete_item", delete(handlers::delete_item))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind the configured address and serve until the process exits
pub async fn serve(config: BackendConfig) -> Result<()> {
    let address = config.bind_address.clone();
    let state = Arc::new(AppState::new(config)?);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Backend listening on {}", address);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Run file system work on the blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NodeError::new(NodeErrorKind::Unknown, None, format!("Task failed: {}", e)))?
}

/// `{"success": true, "payload": ...}`
pub(crate) fn success<T: Serialize>(payload: T) -> Response {
    Json(json!({ "success": true, "payload": payload })).into_response()
}

/// `{"success": false, "error": ...}`, logged
pub(crate) fn failure(context: &str, err: &NodeError) -> Response {
    error!("{}: {}", context, err);
    Json(json!({ "success": false, "error": err.to_string() })).into_response()
}

/// Envelope for a result
pub(crate) fn envelope<T: Serialize>(context: &str, result: Result<T>) -> Response {
    match result {
        Ok(payload) => success(payload),
        Err(e) => failure(context, &e),
    }
}

/// HTTP status for routes that answer errors without an envelope
pub(crate) fn status_for(err: &NodeError) -> StatusCode {
    match err.kind {
        NodeErrorKind::NotFound => StatusCode::NOT_FOUND,
        NodeErrorKind::InvalidPath | NodeErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        NodeErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
