//! Route handlers

use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::PathBuf;

use super::files::{
    self, content_disposition, content_type_for, FileQuery, RenderedImage, UploadRequest,
};
use super::{blocking, envelope, failure, status_for, success, SharedState};
use crate::error::{NodeError, Result};
use crate::familiar;
use crate::scanner::{list_immediate_subdirectories as list_immediate, list_subdirectories, SubdirectoryScanner};

#[derive(Debug, Default, Deserialize)]
pub struct RootQuery {
    pub root_directory: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubdirectoryImagesQuery {
    pub root_directory: Option<String>,
    pub selected_subdirectory: Option<String>,
    pub recursive: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TypeQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelConfigQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub item_name: Option<String>,
    pub subfolder: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    #[serde(flatten)]
    pub file: FileQuery,
    pub preview: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CopyQuery {
    #[serde(flatten)]
    pub file: FileQuery,
    pub destination: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub path: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SettingRequest {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingQuery {
    pub name: Option<String>,
}

fn model_type(kind: Option<String>) -> String {
    kind.filter(|k| !k.is_empty())
        .unwrap_or_else(|| files::DEFAULT_FILE_TYPE.to_string())
}

fn error_status(err: &NodeError) -> Response {
    warn!("{}", err);
    status_for(err).into_response()
}

pub async fn list_comfyui_subdirectories(
    State(state): State<SharedState>,
    Query(query): Query<RootQuery>,
) -> Response {
    state.begin_task();
    let result = blocking(move || {
        let root = state
            .folders
            .resolve(query.root_directory.unwrap_or_default());
        list_subdirectories(&root, &state.cancel)
    })
    .await;
    envelope("Error listing subdirectories", result)
}

pub async fn list_immediate_subdirectories(
    State(state): State<SharedState>,
    Query(query): Query<RootQuery>,
) -> Response {
    let result = blocking(move || {
        let root = state
            .folders
            .resolve(query.root_directory.unwrap_or_default());
        list_immediate(&root)
    })
    .await;
    envelope("Error listing immediate subdirectories", result)
}

pub async fn get_comfyui_subdirectory_images(
    State(state): State<SharedState>,
    Query(query): Query<SubdirectoryImagesQuery>,
) -> Response {
    state.begin_task();
    let result = blocking(move || {
        let root = state
            .folders
            .resolve(query.root_directory.unwrap_or_default())
            .join(query.selected_subdirectory.unwrap_or_default());
        let recursive = query.recursive.as_deref() == Some("true");
        let scanner = SubdirectoryScanner::new(
            root,
            recursive,
            state.config.scan,
            state.cancel.clone(),
        )
        .with_tools(state.config.tools.clone());
        Ok(scanner.scan().items)
    })
    .await;
    envelope("Error listing subdirectory images", result)
}

/// Models of a type with their familiar files, keyed by base name
pub async fn model_items(
    State(state): State<SharedState>,
    Query(query): Query<TypeQuery>,
) -> Response {
    state.begin_task();
    let kind = model_type(query.kind);
    let result = blocking(move || {
        familiar::create_familiar_dictionaries(&state.folders, &kind, &state.cancel)
    })
    .await;
    match result {
        Ok(records) => Json(records).into_response(),
        Err(e) => failure("Error listing model items", &e),
    }
}

pub async fn save_model_config(
    State(state): State<SharedState>,
    Query(query): Query<ModelConfigQuery>,
) -> Response {
    let (item_name, key, value) = match (query.item_name, query.key, query.value) {
        (Some(item), Some(key), Some(value)) => (item, key, value),
        _ => {
            warn!("Missing item_name, key or value, unable to update model config");
            return axum::http::StatusCode::BAD_REQUEST.into_response();
        }
    };
    let kind = model_type(query.kind);
    let result = blocking(move || {
        familiar::save_model_config(
            &state.folders,
            &kind,
            &item_name,
            query.subfolder.as_deref(),
            &key,
            &value,
        )
    })
    .await;
    envelope("Error saving model config", result)
}

fn image_response(image: RenderedImage, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, image.content_type),
            (header::CONTENT_DISPOSITION, content_disposition(filename)),
        ],
        image.body,
    )
        .into_response()
}

/// Serve a file, optionally re-encoded as a preview or reduced to channels
pub async fn view_image(
    State(state): State<SharedState>,
    Query(query): Query<ViewQuery>,
) -> Response {
    let result = blocking(move || {
        let requested = files::validate_requested_file(&state.folders, &query.file)?;
        let rendered = match (&query.preview, query.channel.as_deref()) {
            (Some(preview), channel) => Some(files::render_preview(&requested.file, preview, channel)?),
            (None, Some(channel)) => files::render_channel(&requested.file, channel)?,
            (None, None) => None,
        };
        let image = match rendered {
            Some(image) => image,
            None => RenderedImage {
                body: fs::read(&requested.file)
                    .map_err(|e| NodeError::from(e).with_path(&requested.file))?,
                content_type: content_type_for(&requested.file).to_string(),
            },
        };
        Ok((image, requested.filename))
    })
    .await;

    match result {
        Ok((image, filename)) => image_response(image, &filename),
        Err(e) => error_status(&e),
    }
}

/// Copy a validated file into a host-relative destination directory
pub async fn copy_item(State(state): State<SharedState>, Query(query): Query<CopyQuery>) -> Response {
    let result = blocking(move || {
        let destination = query
            .destination
            .filter(|d| !d.is_empty())
            .ok_or_else(|| NodeError::invalid_input("Missing destination"))?;
        let requested = files::validate_requested_file(&state.folders, &query.file)?;
        let target = files::copy_to_directory(&state.folders, &requested.file, &destination)?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(json!({ "name": name, "destination": destination }))
    })
    .await;
    envelope("Error copying item", result)
}

pub async fn load_info(State(state): State<SharedState>, Query(query): Query<InfoQuery>) -> Response {
    let filename = match query.filename {
        Some(filename) if !filename.is_empty() => filename,
        _ => return axum::http::StatusCode::NOT_FOUND.into_response(),
    };
    let kind = model_type(query.kind);
    let result =
        blocking(move || familiar::load_info(&state.folders, &kind, &filename)).await;
    match result {
        Ok(text) => success(text),
        Err(e) if e.kind == crate::error::NodeErrorKind::IoError => failure("Error loading text", &e),
        Err(e) => error_status(&e),
    }
}

pub async fn request_open_file_manager(
    State(state): State<SharedState>,
    Query(query): Query<FileQuery>,
) -> Response {
    let result = blocking(move || {
        let requested = files::validate_requested_file(&state.folders, &query)?;
        files::open_in_file_manager(&requested.file)
    })
    .await;
    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure("Error opening file manager", &e),
    }
}

pub async fn request_task_cancellation(State(state): State<SharedState>) -> Response {
    info!("Task cancellation requested");
    state.request_cancellation();
    Json(json!({ "success": true })).into_response()
}

pub async fn save_text(State(state): State<SharedState>, Json(request): Json<TextRequest>) -> Response {
    let result = blocking(move || {
        let text = request
            .text
            .ok_or_else(|| NodeError::invalid_input("Missing text"))?;
        let path = state.folders.resolve_file_path(&request.path);
        fs::write(&path, text).map_err(|e| NodeError::from(e).with_path(&path))
    })
    .await;
    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure("Error saving text", &e),
    }
}

pub async fn load_text(State(state): State<SharedState>, Json(request): Json<TextRequest>) -> Response {
    let result = blocking(move || {
        let path = state.folders.resolve_file_path(&request.path);
        fs::read_to_string(&path).map_err(|e| NodeError::from(e).with_path(&path))
    })
    .await;
    envelope("Error loading text", result)
}

pub async fn post_setting(
    State(state): State<SharedState>,
    Json(request): Json<SettingRequest>,
) -> Response {
    let result = blocking(move || {
        state.with_settings_store(|store| store.set(&request.name, &request.value))
    })
    .await;
    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure("Error saving setting", &e),
    }
}

pub async fn post_all_settings(
    State(state): State<SharedState>,
    Json(settings): Json<Map<String, Value>>,
) -> Response {
    let result =
        blocking(move || state.with_settings_store(|store| store.set_all(&settings))).await;
    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure("Error saving settings", &e),
    }
}

/// Value of one setting, `null` when it was never set
pub async fn get_setting(
    State(state): State<SharedState>,
    Query(query): Query<SettingQuery>,
) -> Response {
    let result = blocking(move || {
        let name = query
            .name
            .ok_or_else(|| NodeError::invalid_input("Missing setting name"))?;
        state.with_settings_store(|store| store.get(&name))
    })
    .await;
    envelope("Error loading setting", result)
}

pub async fn get_all_settings(State(state): State<SharedState>) -> Response {
    let result = blocking(move || state.with_settings_store(|store| store.all())).await;
    envelope("Error loading settings", result)
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadRequest> {
    let mut request = UploadRequest::default();
    let mut has_image = false;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| NodeError::invalid_input(format!("Malformed upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                request.original_filename = field.file_name().map(str::to_string);
                request.data = field
                    .bytes()
                    .await
                    .map_err(|e| NodeError::invalid_input(format!("Malformed upload: {}", e)))?
                    .to_vec();
                has_image = true;
            }
            "overwrite" | "type" | "filename" | "subfolder" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| NodeError::invalid_input(format!("Malformed upload: {}", e)))?;
                match name.as_str() {
                    "overwrite" => request.overwrite = text == "true" || text == "1",
                    "type" => request.upload_type = Some(text),
                    "filename" => request.filename = Some(text),
                    _ => request.subfolder = text,
                }
            }
            other => warn!("Ignoring upload field {}", other),
        }
    }
    if !has_image {
        return Err(NodeError::invalid_input("Upload has no image field"));
    }
    Ok(request)
}

/// Store a multipart upload, answering `{name, subfolder, type}`
pub async fn upload_image(State(state): State<SharedState>, multipart: Multipart) -> Response {
    let request = match read_upload(multipart).await {
        Ok(request) => request,
        Err(e) => return error_status(&e),
    };
    let result = blocking(move || files::store_upload(&state.folders, &request)).await;
    match result {
        Ok(uploaded) => Json(uploaded).into_response(),
        Err(e) if status_for(&e).is_client_error() => error_status(&e),
        Err(e) => failure("Error uploading image", &e),
    }
}

/// Delete a validated file permanently
pub async fn delete_item(State(state): State<SharedState>, Query(query): Query<FileQuery>) -> Response {
    let result = blocking(move || {
        let requested = files::validate_requested_file(&state.folders, &query)?;
        let path: PathBuf = requested.file;
        let outcome = fs::remove_file(&path);
        Ok((path, outcome))
    })
    .await;

    match result {
        Ok((path, Ok(()))) => {
            let message = format!("File '{}' deleted permanently.", path.display());
            info!("{}", message);
            Json(json!({ "success": true, "type": "permanent", "message": message })).into_response()
        }
        Ok((path, Err(e))) => {
            let message = format!("Error occurred while deleting '{}': {}", path.display(), e);
            warn!("{}", message);
            Json(json!({ "success": false, "message": message })).into_response()
        }
        Err(e) => {
            warn!("File could not be deleted: {}", e);
            axum::http::StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::server::AppState;
    use crate::settings::SettingsStore;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn state() -> (tempfile::TempDir, SharedState) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("output/run/deep")).unwrap();
        fs::write(dir.path().join("output/run/a.png"), b"not really a png").unwrap();
        let state = AppState::with_settings(
            BackendConfig::new(dir.path().to_path_buf()),
            SettingsStore::open_memory().unwrap(),
        );
        (dir, Arc::new(state))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn file_query(filename: &str) -> FileQuery {
        FileQuery {
            kind: Some("output".to_string()),
            subfolder: Some("run".to_string()),
            filename: Some(filename.to_string()),
        }
    }

    #[tokio::test]
    async fn test_list_subdirectories_resets_cancellation() {
        let (_dir, state) = state();
        state.request_cancellation();
        let response = list_comfyui_subdirectories(
            State(state.clone()),
            Query(RootQuery {
                root_directory: Some("output".to_string()),
            }),
        )
        .await;
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["payload"], json!(["", "run", "run/deep"]));
        assert!(!state.is_cancelled());
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty_success() {
        let (_dir, state) = state();
        let response = list_comfyui_subdirectories(
            State(state),
            Query(RootQuery {
                root_directory: Some("output/missing".to_string()),
            }),
        )
        .await;
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["payload"], json!([]));
    }

    #[tokio::test]
    async fn test_delete_refuses_paths_outside_base() {
        let (dir, state) = state();
        let outside = dir.path().join("keep.txt");
        fs::write(&outside, b"keep").unwrap();

        let response = delete_item(State(state), Query(file_query("deep/../../../keep.txt"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(outside.exists());
        assert!(dir.path().join("output/run/a.png").exists());
    }

    #[tokio::test]
    async fn test_cancellation_route_sets_flag() {
        let (_dir, state) = state();
        let body = body_json(request_task_cancellation(State(state.clone())).await).await;
        assert_eq!(body["success"], true);
        assert!(state.is_cancelled());
    }

    #[tokio::test]
    async fn test_settings_routes() {
        let (_dir, state) = state();
        post_setting(
            State(state.clone()),
            Json(SettingRequest {
                name: "columns".to_string(),
                value: json!(4),
            }),
        )
        .await;
        let mut batch = Map::new();
        batch.insert("theme".to_string(), json!("dark"));
        post_all_settings(State(state.clone()), Json(batch)).await;

        let one = body_json(
            get_setting(
                State(state.clone()),
                Query(SettingQuery {
                    name: Some("columns".to_string()),
                }),
            )
            .await,
        )
        .await;
        assert_eq!(one["payload"], 4);

        let missing = body_json(
            get_setting(
                State(state.clone()),
                Query(SettingQuery {
                    name: Some("nope".to_string()),
                }),
            )
            .await,
        )
        .await;
        assert_eq!(missing["success"], true);
        assert!(missing["payload"].is_null());

        let all = body_json(get_all_settings(State(state)).await).await;
        assert_eq!(all["payload"], json!({"columns": 4, "theme": "dark"}));
    }

    #[tokio::test]
    async fn test_view_image_serves_raw_file() {
        let (_dir, state) = state();
        let response = view_image(
            State(state.clone()),
            Query(ViewQuery {
                file: file_query("a.png"),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "filename=\"a.png\""
        );

        let rejected = view_image(
            State(state),
            Query(ViewQuery {
                file: file_query("../a.png"),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_save_and_load_text() {
        let (dir, state) = state();
        let saved = save_text(
            State(state.clone()),
            Json(TextRequest {
                path: "output/notes.txt".to_string(),
                text: Some("hello".to_string()),
            }),
        )
        .await;
        assert_eq!(body_json(saved).await["success"], true);
        assert_eq!(fs::read_to_string(dir.path().join("output/notes.txt")).unwrap(), "hello");

        let loaded = load_text(
            State(state.clone()),
            Json(TextRequest {
                path: "output/notes.txt".to_string(),
                text: None,
            }),
        )
        .await;
        assert_eq!(body_json(loaded).await["payload"], "hello");

        let missing = load_text(
            State(state),
            Json(TextRequest {
                path: "output/none.txt".to_string(),
                text: None,
            }),
        )
        .await;
        let body = body_json(missing).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_copy_and_delete_item() {
        let (dir, state) = state();
        let copied = copy_item(
            State(state.clone()),
            Query(CopyQuery {
                file: file_query("a.png"),
                destination: Some("input".to_string()),
            }),
        )
        .await;
        let body = body_json(copied).await;
        assert_eq!(body["payload"]["name"], "a.png");
        assert!(dir.path().join("input/a.png").is_file());

        let deleted = delete_item(State(state.clone()), Query(file_query("a.png"))).await;
        let body = body_json(deleted).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["type"], "permanent");
        assert!(!dir.path().join("output/run/a.png").exists());

        let again = delete_item(State(state), Query(file_query("a.png"))).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_save_model_config_requires_fields() {
        let (_dir, state) = state();
        let response = save_model_config(
            State(state),
            Query(ModelConfigQuery {
                item_name: Some("cat.safetensors".to_string()),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
