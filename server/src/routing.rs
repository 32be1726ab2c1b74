//! HTTP routing configuration
//!
//! Everything besides `/ws` is a collaborator of the relay core: the
//! landing page, the multipart upload/download fallback sharing the
//! scratch directory, and the small read-only status surface.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::registry::now_millis;
use crate::transfer::MAX_MEMORY;
use crate::websocket::{ServerState, MAX_FILE_SIZE};

const MAX_FILES_PER_REQUEST: usize = 50;

const BLOCKED_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".sh", ".php", ".js", ".jar"];

const ALLOWED_MIME_PREFIXES: &[&str] = &[
    "image/",
    "video/",
    "audio/",
    "text/",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "application/zip",
    "application/x-rar-compressed",
];

const LANDING_HTML: &str = "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>beamdrop</title></head>\n<body>\n<h1>beamdrop</h1>\n<p>Room-scoped file relay. Connect a client to <code>/ws</code>.</p>\n</body>\n</html>\n";

/// Create the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/", get(landing))
        .route("/ws", get(crate::websocket::handle_websocket))
        .route("/health", get(health_check))
        .route("/api/upload", post(upload))
        .route("/api/download/:filename", get(download))
        .route("/api/server-info", get(server_info))
        .route("/api/rooms", get(room_catalog))
        .route("/api/transfers/:id", delete(release_transfer))
        .route("/api/ios-health", get(ios_health))
        .route("/api/safari-check", get(safari_check))
        .route("/api/ios-reconnect", post(ios_reconnect))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_FILE_SIZE as usize + 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build CORS layer from config. Permissive when no origins are configured.
fn build_cors_layer(origins: &Option<String>) -> CorsLayer {
    match origins {
        Some(list) if !list.is_empty() => {
            let parsed: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
        }
        _ => CorsLayer::permissive(),
    }
}

async fn landing() -> Html<&'static str> {
    Html(LANDING_HTML)
}

/// Health check — no sensitive data
async fn health_check() -> &'static str {
    "OK"
}

// ---------------------------------------------------------------------------
// Upload fallback
// ---------------------------------------------------------------------------

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
}

fn internal(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
}

/// Keep only `[A-Za-z0-9._-]`, never empty.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_').to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

fn extension_blocked(name: &str) -> bool {
    let lower = name.to_lowercase();
    BLOCKED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn mime_allowed(mime: &str) -> bool {
    ALLOWED_MIME_PREFIXES
        .iter()
        .any(|prefix| mime.starts_with(prefix))
}

async fn upload(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let upload_dir = PathBuf::from(&state.config.upload_dir);
    fs::create_dir_all(&upload_dir)
        .await
        .map_err(|e| internal(&e.to_string()))?;

    let mut stored = Vec::new();
    let mut total_size: u64 = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&e.to_string()))?
    {
        if stored.len() >= MAX_FILES_PER_REQUEST {
            return Err(bad_request("too many files"));
        }
        let Some(file_name) = field.file_name().map(sanitize_filename) else {
            continue;
        };
        let mime = field.content_type().unwrap_or("").to_string();

        if extension_blocked(&file_name) {
            return Err(bad_request("file type not allowed"));
        }
        if !mime.is_empty() && !mime_allowed(&mime) {
            return Err(bad_request("content type not allowed"));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request(&e.to_string()))?;
        if data.len() as u64 > MAX_FILE_SIZE {
            return Err(bad_request("file too large"));
        }

        let stored_name = format!("{}-{}", now_millis(), file_name);
        let path = upload_dir.join(&stored_name);
        fs::write(&path, &data)
            .await
            .map_err(|e| internal(&e.to_string()))?;

        total_size += data.len() as u64;
        info!(name = %stored_name, size = data.len(), "scratch file stored");
        stored.push(json!({
            "name": file_name,
            "size": data.len(),
            "type": mime,
            "path": stored_name,
            "url": format!("/api/download/{stored_name}"),
            "uploadedAt": now_millis(),
        }));
    }

    Ok(Json(json!({
        "success": true,
        "files": stored,
        "totalSize": total_size,
    })))
}

async fn download(
    State(state): State<Arc<ServerState>>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let safe_name = sanitize_filename(&filename);
    let upload_dir = PathBuf::from(&state.config.upload_dir);
    let path = upload_dir.join(&safe_name);

    // Sanitation leaves no separators, but keep the guard anyway.
    if !path.starts_with(&upload_dir) {
        return Err(StatusCode::FORBIDDEN);
    }

    let data = fs::read(&path).await.map_err(|_| StatusCode::NOT_FOUND)?;

    // Attachment name: the original name without the storage timestamp.
    let display_name = safe_name
        .split_once('-')
        .map(|(prefix, rest)| {
            if prefix.chars().all(|c| c.is_ascii_digit()) {
                rest
            } else {
                safe_name.as_str()
            }
        })
        .unwrap_or(safe_name.as_str())
        .to_string();

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{display_name}\""),
            ),
        ],
        data,
    ))
}

// ---------------------------------------------------------------------------
// Status surface
// ---------------------------------------------------------------------------

async fn server_info(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "name": "beamdrop",
        "protocolVersion": 1,
        "devices": state.devices.len(),
        "devicesOnline": state.devices.online_count(),
        "rooms": state.rooms.len(),
        "connections": state.connection_total(),
        "activeTransfers": state.transfers.governor.active_transfers(),
        "memoryInFlight": state.transfers.governor.memory_in_flight(),
        "memoryLimit": MAX_MEMORY,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn room_catalog(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({ "rooms": state.rooms.catalog() }))
}

async fn release_transfer(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if state.transfers.force_release(&id) {
        warn!(transfer_id = %id, "transfer force-released over HTTP");
        Ok(Json(json!({ "success": true, "transferId": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// ---------------------------------------------------------------------------
// Mobile capability pings
// ---------------------------------------------------------------------------

async fn ios_health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": now_millis() }))
}

async fn safari_check() -> Json<Value> {
    Json(json!({ "supported": true, "chunkSize": crate::websocket::MOBILE_CHUNK_SIZE }))
}

async fn ios_reconnect() -> Json<Value> {
    Json(json!({ "success": true, "timestamp": now_millis() }))
}
