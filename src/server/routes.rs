//! HTTP API of the sync server.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, put},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;

use super::{ChangeNotifier, ServerStore, StorageError};
use crate::models::{ChangeKind, Document, DocumentBody, EntityKind, Item};
use crate::protocol::{Frame, LastChangeResponse, SetCompletedRequest, HEARTBEAT_COMMENT};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: ServerStore,
    pub notifier: Arc<ChangeNotifier>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Storage(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::MissingParent(id) => {
                ApiError::Conflict(format!("document {} does not exist", id))
            }
            other => ApiError::Storage(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            ApiError::Storage(e) => {
                tracing::error!("storage error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage",
                    "internal storage error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/items", get(list_items).post(create_item))
        .route("/api/items/{id}/completed", put(set_completed))
        .route("/api/items/{id}", axum::routing::delete(delete_item))
        .route("/api/documents", get(list_documents).post(create_document))
        .route(
            "/api/document-bodies",
            get(list_document_bodies).post(create_document_body),
        )
        .route("/api/changes/last", get(last_change))
        .route("/api/events", get(events))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_items(State(state): State<AppState>) -> Result<Json<Vec<Item>>, ApiError> {
    Ok(Json(state.store.list_items().await?))
}

async fn create_item(
    State(state): State<AppState>,
    Json(item): Json<Item>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    let (stored, created) = state.store.create_item(&item).await?;
    if !created {
        return Ok((StatusCode::OK, Json(stored)));
    }
    state.notifier.publish(
        ChangeKind::Created,
        EntityKind::Item,
        &stored.id,
        serde_json::to_value(&stored).ok(),
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn set_completed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetCompletedRequest>,
) -> Result<Json<Item>, ApiError> {
    let item = state
        .store
        .set_completed(&id, request.completed)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("item {} does not exist", id)))?;
    state.notifier.publish(
        ChangeKind::Updated,
        EntityKind::Item,
        &id,
        Some(serde_json::json!({ "completed": item.completed })),
    );
    Ok(Json(item))
}

async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_item(&id).await? {
        state
            .notifier
            .publish(ChangeKind::Deleted, EntityKind::Item, &id, None);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_documents(State(state): State<AppState>) -> Result<Json<Vec<Document>>, ApiError> {
    Ok(Json(state.store.list_documents().await?))
}

async fn create_document(
    State(state): State<AppState>,
    Json(document): Json<Document>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let (stored, created) = state.store.create_document(&document).await?;
    if !created {
        return Ok((StatusCode::OK, Json(stored)));
    }
    state.notifier.publish(
        ChangeKind::Created,
        EntityKind::Document,
        &stored.id,
        serde_json::to_value(&stored).ok(),
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn list_document_bodies(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentBody>>, ApiError> {
    Ok(Json(state.store.list_bodies().await?))
}

async fn create_document_body(
    State(state): State<AppState>,
    Json(body): Json<DocumentBody>,
) -> Result<(StatusCode, Json<DocumentBody>), ApiError> {
    let (stored, created) = state.store.create_body(&body).await?;
    if !created {
        return Ok((StatusCode::OK, Json(stored)));
    }
    state.notifier.publish(
        ChangeKind::Created,
        EntityKind::DocumentBody,
        &stored.id,
        serde_json::to_value(&stored).ok(),
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn last_change(State(state): State<AppState>) -> Json<LastChangeResponse> {
    Json(LastChangeResponse {
        timestamp: state.notifier.last_change(),
    })
}

/// Long-lived change stream. The subscription lives inside the response
/// body, so it is dropped (and deregistered) as soon as the client goes
/// away. Idle streams get a `heartbeat` comment every heartbeat interval.
async fn events(State(state): State<AppState>) -> Response {
    let keep_alive = KeepAlive::new()
        .interval(state.notifier.heartbeat_interval())
        .text(HEARTBEAT_COMMENT);
    let events = state
        .notifier
        .subscribe()
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(sse_event(frame)));

    (
        [(HeaderName::from_static("x-accel-buffering"), "no")],
        Sse::new(events).keep_alive(keep_alive),
    )
        .into_response()
}

fn sse_event(frame: Frame) -> Event {
    match frame {
        Frame::Event { name, data } => Event::default().event(name).data(data),
        Frame::Comment(text) => Event::default().comment(text),
    }
}
