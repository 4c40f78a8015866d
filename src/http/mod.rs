/// HTTP query surface
///
/// Read-only status/analytics endpoints plus the two embedding-catalog
/// controls. Every response carries the `{"success": ..., ...}` envelope;
/// NotFound maps to 404, Validation to 400, everything else to 500 with a
/// stable error string. Live reads come from the presence engine's memory;
/// event and analytics history traverses the store.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::catalog::EmbeddingCatalog;
use crate::errors::FacegateError;
use crate::presence::PresenceEngine;
use crate::store::{EventKind, PresenceStatus};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PresenceEngine>,
    pub catalog: Arc<EmbeddingCatalog>,
}

/// Error wrapper mapping domain error kinds onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(FacegateError);

impl From<FacegateError> for ApiError {
    fn from(e: FacegateError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FacegateError::NotFound(_) => StatusCode::NOT_FOUND,
            FacegateError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(overall_status))
        .route("/api/campus/:id/status", get(campus_status))
        .route("/api/campus/:id/events", get(campus_events))
        .route("/api/campus/:id/people", get(campus_people))
        .route("/api/campus/:id/analytics", get(campus_analytics))
        .route("/api/campus/:id/unknown", get(campus_unknowns))
        .route("/api/person/:id", get(person_status))
        .route("/api/analytics/summary", get(analytics_summary))
        .route("/api/embeddings/sync", post(force_sync))
        .route("/api/embeddings/stats", get(embedding_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), FacegateError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| FacegateError::Config(format!("Failed to bind {}: {}", bind, e)))?;
    tracing::info!(addr = %bind, "HTTP query surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| FacegateError::Transient(format!("HTTP server error: {}", e)))
}

async fn overall_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let campuses = state.engine.all_campus_statuses();
    let total_inside: u64 = campuses.iter().map(|c| c.current_inside).sum();
    let total_entries: u64 = campuses.iter().map(|c| c.total_entries_today).sum();
    let total_exits: u64 = campuses.iter().map(|c| c.total_exits_today).sum();

    Ok(ok(json!({
        "total_inside": total_inside,
        "total_entries_today": total_entries,
        "total_exits_today": total_exits,
        "campuses": campuses,
        "timestamp": chrono::Utc::now(),
    })))
}

async fn campus_status(
    State(state): State<AppState>,
    Path(campus_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .engine
        .campus_status(&campus_id)
        .ok_or_else(|| FacegateError::NotFound(format!("campus {}", campus_id)))?;
    Ok(ok(serde_json::to_value(status).map_err(|e| {
        FacegateError::Transient(e.to_string())
    })?))
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    limit: Option<usize>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn campus_events(
    State(state): State<AppState>,
    Path(campus_id): Path<String>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let kind = params
        .kind
        .as_deref()
        .map(|raw| {
            raw.parse::<EventKind>()
                .map_err(|_| FacegateError::validation("type", "Unknown event type"))
        })
        .transpose()?;

    let events = state.engine.campus_events(&campus_id, kind, limit).await?;
    let count = events.len();
    Ok(Json(json!({
        "success": true,
        "data": events,
        "count": count,
    })))
}

#[derive(Debug, Deserialize)]
struct PeopleParams {
    status: Option<String>,
}

async fn campus_people(
    State(state): State<AppState>,
    Path(campus_id): Path<String>,
    Query(params): Query<PeopleParams>,
) -> Result<Json<Value>, ApiError> {
    let status = match params.status.as_deref().unwrap_or("inside") {
        "all" => None,
        raw => Some(
            raw.parse::<PresenceStatus>()
                .map_err(|_| FacegateError::validation("status", "Expected inside, outside, or all"))?,
        ),
    };

    let people = state.engine.campus_people(&campus_id, status).await?;
    let count = people.len();
    Ok(Json(json!({
        "success": true,
        "data": people,
        "count": count,
    })))
}

#[derive(Debug, Deserialize)]
struct AnalyticsParams {
    days: Option<i64>,
}

async fn campus_analytics(
    State(state): State<AppState>,
    Path(campus_id): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<Value>, ApiError> {
    let days = params.days.unwrap_or(7);
    if days < 1 {
        return Err(FacegateError::validation("days", "days must be at least 1").into());
    }
    let rows = state.engine.campus_analytics(&campus_id, days).await?;
    let count = rows.len();
    Ok(Json(json!({
        "success": true,
        "data": rows,
        "count": count,
    })))
}

async fn campus_unknowns(
    State(state): State<AppState>,
    Path(campus_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let unknowns = state.engine.campus_unknowns(&campus_id);
    let total_detections: u64 = unknowns.iter().map(|u| u.detection_count).sum();
    let total_unique = unknowns.len();
    Ok(Json(json!({
        "success": true,
        "data": unknowns,
        "total_unique": total_unique,
        "total_detections": total_detections,
    })))
}

async fn person_status(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let person = state
        .engine
        .person_status(&subject_id)
        .ok_or_else(|| FacegateError::NotFound("Person not found".to_string()))?;
    Ok(ok(serde_json::to_value(person).map_err(|e| {
        FacegateError::Transient(e.to_string())
    })?))
}

async fn analytics_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let campuses = state.engine.all_campus_statuses();
    Ok(ok(json!({
        "total_campuses": campuses.len(),
        "total_inside": campuses.iter().map(|c| c.current_inside).sum::<u64>(),
        "total_employees_inside": campuses.iter().map(|c| c.employees_inside).sum::<u64>(),
        "total_visitors_inside": campuses.iter().map(|c| c.visitors_inside).sum::<u64>(),
        "total_entries_today": campuses.iter().map(|c| c.total_entries_today).sum::<u64>(),
        "total_exits_today": campuses.iter().map(|c| c.total_exits_today).sum::<u64>(),
        "total_unknown_today": campuses.iter().map(|c| c.unknown_detections_today).sum::<u64>(),
        "campus_breakdown": campuses,
        "timestamp": chrono::Utc::now(),
    })))
}

async fn force_sync(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.catalog.sync().await?;
    Ok(ok(json!({ "message": "Sync completed" })))
}

async fn embedding_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.catalog.stats();
    Ok(ok(serde_json::to_value(stats).map_err(|e| {
        FacegateError::Transient(e.to_string())
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CatalogConfig, PresenceConfig};
    use crate::store::memory::MemoryStore;
    use crate::store::{Camera, CameraRole, SubjectKind};
    use chrono::Utc;

    fn state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        let cameras = vec![Camera {
            camera_id: "cam1".to_string(),
            tenant_id: "t1".to_string(),
            campus_id: "campusA".to_string(),
            role: CameraRole::Entry,
            display_name: "Entry".to_string(),
        }];
        AppState {
            engine: Arc::new(PresenceEngine::new(
                store.clone(),
                PresenceConfig::default(),
                cameras,
            )),
            catalog: Arc::new(EmbeddingCatalog::new(
                store.clone(),
                store,
                "buffalo_l",
                CatalogConfig::default(),
            )),
        }
    }

    fn confirm_entry(state: &AppState) {
        let base = Utc::now();
        state
            .engine
            .process_identified("s1", SubjectKind::Employee, "Avery", "cam1", base, 0.9);
        state.engine.process_identified(
            "s1",
            SubjectKind::Employee,
            "Avery",
            "cam1",
            base + chrono::Duration::seconds(3),
            0.9,
        );
    }

    #[tokio::test]
    async fn test_overall_status_envelope() {
        let state = state();
        confirm_entry(&state);
        let Json(body) = overall_status(State(state)).await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["total_inside"], 1);
        assert_eq!(body["data"]["campuses"][0]["campus_id"], "campusA");
    }

    #[tokio::test]
    async fn test_campus_status_404_for_unknown_campus() {
        let state = state();
        let err = campus_status(State(state), Path("nowhere".to_string()))
            .await
            .err()
            .unwrap();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_person_status_found_and_missing() {
        let state = state();
        confirm_entry(&state);

        let Json(body) = person_status(State(state.clone()), Path("s1".to_string()))
            .await
            .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "inside");

        let err = person_status(State(state), Path("ghost".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_rejects_bad_type() {
        let state = state();
        let err = campus_events(
            State(state),
            Path("campusA".to_string()),
            Query(EventsParams {
                limit: None,
                kind: Some("teleport".to_string()),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_events_returns_flushed_entries() {
        let state = state();
        confirm_entry(&state);
        state.engine.flush().await.unwrap();

        let Json(body) = campus_events(
            State(state),
            Path("campusA".to_string()),
            Query(EventsParams {
                limit: Some(10),
                kind: Some("entry".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["kind"], "entry");
    }

    #[tokio::test]
    async fn test_embedding_stats_shape() {
        let state = state();
        let Json(body) = embedding_stats(State(state)).await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["total_embeddings"], 0);
        assert_eq!(body["data"]["initial_load_complete"], false);
    }
}
