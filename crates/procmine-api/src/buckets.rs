// Bucket ingest and event-object link HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use procmine_core::error::EngineError;
use procmine_core::event::EventRef;
use procmine_core::objects::{BusinessObject, LinkProvenance};
use procmine_storage::{BucketSummary, Database, NewEvent};
use procmine_worker::workers::enqueue_event;
use procmine_worker::{EnrichmentQueue, OntologyService, TaskPriority};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ontology: Arc<OntologyService>,
    pub queue: Arc<EnrichmentQueue>,
}

/// One watcher event in an ingest batch
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Body of POST /buckets/:bucket/events
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    pub events: Vec<IngestEvent>,
}

/// Ingest outcome
#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub inserted: u64,
    pub links_written: u64,
}

/// Bucket listing entry
#[derive(Debug, Serialize, ToSchema)]
pub struct BucketInfo {
    pub bucket_id: String,
    pub event_count: i64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl From<BucketSummary> for BucketInfo {
    fn from(row: BucketSummary) -> Self {
        Self {
            bucket_id: row.bucket_id,
            event_count: row.event_count,
            last_timestamp: row.last_timestamp,
        }
    }
}

/// Request to link an event to an object
#[derive(Debug, Deserialize, ToSchema)]
pub struct LinkObjectRequest {
    pub object_id: Uuid,
}

/// Create bucket and link routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/buckets", get(list_buckets))
        .route("/buckets/:bucket/events", post(ingest_events))
        .route(
            "/buckets/:bucket/events/:event/objects",
            get(event_objects).post(link_object),
        )
        .route(
            "/buckets/:bucket/events/:event/objects/:object_id",
            axum::routing::delete(unlink_object),
        )
        .with_state(state)
}

/// GET /buckets
#[utoipa::path(
    get,
    path = "/api/0/buckets",
    responses(
        (status = 200, description = "Known buckets with counts", body = ListResponse<BucketInfo>)
    ),
    tag = "buckets"
)]
pub async fn list_buckets(State(state): State<AppState>) -> ApiResult<Json<ListResponse<BucketInfo>>> {
    let rows = state.db.list_buckets().await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<BucketInfo>>().into()))
}

/// POST /buckets/:bucket/events - append watcher events
///
/// Events are append-only; re-sent ids are ignored. New events flow through
/// the extractor inline and, when they carry OCR or screenshot content,
/// into the enrichment queue without ever blocking this path.
#[utoipa::path(
    post,
    path = "/api/0/buckets/{bucket}/events",
    params(("bucket" = String, Path, description = "Bucket name")),
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Batch accepted", body = IngestResponse)
    ),
    tag = "buckets"
)]
pub async fn ingest_events(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<Json<IngestResponse>> {
    let new_events: Vec<NewEvent> = req
        .events
        .iter()
        .map(|e| NewEvent {
            id: e.id,
            timestamp: e.timestamp,
            duration: e.duration,
            data: e.data.clone(),
        })
        .collect();
    let inserted = state.db.insert_events(&bucket, &new_events).await?;

    let events: Vec<procmine_core::event::WatchedEvent> = req
        .events
        .into_iter()
        .map(|e| procmine_core::event::WatchedEvent {
            bucket_id: bucket.clone(),
            id: e.id,
            timestamp: e.timestamp,
            duration: e.duration,
            data: e.data,
        })
        .collect();
    let stats = state.ontology.extract_and_persist(&events).await?;
    for event in &events {
        enqueue_event(&state.queue, event, TaskPriority::Normal);
    }

    Ok(Json(IngestResponse {
        inserted,
        links_written: stats.links_written,
    }))
}

/// GET /buckets/:bucket/events/:event/objects
#[utoipa::path(
    get,
    path = "/api/0/buckets/{bucket}/events/{event}/objects",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("event" = i64, Path, description = "Event ID within the bucket")
    ),
    responses(
        (status = 200, description = "Objects linked to the event", body = ListResponse<BusinessObject>),
        (status = 404, description = "Event not found")
    ),
    tag = "buckets"
)]
pub async fn event_objects(
    State(state): State<AppState>,
    Path((bucket, event)): Path<(String, i64)>,
) -> ApiResult<Json<ListResponse<BusinessObject>>> {
    ensure_event(&state.db, &bucket, event).await?;
    let event_ref = EventRef {
        bucket_id: bucket,
        event_id: event,
    };
    let rows = state.db.objects_for_event(&event_ref).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<BusinessObject>>().into()))
}

/// POST /buckets/:bucket/events/:event/objects - manual link, idempotent
#[utoipa::path(
    post,
    path = "/api/0/buckets/{bucket}/events/{event}/objects",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("event" = i64, Path, description = "Event ID within the bucket")
    ),
    request_body = LinkObjectRequest,
    responses(
        (status = 204, description = "Link present"),
        (status = 404, description = "Event or object not found")
    ),
    tag = "buckets"
)]
pub async fn link_object(
    State(state): State<AppState>,
    Path((bucket, event)): Path<(String, i64)>,
    Json(req): Json<LinkObjectRequest>,
) -> ApiResult<StatusCode> {
    ensure_event(&state.db, &bucket, event).await?;
    let event_ref = EventRef {
        bucket_id: bucket,
        event_id: event,
    };
    state
        .db
        .link_event_to_object(&event_ref, req.object_id, &LinkProvenance::Manual, 1.0)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /buckets/:bucket/events/:event/objects/:object_id
///
/// Removing a rule-derived link counts as a rejection of that rule.
#[utoipa::path(
    delete,
    path = "/api/0/buckets/{bucket}/events/{event}/objects/{object_id}",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("event" = i64, Path, description = "Event ID within the bucket"),
        ("object_id" = Uuid, Path, description = "Object ID")
    ),
    responses(
        (status = 204, description = "Link removed"),
        (status = 404, description = "Link not found")
    ),
    tag = "buckets"
)]
pub async fn unlink_object(
    State(state): State<AppState>,
    Path((bucket, event, object_id)): Path<(String, i64, Uuid)>,
) -> ApiResult<StatusCode> {
    let event_ref = EventRef {
        bucket_id: bucket,
        event_id: event,
    };
    let links = state.db.links_for_event(&event_ref).await?;
    if !links.iter().any(|l| l.object_uuid() == object_id) {
        return Err(ApiError(EngineError::not_found("link", object_id)));
    }
    state.ontology.reject(&event_ref, object_id, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ensure_event(db: &Database, bucket: &str, event: i64) -> ApiResult<()> {
    if db.get_event(bucket, event).await?.is_none() {
        return Err(ApiError(EngineError::not_found(
            "event",
            format!("{bucket}/{event}"),
        )));
    }
    Ok(())
}
