//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chronoshard_core::catalog::{Chunk, CollectionMeta, SegmentBy};
use chronoshard_core::lifecycle::TickReport;
use chronoshard_core::rollup::DailyBucket;
use chronoshard_core::storage::{CollectionConfig, Engine, EngineStats, WriteSummary};
use chronoshard_core::{
    format_duration, parse_duration, ChunkError, FieldValue, Row, TimeRange, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Application state
pub type AppState = Arc<Engine>;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Create the API router
pub fn create_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        // Collections
        .route("/collections", get(list_collections).post(create_collection))
        .route("/collections/:name/thresholds", put(update_thresholds))
        .route("/collections/:name/rows", get(read_rows).post(write_rows))
        .route("/collections/:name/chunks", get(list_chunks))
        // Rollups
        .route("/rollups/:collection/:entity", get(rollup_range))
        // Maintenance
        .route("/maintenance/tick", post(tick))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Optional `[start, end)` bounds in nanoseconds; missing bounds are open
#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    limit: Option<usize>,
}

impl RangeParams {
    fn range(&self) -> TimeRange {
        TimeRange::new(
            self.start.unwrap_or(Timestamp::MIN),
            self.end.unwrap_or(Timestamp::MAX),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
    /// Rows of a failed batch that were stored anyway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<WriteSummary>,
}

/// Collection definition with durations rendered as strings
#[derive(Debug, Serialize)]
pub struct CollectionResponse {
    pub name: String,
    pub segment_by: SegmentBy,
    pub chunk_width: String,
    pub compress_after: String,
    pub retain_for: Option<String>,
    pub rollup: bool,
}

impl CollectionResponse {
    fn new(meta: CollectionMeta, rollup: bool) -> Self {
        Self {
            name: meta.name,
            segment_by: meta.segment_by,
            chunk_width: format_duration(meta.chunk_width),
            compress_after: format_duration(meta.compress_after),
            retain_for: meta.retain_for.map(format_duration),
            rollup,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ThresholdsRequest {
    pub compress_after: String,
    #[serde(default)]
    pub retain_for: Option<String>,
}

/// A row as plain JSON: fields map to numbers, booleans or strings
#[derive(Debug, Serialize, Deserialize)]
pub struct RowBody {
    pub time: Timestamp,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl RowBody {
    fn into_row(self) -> Result<Row, String> {
        let mut row = Row::new(self.time, self.entity);
        row.discriminator = self.discriminator;
        for (name, value) in self.fields {
            let value = field_from_json(&value)
                .ok_or_else(|| format!("Field {} has unsupported value {}", name, value))?;
            row.fields.insert(name, value);
        }
        Ok(row)
    }

    fn from_row(row: Row) -> Self {
        Self {
            time: row.time,
            entity: row.entity,
            discriminator: row.discriminator,
            fields: row
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), field_to_json(value)))
                .collect(),
        }
    }
}

fn field_from_json(value: &serde_json::Value) -> Option<FieldValue> {
    match value {
        serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        serde_json::Value::String(s) => Some(FieldValue::String(s.clone())),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FieldValue::Integer(i)),
            None => n.as_f64().map(FieldValue::Float),
        },
        _ => None,
    }
}

fn field_to_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Integer(i) => serde_json::json!(i),
        FieldValue::Float(f) => serde_json::json!(f),
        FieldValue::Boolean(b) => serde_json::json!(b),
        FieldValue::String(s) => serde_json::json!(s),
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn status_for(err: &ChunkError) -> StatusCode {
    match err.root() {
        ChunkError::CollectionNotFound(_)
        | ChunkError::ChunkNotFound(_)
        | ChunkError::RollupNotFound(_) => StatusCode::NOT_FOUND,
        ChunkError::CollectionExists(_) | ChunkError::DuplicateRange { .. } => {
            StatusCode::CONFLICT
        }
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        ChunkError::InvalidFormat(_) | ChunkError::InvalidState(_) | ChunkError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: ChunkError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!("Request failed: {}", err);
    }
    let written = match &err {
        ChunkError::PartialBatch {
            inserted,
            duplicates,
            ..
        } => Some(WriteSummary {
            inserted: *inserted,
            duplicates: *duplicates,
        }),
        _ => None,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            retryable: err.is_retryable(),
            written,
        }),
    )
}

fn bad_request(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error,
            retryable: false,
            written: None,
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: chronoshard_core::VERSION.to_string(),
    })
}

async fn stats(State(engine): State<AppState>) -> Json<EngineStats> {
    Json(engine.stats())
}

async fn list_collections(State(engine): State<AppState>) -> Json<Vec<CollectionResponse>> {
    Json(
        engine
            .collections()
            .into_iter()
            .map(|meta| {
                let rollup = engine.rollup(&meta.name).is_ok();
                CollectionResponse::new(meta, rollup)
            })
            .collect(),
    )
}

async fn create_collection(
    State(engine): State<AppState>,
    Json(config): Json<CollectionConfig>,
) -> ApiResult<(StatusCode, Json<CollectionResponse>)> {
    let rollup = config.rollup.is_some();
    let meta = engine.register_collection(config).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(CollectionResponse::new(meta, rollup))))
}

async fn update_thresholds(
    State(engine): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ThresholdsRequest>,
) -> ApiResult<Json<CollectionResponse>> {
    let compress_after = parse_duration(&req.compress_after).map_err(api_error)?;
    let retain_for = req
        .retain_for
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(api_error)?;

    let meta = engine
        .update_thresholds(&name, compress_after, retain_for)
        .map_err(api_error)?;
    let rollup = engine.rollup(&name).is_ok();
    Ok(Json(CollectionResponse::new(meta, rollup)))
}

async fn write_rows(
    State(engine): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Vec<RowBody>>,
) -> ApiResult<Json<WriteSummary>> {
    let rows = body
        .into_iter()
        .map(RowBody::into_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(bad_request)?;

    let summary = engine.write_batch(&name, rows).map_err(api_error)?;
    Ok(Json(summary))
}

async fn read_rows(
    State(engine): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<RowBody>>> {
    let scan = engine.read(&name, params.range()).map_err(api_error)?;
    let limit = params.limit.unwrap_or(usize::MAX);

    let rows = scan
        .take(limit)
        .map(|row| row.map(RowBody::from_row))
        .collect::<chronoshard_core::Result<Vec<_>>>()
        .map_err(api_error)?;
    Ok(Json(rows))
}

async fn list_chunks(
    State(engine): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<Chunk>>> {
    let chunks = engine.chunks(&name, params.range()).map_err(api_error)?;
    Ok(Json(chunks))
}

async fn rollup_range(
    State(engine): State<AppState>,
    Path((collection, entity)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<DailyBucket>>> {
    let buckets = engine
        .rollup_range(&collection, &entity, params.range())
        .map_err(api_error)?;
    Ok(Json(buckets))
}

async fn tick(State(engine): State<AppState>) -> ApiResult<Json<TickReport>> {
    let report = tokio::task::spawn_blocking(move || engine.tick())
        .await
        .map_err(|e| api_error(ChunkError::Internal(e.to_string())))?;
    Ok(Json(report))
}
