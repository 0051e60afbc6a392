use crate::config::DetectionConfig;
use crate::error::{AppError, AppResult};
use crate::fingerprint::{group_errors, occurrences};
use crate::query::cache::SignalCache;
use crate::signals::dead::{detect_dead_clicks, rollup_dead};
use crate::signals::heatmap::{
    cluster_points, cluster_points_sorted, points_from_events, relative_intensity, HeatmapType,
};
use crate::signals::rage::{detect_rage_clicks, rollup_rage, RageConfig};
use crate::signals::trend::{count_trend, error_trend, rage_trend};
use crate::storage::queries::{self, HeatmapAggregate};
use crate::types::{EventType, HealthResponse, IngestItem, WindowParams};
use axum::extract::{Query, State};
use axum::Json;
use deadpool_sqlite::Pool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct QueryState {
    pub pool: Pool,
    pub cache: SignalCache,
    pub detection: DetectionConfig,
    pub channel_capacity: usize,
    pub channel_tx: mpsc::Sender<IngestItem>,
}

/// Serve from the response cache or compute, store and return.
macro_rules! cached_or_compute {
    ($state:expr, $key:expr, $compute:expr) => {{
        let key: String = $key;
        if let Some(cached) = $state.cache.get(&key) {
            let val: serde_json::Value = serde_json::from_str(&cached)
                .map_err(|e| AppError::Internal(format!("cache deserialize: {e}")))?;
            return Ok(Json(val));
        }
        let result = $compute;
        let json_str = serde_json::to_string(&result)
            .map_err(|e| AppError::Internal(format!("serialize: {e}")))?;
        $state.cache.insert(key, json_str);
        Ok(Json(serde_json::to_value(&result).map_err(|e| {
            AppError::Internal(format!("serialize: {e}"))
        })?))
    }};
}

/// Run a detector off the async runtime.
async fn blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("detector task failed: {e}")))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// GET /health
pub async fn health(State(state): State<Arc<QueryState>>) -> Json<HealthResponse> {
    let db_ok = match state.pool.get().await {
        Ok(conn) => conn
            .interact(|conn| conn.execute_batch("SELECT 1"))
            .await
            .is_ok(),
        Err(_) => false,
    };

    // Approximate buffer usage from channel capacity
    let buffer_usage = 1.0 - (state.channel_tx.capacity() as f64 / state.channel_capacity as f64);

    Json(HealthResponse {
        status: if db_ok {
            "ok".into()
        } else {
            "degraded".into()
        },
        db_ok,
        buffer_usage,
    })
}

#[derive(Debug, Deserialize)]
pub struct HeatmapParams {
    #[serde(rename = "type", default)]
    pub heatmap_type: HeatmapType,
    pub device: Option<String>,
    pub radius: Option<f64>,
    /// Sort points by position before clustering.
    #[serde(default)]
    pub stable: bool,
}

#[derive(Debug, Serialize)]
pub struct HeatmapClusterView {
    pub x: f64,
    pub y: f64,
    pub intensity: f64,
    pub count: u64,
    pub relative: f64,
}

#[derive(Debug, Serialize)]
pub struct HeatmapResponse {
    pub project_id: String,
    pub page_url: String,
    #[serde(rename = "type")]
    pub heatmap_type: HeatmapType,
    pub device: Option<String>,
    pub radius: f64,
    pub point_count: usize,
    pub clusters: Vec<HeatmapClusterView>,
}

fn heatmap_target(window: &WindowParams) -> AppResult<(String, String)> {
    match (&window.project_id, &window.page_url) {
        (Some(project_id), Some(page_url)) => Ok((project_id.clone(), page_url.clone())),
        _ => Err(AppError::Validation(
            "project_id and page_url are required".to_string(),
        )),
    }
}

/// GET /v1/heatmap - Cluster the page's interaction points and store the result.
pub async fn heatmap(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<HeatmapParams>,
) -> AppResult<Json<serde_json::Value>> {
    let (project_id, page_url) = heatmap_target(&window)?;
    let radius = params.radius.unwrap_or(state.detection.cluster_radius);
    if radius.is_nan() || radius < 0.0 {
        return Err(AppError::Validation("radius must be non-negative".to_string()));
    }

    let now = now_ms();
    let hours = state.detection.default_hours;
    let key = format!(
        "{}:{}:{}:{}",
        window.cache_key("heatmap", now, hours),
        params.heatmap_type.as_str(),
        params.device.as_deref().unwrap_or("all"),
        radius,
    ) + if params.stable { ":stable" } else { "" };

    cached_or_compute!(state, key, {
        let filter = window.filter(now, hours, Some(params.heatmap_type.event_type()));
        let events = queries::fetch_interactions(&state.pool, filter, params.device.clone()).await?;

        let stable = params.stable;
        let (clusters, point_count) = blocking(move || {
            let points = points_from_events(&events);
            let clusters = if stable {
                cluster_points_sorted(&points, radius)
            } else {
                cluster_points(&points, radius)
            };
            (clusters, points.len())
        })
        .await?;

        if let Err(e) = queries::save_heatmap_aggregate(
            &state.pool,
            &project_id,
            &page_url,
            params.heatmap_type,
            params.device.as_deref(),
            &clusters,
            point_count,
        )
        .await
        {
            tracing::warn!(error = %e, page_url = %page_url, "failed to store heatmap aggregate");
        }

        let relative = relative_intensity(&clusters);
        HeatmapResponse {
            project_id,
            page_url,
            heatmap_type: params.heatmap_type,
            device: params.device.clone(),
            radius,
            point_count,
            clusters: clusters
                .into_iter()
                .zip(relative)
                .map(|(c, relative)| HeatmapClusterView {
                    x: c.x,
                    y: c.y,
                    intensity: c.intensity,
                    count: c.count,
                    relative,
                })
                .collect(),
        }
    })
}

/// GET /v1/heatmap/latest - Last stored aggregate, without recomputing.
pub async fn latest_heatmap(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<HeatmapParams>,
) -> AppResult<Json<HeatmapAggregate>> {
    let (project_id, page_url) = heatmap_target(&window)?;
    let aggregate = queries::load_heatmap_aggregate(
        &state.pool,
        &project_id,
        &page_url,
        params.heatmap_type,
        params.device.as_deref(),
    )
    .await?;

    aggregate
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no heatmap stored for {page_url}")))
}

#[derive(Debug, Deserialize)]
pub struct RageParams {
    pub window_ms: Option<i64>,
    pub threshold: Option<usize>,
}

impl RageParams {
    fn config(&self, defaults: &DetectionConfig) -> AppResult<RageConfig> {
        let mut config = defaults.rage();
        if let Some(window_ms) = self.window_ms {
            config.window_ms = window_ms;
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if config.window_ms <= 0 || config.threshold == 0 {
            return Err(AppError::Validation(
                "window_ms and threshold must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

/// GET /v1/rage-clicks - Rage incidents and per-spot totals.
pub async fn rage_clicks(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<RageParams>,
) -> AppResult<Json<serde_json::Value>> {
    let config = params.config(&state.detection)?;
    let now = now_ms();
    let hours = state.detection.default_hours;
    let key = format!(
        "{}:{}:{}",
        window.cache_key("rage", now, hours),
        config.window_ms,
        config.threshold
    );

    cached_or_compute!(state, key, {
        let filter = window.filter(now, hours, Some(EventType::Click));
        let events = queries::fetch_interactions(&state.pool, filter, None).await?;

        blocking(move || {
            let incidents = detect_rage_clicks(&events, config);
            let spots = rollup_rage(&incidents);
            serde_json::json!({ "incidents": incidents, "spots": spots })
        })
        .await?
    })
}

#[derive(Debug, Deserialize)]
pub struct DeadClickParams {
    pub idle_ms: Option<i64>,
}

/// GET /v1/dead-clicks - Clicks with no visible reaction, and per-spot totals.
pub async fn dead_clicks(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<DeadClickParams>,
) -> AppResult<Json<serde_json::Value>> {
    let mut config = state.detection.dead();
    if let Some(idle_ms) = params.idle_ms {
        if idle_ms <= 0 {
            return Err(AppError::Validation("idle_ms must be positive".to_string()));
        }
        config.idle_ms = idle_ms;
    }
    let now = now_ms();
    let hours = state.detection.default_hours;
    let key = format!("{}:{}", window.cache_key("dead", now, hours), config.idle_ms);

    cached_or_compute!(state, key, {
        // Every event type can be a reaction, and the reaction is often a
        // pageview on another page, so neither type nor page is filtered here
        let mut filter = window.filter(now, hours, None);
        let page_url = filter.page_url.take();
        let events = queries::fetch_interactions(&state.pool, filter, None).await?;

        blocking(move || {
            let mut records = detect_dead_clicks(&events, config);
            if let Some(ref page_url) = page_url {
                records.retain(|r| &r.page_url == page_url);
            }
            let spots = rollup_dead(&records);
            serde_json::json!({ "dead_clicks": records, "spots": spots })
        })
        .await?
    })
}

#[derive(Debug, Deserialize)]
pub struct ErrorGroupParams {
    pub limit: Option<usize>,
}

/// GET /v1/errors - JS errors grouped by fingerprint, most frequent first.
pub async fn errors(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<ErrorGroupParams>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = params
        .limit
        .unwrap_or(state.detection.error_group_limit)
        .clamp(1, 200);
    let now = now_ms();
    let hours = state.detection.default_hours;
    let key = format!("{}:{}", window.cache_key("errors", now, hours), limit);

    cached_or_compute!(state, key, {
        let filter = window.filter(now, hours, None);
        let samples = queries::fetch_samples(&state.pool, filter).await?;

        blocking(move || group_errors(occurrences(&samples), limit)).await?
    })
}

/// GET /v1/trends/rage - Sessions with a rage burst, per hour.
pub async fn rage_trends(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<RageParams>,
) -> AppResult<Json<serde_json::Value>> {
    let config = params.config(&state.detection)?;
    let now = now_ms();
    let hours = state.detection.default_hours;
    let key = format!(
        "{}:{}:{}",
        window.cache_key("trend-rage", now, hours),
        config.window_ms,
        config.threshold
    );

    cached_or_compute!(state, key, {
        let filter = window.filter(now, hours, Some(EventType::Click));
        let events = queries::fetch_interactions(&state.pool, filter, None).await?;

        blocking(move || rage_trend(&events, config)).await?
    })
}

/// GET /v1/trends/errors - JS error count per hour.
pub async fn error_trends(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
) -> AppResult<Json<serde_json::Value>> {
    let now = now_ms();
    let hours = state.detection.default_hours;

    cached_or_compute!(state, window.cache_key("trend-errors", now, hours), {
        let filter = window.filter(now, hours, None);
        let samples = queries::fetch_samples(&state.pool, filter).await?;
        error_trend(&samples)
    })
}

#[derive(Debug, Deserialize)]
pub struct EventTrendParams {
    pub event_type: Option<EventType>,
}

/// GET /v1/trends/events - Interaction volume per hour, optionally for one event type.
pub async fn event_trends(
    State(state): State<Arc<QueryState>>,
    Query(window): Query<WindowParams>,
    Query(params): Query<EventTrendParams>,
) -> AppResult<Json<serde_json::Value>> {
    let now = now_ms();
    let hours = state.detection.default_hours;
    let key = format!(
        "{}:{}",
        window.cache_key("trend-events", now, hours),
        params.event_type.map(|t| t.as_str()).unwrap_or("all")
    );

    cached_or_compute!(state, key, {
        let filter = window.filter(now, hours, params.event_type);
        let events = queries::fetch_interactions(&state.pool, filter, None).await?;
        count_trend(events.iter().map(|e| e.timestamp))
    })
}
