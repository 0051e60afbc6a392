use crate::alert::dispatch::{AlertDispatcher, AlertNotification};
use crate::alert::evaluator::Notifier;
use crate::alert::rules::{self, AlertRule, CreateAlertRule, UpdateAlertRule};
use crate::error::{AppError, AppResult};
use crate::ingest::handler::{self as ingest_handler, IngestState};
use crate::query::handler::{self as query_handler, QueryState};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AlertState {
    pub pool: deadpool_sqlite::Pool,
    pub dispatcher: Arc<AlertDispatcher>,
}

async fn list_alerts_handler(State(state): State<Arc<AlertState>>) -> AppResult<Json<Vec<AlertRule>>> {
    let rules = rules::list_alert_rules(&state.pool).await?;
    Ok(Json(rules))
}

async fn create_alert_handler(
    State(state): State<Arc<AlertState>>,
    Json(input): Json<CreateAlertRule>,
) -> AppResult<Json<AlertRule>> {
    let rule = rules::create_alert_rule(&state.pool, input).await?;
    tracing::info!(rule_id = rule.id, metric = %rule.metric, "alert rule created");
    Ok(Json(rule))
}

async fn update_alert_handler(
    State(state): State<Arc<AlertState>>,
    Path(id): Path<i64>,
    Json(input): Json<UpdateAlertRule>,
) -> AppResult<Json<AlertRule>> {
    let rule = rules::update_alert_rule(&state.pool, id, input).await?;
    Ok(Json(rule))
}

async fn delete_alert_handler(
    State(state): State<Arc<AlertState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    rules::delete_alert_rule(&state.pool, id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// POST /v1/alerts/{id}/test - Send a test notification on the rule's channel.
/// Does not touch `last_triggered_at`.
async fn test_alert_handler(
    State(state): State<Arc<AlertState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let rule = rules::get_alert_rule(&state.pool, id).await?;
    let alert = AlertNotification {
        rule_name: format!("{} (test)", rule.name),
        metric: rule.metric.clone(),
        value: rule.threshold,
        comparator: rule.comparator.as_str().to_string(),
        threshold: rule.threshold,
        project_id: rule.project_id.clone(),
    };
    state
        .dispatcher
        .notify(&rule.channel, &alert)
        .await
        .map_err(|e| AppError::Internal(format!("test dispatch failed: {e}")))?;
    Ok(Json(serde_json::json!({ "sent": true })))
}

/// Assemble the HTTP surface. Ingest accepts any origin; the query and
/// alert API is limited to `cors_origin` when set.
pub fn build_router(
    ingest_state: Arc<IngestState>,
    query_state: Arc<QueryState>,
    alert_state: Arc<AlertState>,
    max_payload_bytes: usize,
    cors_origin: Option<&str>,
) -> Result<Router, axum::http::header::InvalidHeaderValue> {
    let ingest_routes = Router::new()
        .route("/v1/events", post(ingest_handler::ingest_events))
        .route("/v1/performance", post(ingest_handler::ingest_performance))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .with_state(ingest_state);

    let query_routes = Router::new()
        .route("/health", get(query_handler::health))
        .route("/v1/heatmap", get(query_handler::heatmap))
        .route("/v1/heatmap/latest", get(query_handler::latest_heatmap))
        .route("/v1/rage-clicks", get(query_handler::rage_clicks))
        .route("/v1/dead-clicks", get(query_handler::dead_clicks))
        .route("/v1/errors", get(query_handler::errors))
        .route("/v1/trends/rage", get(query_handler::rage_trends))
        .route("/v1/trends/errors", get(query_handler::error_trends))
        .route("/v1/trends/events", get(query_handler::event_trends))
        .with_state(query_state);

    let alert_routes = Router::new()
        .route("/v1/alerts", get(list_alerts_handler))
        .route("/v1/alerts", post(create_alert_handler))
        .route("/v1/alerts/{id}", put(update_alert_handler))
        .route("/v1/alerts/{id}", delete(delete_alert_handler))
        .route("/v1/alerts/{id}/test", post(test_alert_handler))
        .with_state(alert_state);

    let mut api_routes = Router::new().merge(query_routes).merge(alert_routes);
    if let Some(origin) = cors_origin {
        let api_cors = CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin.parse::<HeaderValue>()?))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE]);
        api_routes = api_routes.layer(api_cors);
    }

    // Tracking scripts report from any site
    let ingest_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Ok(api_routes
        .merge(ingest_routes.layer(ingest_cors))
        .layer(TraceLayer::new_for_http()))
}
