use crate::config::IngestConfig;
use crate::error::{AppError, AppResult};
use crate::sanitize::sanitize_metadata;
use crate::types::{IngestItem, InteractionEvent, PerformanceSample};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct IngestState {
    pub config: IngestConfig,
    pub tx: mpsc::Sender<IngestItem>,
}

fn require(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Ok(())
}

/// Validate an interaction event against required fields and size limits.
fn validate_event(event: &InteractionEvent, config: &IngestConfig) -> AppResult<()> {
    require("session_id", &event.session_id)?;
    require("project_id", &event.project_id)?;
    require("page_url", &event.page_url)?;
    if event.timestamp <= 0 {
        return Err(AppError::Validation("timestamp must be positive".to_string()));
    }
    let meta_len = event.metadata.to_string().len();
    if meta_len > config.max_metadata_bytes {
        return Err(AppError::Validation(format!(
            "metadata exceeds {} bytes",
            config.max_metadata_bytes
        )));
    }
    Ok(())
}

fn validate_sample(sample: &PerformanceSample, config: &IngestConfig) -> AppResult<()> {
    require("session_id", &sample.session_id)?;
    require("project_id", &sample.project_id)?;
    require("page_url", &sample.page_url)?;
    if sample.timestamp <= 0 {
        return Err(AppError::Validation("timestamp must be positive".to_string()));
    }
    if sample.js_errors.len() > config.max_batch_size {
        return Err(AppError::Validation(format!(
            "js_errors exceeds max size of {}",
            config.max_batch_size
        )));
    }
    Ok(())
}

/// Validate and strip sensitive metadata before the event leaves the handler.
fn process_event(mut event: InteractionEvent, config: &IngestConfig) -> AppResult<IngestItem> {
    validate_event(&event, config)?;
    event.metadata = sanitize_metadata(Some(event.metadata));
    Ok(IngestItem::Interaction(event))
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum EventsPayload {
    Batch { events: Vec<InteractionEvent> },
    Single(InteractionEvent),
}

/// POST /v1/events - Submit one interaction event or a `{"events": [...]}` batch.
pub async fn ingest_events(
    State(state): State<Arc<IngestState>>,
    Json(payload): Json<EventsPayload>,
) -> AppResult<Json<serde_json::Value>> {
    let events = match payload {
        EventsPayload::Single(event) => {
            let item = process_event(event, &state.config)?;
            // Backpressure: try_send, ACK even if dropped
            if state.tx.try_send(item).is_err() {
                tracing::warn!("channel full, event dropped");
            }
            return Ok(Json(serde_json::json!({ "status": "accepted" })));
        }
        EventsPayload::Batch { events } => events,
    };

    if events.len() > state.config.max_batch_size {
        return Err(AppError::Validation(format!(
            "batch exceeds max size of {}",
            state.config.max_batch_size
        )));
    }

    let mut accepted = 0u64;
    let mut dropped = 0u64;
    let mut errors = Vec::new();

    for (i, event) in events.into_iter().enumerate() {
        match process_event(event, &state.config) {
            Ok(item) => {
                if state.tx.try_send(item).is_err() {
                    dropped += 1;
                } else {
                    accepted += 1;
                }
            }
            Err(e) => {
                errors.push(serde_json::json!({
                    "index": i,
                    "error": e.to_string(),
                }));
            }
        }
    }

    if dropped > 0 {
        tracing::warn!(dropped, "channel full, batch events dropped");
    }

    Ok(Json(serde_json::json!({
        "accepted": accepted,
        "dropped": dropped,
        "errors": errors,
    })))
}

/// POST /v1/performance - Submit a web-vitals sample with the JS errors seen on the page.
pub async fn ingest_performance(
    State(state): State<Arc<IngestState>>,
    Json(sample): Json<PerformanceSample>,
) -> AppResult<Json<serde_json::Value>> {
    validate_sample(&sample, &state.config)?;

    if state.tx.try_send(IngestItem::Performance(sample)).is_err() {
        tracing::warn!("channel full, performance sample dropped");
    }

    Ok(Json(serde_json::json!({ "status": "accepted" })))
}
