use crate::error::{AppError, AppResult};
use crate::signals::heatmap::{HeatmapCluster, HeatmapType};
use crate::types::{EventFilter, EventType, InteractionEvent, PerformanceSample};
use deadpool_sqlite::Pool;
use rusqlite::params;
use serde::Serialize;

/// Build the shared `WHERE` clause for a filter. `table_has_type` is false
/// for performance samples, which carry no event type.
fn where_clause(
    filter: &EventFilter,
    table_has_type: bool,
) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let mut sql = String::from(" WHERE timestamp >= ?1 AND timestamp <= ?2");
    let mut bind_values: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(filter.since), Box::new(filter.until)];

    if let Some(ref project_id) = filter.project_id {
        sql.push_str(&format!(" AND project_id = ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(project_id.clone()));
    }
    if let Some(ref page_url) = filter.page_url {
        sql.push_str(&format!(" AND page_url = ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(page_url.clone()));
    }
    if table_has_type {
        if let Some(event_type) = filter.event_type {
            sql.push_str(&format!(" AND event_type = ?{}", bind_values.len() + 1));
            bind_values.push(Box::new(event_type.as_str()));
        }
    }

    (sql, bind_values)
}

/// Fetch interaction events in time order, ties broken by insertion order.
pub async fn fetch_interactions(
    pool: &Pool,
    filter: EventFilter,
    device: Option<String>,
) -> AppResult<Vec<InteractionEvent>> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let events = conn
        .interact(move |conn| {
            let (mut where_sql, mut bind_values) = where_clause(&filter, true);
            if let Some(ref device) = device {
                where_sql.push_str(&format!(" AND device = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(device.clone()));
            }
            let sql = format!(
                "SELECT project_id, session_id, user_id, event_type, page_url, device, timestamp, metadata
                 FROM interaction_events{where_sql}
                 ORDER BY timestamp, id"
            );
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                bind_values.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_ref.as_slice(), |row| {
                    let event_type: String = row.get(3)?;
                    let metadata: String = row.get(7)?;
                    Ok((
                        event_type,
                        metadata,
                        InteractionEvent {
                            project_id: row.get(0)?,
                            session_id: row.get(1)?,
                            user_id: row.get(2)?,
                            event_type: EventType::Custom,
                            page_url: row.get(4)?,
                            device: row.get(5)?,
                            timestamp: row.get(6)?,
                            metadata: serde_json::Value::Null,
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;

    // Rows with an unknown type are skipped rather than failing the window
    Ok(events
        .into_iter()
        .filter_map(|(event_type, metadata, mut ev)| {
            ev.event_type = EventType::parse(&event_type)?;
            ev.metadata = serde_json::from_str(&metadata).unwrap_or_default();
            Some(ev)
        })
        .collect())
}

/// Fetch performance samples ordered by time.
pub async fn fetch_samples(pool: &Pool, filter: EventFilter) -> AppResult<Vec<PerformanceSample>> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let samples = conn
        .interact(move |conn| {
            let (where_sql, bind_values) = where_clause(&filter, false);
            let sql = format!(
                "SELECT project_id, session_id, page_url, timestamp, lcp, fcp, cls, ttfb, inp, js_errors
                 FROM performance_samples{where_sql}
                 ORDER BY timestamp, id"
            );
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                bind_values.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_ref.as_slice(), |row| {
                    let errors: String = row.get(9)?;
                    Ok(PerformanceSample {
                        project_id: row.get(0)?,
                        session_id: row.get(1)?,
                        page_url: row.get(2)?,
                        timestamp: row.get(3)?,
                        lcp: row.get(4)?,
                        fcp: row.get(5)?,
                        cls: row.get(6)?,
                        ttfb: row.get(7)?,
                        inp: row.get(8)?,
                        js_errors: serde_json::from_str(&errors).unwrap_or_default(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;

    Ok(samples)
}

/// Count interaction events in a window.
pub async fn count_events(pool: &Pool, filter: EventFilter) -> AppResult<u64> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let count = conn
        .interact(move |conn| {
            let (where_sql, bind_values) = where_clause(&filter, true);
            let sql = format!("SELECT COUNT(*) FROM interaction_events{where_sql}");
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                bind_values.iter().map(|b| b.as_ref()).collect();
            conn.query_row(&sql, params_ref.as_slice(), |row| row.get::<_, i64>(0))
        })
        .await??;

    Ok(count.max(0) as u64)
}

/// Last computed heatmap for a page/type/device.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapAggregate {
    pub project_id: String,
    pub page_url: String,
    pub heatmap_type: String,
    pub device: String,
    pub clusters: Vec<HeatmapCluster>,
    pub point_count: u64,
    pub updated_at: i64,
}

pub async fn save_heatmap_aggregate(
    pool: &Pool,
    project_id: &str,
    page_url: &str,
    heatmap_type: HeatmapType,
    device: Option<&str>,
    clusters: &[HeatmapCluster],
    point_count: usize,
) -> AppResult<()> {
    let clusters_json = serde_json::to_string(clusters)
        .map_err(|e| AppError::Internal(format!("json error: {e}")))?;
    let pid = project_id.to_string();
    let url = page_url.to_string();
    let kind = heatmap_type.as_str();
    let device = device.unwrap_or("all").to_string();
    let now = chrono::Utc::now().timestamp_millis();

    let conn = pool.get().await.map_err(AppError::pool)?;
    conn.interact(move |conn| {
        conn.execute(
            "INSERT INTO heatmap_aggregates (project_id, page_url, heatmap_type, device, clusters, point_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (project_id, page_url, heatmap_type, device) DO UPDATE SET
                clusters = excluded.clusters,
                point_count = excluded.point_count,
                updated_at = excluded.updated_at",
            params![pid, url, kind, device, clusters_json, point_count as i64, now],
        )
    })
    .await??;

    Ok(())
}

pub async fn load_heatmap_aggregate(
    pool: &Pool,
    project_id: &str,
    page_url: &str,
    heatmap_type: HeatmapType,
    device: Option<&str>,
) -> AppResult<Option<HeatmapAggregate>> {
    let pid = project_id.to_string();
    let url = page_url.to_string();
    let kind = heatmap_type.as_str();
    let device = device.unwrap_or("all").to_string();

    let conn = pool.get().await.map_err(AppError::pool)?;
    let row = conn
        .interact(move |conn| {
            let result = conn.query_row(
                "SELECT project_id, page_url, heatmap_type, device, clusters, point_count, updated_at
                 FROM heatmap_aggregates
                 WHERE project_id = ?1 AND page_url = ?2 AND heatmap_type = ?3 AND device = ?4",
                params![pid, url, kind, device],
                |row| {
                    let clusters: String = row.get(4)?;
                    Ok(HeatmapAggregate {
                        project_id: row.get(0)?,
                        page_url: row.get(1)?,
                        heatmap_type: row.get(2)?,
                        device: row.get(3)?,
                        clusters: serde_json::from_str(&clusters).unwrap_or_default(),
                        point_count: row.get::<_, i64>(5)?.max(0) as u64,
                        updated_at: row.get(6)?,
                    })
                },
            );
            match result {
                Ok(agg) => Ok(Some(agg)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await??;

    Ok(row)
}
