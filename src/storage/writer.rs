use crate::types::IngestItem;
use deadpool_sqlite::Pool;
use rusqlite::params;

/// Batch-write ingested items to SQLite in a single transaction.
pub async fn write_batch(
    pool: &Pool,
    items: Vec<IngestItem>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if items.is_empty() {
        return Ok(());
    }

    let received_at = chrono::Utc::now().timestamp_millis();
    let conn = pool.get().await?;
    conn.interact(move |conn| {
        let tx = conn.transaction()?;

        {
            let mut insert_event = tx.prepare_cached(
                "INSERT INTO interaction_events (
                    project_id, session_id, user_id, event_type, page_url,
                    device, timestamp, metadata, received_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;

            let mut insert_sample = tx.prepare_cached(
                "INSERT INTO performance_samples (
                    project_id, session_id, page_url, timestamp,
                    lcp, fcp, cls, ttfb, inp, js_errors, received_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for item in &items {
                match item {
                    IngestItem::Interaction(ev) => {
                        insert_event.execute(params![
                            ev.project_id,
                            ev.session_id,
                            ev.user_id,
                            ev.event_type.as_str(),
                            ev.page_url,
                            ev.device,
                            ev.timestamp,
                            ev.metadata.to_string(),
                            received_at,
                        ])?;
                    }
                    IngestItem::Performance(sample) => {
                        let errors = serde_json::to_string(&sample.js_errors)
                            .unwrap_or_else(|_| "[]".to_string());
                        insert_sample.execute(params![
                            sample.project_id,
                            sample.session_id,
                            sample.page_url,
                            sample.timestamp,
                            sample.lcp,
                            sample.fcp,
                            sample.cls,
                            sample.ttfb,
                            sample.inp,
                            errors,
                            received_at,
                        ])?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
    })
    .await
    .map_err(|e| format!("interact error: {e}"))??;

    Ok(())
}
