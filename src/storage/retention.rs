use deadpool_sqlite::Pool;
use rusqlite::params;
use std::time::Duration;
use tokio::time;

/// Background task that prunes raw events and samples past the retention window.
pub async fn retention_loop(pool: Pool, retention_days: u64, interval_secs: u64) {
    let mut interval = time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match run_retention_once(&pool, retention_days).await {
            Ok((events_deleted, samples_deleted)) => {
                if events_deleted > 0 {
                    tracing::info!(deleted = events_deleted, "pruned old interaction events");
                }
                if samples_deleted > 0 {
                    tracing::info!(deleted = samples_deleted, "pruned old performance samples");
                }
            }
            Err(e) => tracing::error!(error = %e, "retention prune failed"),
        }
    }
}

/// Run a single retention pass. Returns (events_deleted, samples_deleted).
pub async fn run_retention_once(
    pool: &Pool,
    retention_days: u64,
) -> Result<(usize, usize), Box<dyn std::error::Error + Send + Sync>> {
    let conn = pool.get().await?;
    let cutoff_ms = chrono::Utc::now().timestamp_millis() - (retention_days as i64 * 86_400_000);

    let result = conn
        .interact(move |conn| {
            let events = conn.execute(
                "DELETE FROM interaction_events WHERE timestamp < ?1",
                params![cutoff_ms],
            )?;
            let samples = conn.execute(
                "DELETE FROM performance_samples WHERE timestamp < ?1",
                params![cutoff_ms],
            )?;
            Ok::<_, rusqlite::Error>((events, samples))
        })
        .await
        .map_err(|e| format!("interact error: {e}"))??;

    Ok(result)
}
