use crate::config::PipelineConfig;
use crate::storage::writer;
use crate::types::IngestItem;
use deadpool_sqlite::Pool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// Pipeline worker: consumes ingested items from the channel, batches them,
/// and flushes to SQLite on batch size or time trigger.
pub async fn run_worker(mut rx: mpsc::Receiver<IngestItem>, pool: Pool, config: PipelineConfig) {
    let mut buffer: Vec<IngestItem> = Vec::with_capacity(config.flush_batch_size);
    let flush_interval = Duration::from_secs(config.flush_interval_secs);
    let mut flush_timer = time::interval(flush_interval);
    flush_timer.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= config.flush_batch_size {
                            flush(&pool, &mut buffer).await;
                        }
                    }
                    None => {
                        // Channel closed - drain remaining
                        tracing::info!("channel closed, draining buffer");
                        if !buffer.is_empty() {
                            flush(&pool, &mut buffer).await;
                        }
                        return;
                    }
                }
            }
            _ = flush_timer.tick() => {
                if !buffer.is_empty() {
                    flush(&pool, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush(pool: &Pool, buffer: &mut Vec<IngestItem>) {
    let items: Vec<IngestItem> = std::mem::take(buffer);
    let count = items.len();

    // One retry before dropping the batch
    for attempt in 0..2u8 {
        match writer::write_batch(pool, items.clone()).await {
            Ok(_) => {
                tracing::debug!(count, "flushed batch");
                return;
            }
            Err(e) => {
                if attempt == 0 {
                    tracing::warn!(error = %e, count, "flush failed, retrying in 500ms");
                    time::sleep(Duration::from_millis(500)).await;
                } else {
                    tracing::error!(error = %e, count, "flush retry failed, batch dropped");
                }
            }
        }
    }
}
