use crate::alert::evaluator::{RuleStore, SignalSource};
use crate::alert::rules::{self, AlertRule};
use crate::error::AppResult;
use crate::storage::queries;
use crate::types::{EventFilter, PerformanceSample};
use async_trait::async_trait;
use deadpool_sqlite::Pool;

/// SQLite-backed rules and signals for the alert evaluator.
#[derive(Clone)]
pub struct SqliteAlertStore {
    pool: Pool,
}

impl SqliteAlertStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn window(project_id: Option<&str>, since: i64, until: i64) -> EventFilter {
    EventFilter {
        project_id: project_id.map(str::to_string),
        since,
        until,
        ..Default::default()
    }
}

#[async_trait]
impl RuleStore for SqliteAlertStore {
    async fn active_rules(&self) -> AppResult<Vec<AlertRule>> {
        rules::list_active_rules(&self.pool).await
    }

    async fn mark_triggered(&self, rule_id: i64, at: i64) -> AppResult<()> {
        rules::mark_triggered(&self.pool, rule_id, at).await
    }
}

#[async_trait]
impl SignalSource for SqliteAlertStore {
    async fn count_events(
        &self,
        project_id: Option<&str>,
        since: i64,
        until: i64,
    ) -> AppResult<u64> {
        queries::count_events(&self.pool, window(project_id, since, until)).await
    }

    async fn samples(
        &self,
        project_id: Option<&str>,
        since: i64,
        until: i64,
    ) -> AppResult<Vec<PerformanceSample>> {
        queries::fetch_samples(&self.pool, window(project_id, since, until)).await
    }
}
