use crate::alert::dispatch::ChannelConfig;
use crate::alert::metrics::Metric;
use crate::error::{AppError, AppResult};
use deadpool_sqlite::Pool;
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Gte),
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Lte),
            "==" => Some(Comparator::Eq),
            "!=" => Some(Comparator::Ne),
            _ => None,
        }
    }

    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Gte => value >= threshold,
            Comparator::Lt => value < threshold,
            Comparator::Lte => value <= threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub project_id: Option<String>,
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub window_minutes: i64,
    pub cooldown_ms: i64,
    pub channel: ChannelConfig,
    pub enabled: bool,
    pub last_triggered_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AlertRule {
    /// Whether the rule fired less than `cooldown_ms` before `now_ms`.
    pub fn on_cooldown(&self, now_ms: i64) -> bool {
        match self.last_triggered_at {
            Some(last) => now_ms - last < self.cooldown_ms,
            None => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAlertRule {
    pub name: String,
    pub project_id: Option<String>,
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
    pub channel: ChannelConfig,
}

fn default_window_minutes() -> i64 {
    5
}

fn default_cooldown_ms() -> i64 {
    5 * 60 * 1000
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateAlertRule {
    pub name: Option<String>,
    pub metric: Option<String>,
    pub comparator: Option<Comparator>,
    pub threshold: Option<f64>,
    pub window_minutes: Option<i64>,
    pub cooldown_ms: Option<i64>,
    pub channel: Option<ChannelConfig>,
    pub enabled: Option<bool>,
}

fn validate_metric(metric: &str) -> AppResult<()> {
    Metric::parse(metric)
        .map(|_| ())
        .ok_or_else(|| AppError::Validation(format!("unknown metric: {metric}")))
}

fn validate_channel(channel: &ChannelConfig) -> AppResult<()> {
    channel
        .validate()
        .map_err(|e| AppError::Validation(format!("invalid channel URL: {e}")))
}

/// Longest evaluation window: 30 days.
pub const MAX_WINDOW_MINUTES: i64 = 30 * 24 * 60;

fn validate_window(window_minutes: i64, cooldown_ms: i64) -> AppResult<()> {
    if !(1..=MAX_WINDOW_MINUTES).contains(&window_minutes) {
        return Err(AppError::Validation(format!(
            "window_minutes must be between 1 and {MAX_WINDOW_MINUTES}"
        )));
    }
    if cooldown_ms < 0 {
        return Err(AppError::Validation(
            "cooldown_ms must not be negative".to_string(),
        ));
    }
    Ok(())
}

const RULE_COLUMNS: &str = "id, name, project_id, metric, comparator, threshold, window_minutes,
     cooldown_ms, channel, enabled, last_triggered_at, created_at, updated_at";

fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRule> {
    let comparator_str: String = row.get(4)?;
    let comparator = Comparator::parse(&comparator_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown comparator: {comparator_str}").into(),
        )
    })?;
    let channel_str: String = row.get(8)?;
    let channel: ChannelConfig = serde_json::from_str(&channel_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        metric: row.get(3)?,
        comparator,
        threshold: row.get(5)?,
        window_minutes: row.get(6)?,
        cooldown_ms: row.get(7)?,
        channel,
        enabled: row.get::<_, i64>(9)? != 0,
        last_triggered_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub async fn list_alert_rules(pool: &Pool) -> AppResult<Vec<AlertRule>> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let rules = conn
        .interact(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {RULE_COLUMNS} FROM alert_rules ORDER BY id"))?;
            let rows = stmt
                .query_map([], rule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;

    Ok(rules)
}

/// Enabled rules. A row that fails to decode is logged and skipped so it
/// cannot block evaluation of the rest.
pub async fn list_active_rules(pool: &Pool) -> AppResult<Vec<AlertRule>> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let rows = conn
        .interact(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM alert_rules WHERE enabled = 1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([], rule_from_row)?
                .collect::<Vec<_>>();
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;

    Ok(rows
        .into_iter()
        .filter_map(|r| match r {
            Ok(rule) => Some(rule),
            Err(e) => {
                tracing::warn!(error = %e, "invalid alert rule row");
                None
            }
        })
        .collect())
}

pub async fn get_alert_rule(pool: &Pool, id: i64) -> AppResult<AlertRule> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let rule = conn
        .interact(move |conn| {
            let result = conn.query_row(
                &format!("SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = ?1"),
                params![id],
                rule_from_row,
            );
            match result {
                Ok(rule) => Ok(Some(rule)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await??;

    rule.ok_or_else(|| AppError::NotFound(format!("alert rule {id} not found")))
}

pub async fn create_alert_rule(pool: &Pool, input: CreateAlertRule) -> AppResult<AlertRule> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("name is required".to_string()));
    }
    validate_metric(&input.metric)?;
    validate_channel(&input.channel)?;
    validate_window(input.window_minutes, input.cooldown_ms)?;

    let channel_json = serde_json::to_string(&input.channel)
        .map_err(|e| AppError::Internal(format!("json error: {e}")))?;

    let now = chrono::Utc::now().timestamp_millis();
    let name = input.name.clone();
    let pid = input.project_id.clone();
    let metric = input.metric.clone();
    let comparator = input.comparator.as_str();
    let threshold = input.threshold;
    let window_minutes = input.window_minutes;
    let cooldown_ms = input.cooldown_ms;

    let conn = pool.get().await.map_err(AppError::pool)?;

    let id = conn
        .interact(move |conn| {
            conn.execute(
                "INSERT INTO alert_rules (name, project_id, metric, comparator, threshold, window_minutes,
                                          cooldown_ms, channel, enabled, last_triggered_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, NULL, ?9, ?9)",
                params![name, pid, metric, comparator, threshold, window_minutes, cooldown_ms, channel_json, now],
            )?;
            Ok::<_, rusqlite::Error>(conn.last_insert_rowid())
        })
        .await??;

    Ok(AlertRule {
        id,
        name: input.name,
        project_id: input.project_id,
        metric: input.metric,
        comparator: input.comparator,
        threshold: input.threshold,
        window_minutes: input.window_minutes,
        cooldown_ms: input.cooldown_ms,
        channel: input.channel,
        enabled: true,
        last_triggered_at: None,
        created_at: now,
        updated_at: now,
    })
}

pub async fn update_alert_rule(
    pool: &Pool,
    id: i64,
    input: UpdateAlertRule,
) -> AppResult<AlertRule> {
    if let Some(ref metric) = input.metric {
        validate_metric(metric)?;
    }
    if let Some(ref channel) = input.channel {
        validate_channel(channel)?;
    }
    validate_window(input.window_minutes.unwrap_or(1), input.cooldown_ms.unwrap_or(0))?;

    let channel_json = match input.channel {
        Some(ref channel) => Some(
            serde_json::to_string(channel)
                .map_err(|e| AppError::Internal(format!("json error: {e}")))?,
        ),
        None => None,
    };

    let now = chrono::Utc::now().timestamp_millis();
    let conn = pool.get().await.map_err(AppError::pool)?;

    let updated = conn
        .interact(move |conn| {
            // Build dynamic UPDATE
            let mut sets = vec!["updated_at = ?1".to_string()];
            let mut bind_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            bind_values.push(Box::new(now));

            if let Some(name) = input.name {
                sets.push(format!("name = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(name));
            }
            if let Some(metric) = input.metric {
                sets.push(format!("metric = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(metric));
            }
            if let Some(comparator) = input.comparator {
                sets.push(format!("comparator = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(comparator.as_str()));
            }
            if let Some(threshold) = input.threshold {
                sets.push(format!("threshold = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(threshold));
            }
            if let Some(window_minutes) = input.window_minutes {
                sets.push(format!("window_minutes = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(window_minutes));
            }
            if let Some(cooldown_ms) = input.cooldown_ms {
                sets.push(format!("cooldown_ms = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(cooldown_ms));
            }
            if let Some(channel_json) = channel_json {
                sets.push(format!("channel = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(channel_json));
            }
            if let Some(enabled) = input.enabled {
                sets.push(format!("enabled = ?{}", bind_values.len() + 1));
                bind_values.push(Box::new(enabled as i64));
            }

            let id_param = bind_values.len() + 1;
            bind_values.push(Box::new(id));

            let sql = format!("UPDATE alert_rules SET {} WHERE id = ?{}", sets.join(", "), id_param);
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                bind_values.iter().map(|b| b.as_ref()).collect();
            conn.execute(&sql, params_ref.as_slice())
        })
        .await??;

    if updated == 0 {
        return Err(AppError::NotFound(format!("alert rule {id} not found")));
    }

    get_alert_rule(pool, id).await
}

pub async fn delete_alert_rule(pool: &Pool, id: i64) -> AppResult<()> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    let deleted = conn
        .interact(move |conn| conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id]))
        .await??;

    if deleted == 0 {
        return Err(AppError::NotFound(format!("alert rule {id} not found")));
    }

    Ok(())
}

/// Persist the time a rule last fired.
pub async fn mark_triggered(pool: &Pool, id: i64, at: i64) -> AppResult<()> {
    let conn = pool.get().await.map_err(AppError::pool)?;

    conn.interact(move |conn| {
        conn.execute(
            "UPDATE alert_rules SET last_triggered_at = ?1 WHERE id = ?2",
            params![at, id],
        )
    })
    .await??;

    Ok(())
}
