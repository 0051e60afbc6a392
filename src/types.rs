use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Click,
    Hover,
    Scroll,
    Pageview,
    Submit,
    Mousemove,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Click => "click",
            EventType::Hover => "hover",
            EventType::Scroll => "scroll",
            EventType::Pageview => "pageview",
            EventType::Submit => "submit",
            EventType::Mousemove => "mousemove",
            EventType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "click" => Some(EventType::Click),
            "hover" => Some(EventType::Hover),
            "scroll" => Some(EventType::Scroll),
            "pageview" => Some(EventType::Pageview),
            "submit" => Some(EventType::Submit),
            "mousemove" => Some(EventType::Mousemove),
            "custom" => Some(EventType::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single tracked interaction. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InteractionEvent {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub project_id: String,
    pub event_type: EventType,
    pub page_url: String,
    pub timestamp: i64,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InteractionEvent {
    /// `metadata.action` as a string, if present.
    pub fn action(&self) -> Option<&str> {
        self.metadata.get("action").and_then(|v| v.as_str())
    }
}

/// A JS error captured by the tracking client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A page performance snapshot with web vitals and the errors seen since the last one.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerformanceSample {
    pub project_id: String,
    pub session_id: String,
    pub page_url: String,
    pub timestamp: i64,
    #[serde(default)]
    pub lcp: Option<f64>,
    #[serde(default)]
    pub fcp: Option<f64>,
    #[serde(default)]
    pub cls: Option<f64>,
    #[serde(default)]
    pub ttfb: Option<f64>,
    #[serde(default)]
    pub inp: Option<f64>,
    #[serde(default)]
    pub js_errors: Vec<ErrorRecord>,
}

impl PerformanceSample {
    /// Look up a web vital by name.
    pub fn vital(&self, name: &str) -> Option<f64> {
        match name {
            "lcp" => self.lcp,
            "fcp" => self.fcp,
            "cls" => self.cls,
            "ttfb" => self.ttfb,
            "inp" => self.inp,
            _ => None,
        }
    }
}

/// Names accepted by [`PerformanceSample::vital`].
pub const VITALS: &[&str] = &["lcp", "fcp", "cls", "ttfb", "inp"];

/// Item flowing from the ingest handlers to the pipeline worker.
#[derive(Debug, Clone)]
pub enum IngestItem {
    Interaction(InteractionEvent),
    Performance(PerformanceSample),
}

/// Hourly count bucket for trend charts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HourlyCount {
    pub hour: String,
    pub count: u64,
}

/// Filter for fetching raw events/samples from storage.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_id: Option<String>,
    pub since: i64,
    pub until: i64,
    pub page_url: Option<String>,
    pub event_type: Option<EventType>,
}

/// Common query-string parameters of the signal endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindowParams {
    pub project_id: Option<String>,
    pub page_url: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub hours: Option<i64>,
}

impl WindowParams {
    /// Resolve to an absolute `[since, until]` range, defaulting to the trailing `default_hours`.
    pub fn range(&self, now_ms: i64, default_hours: i64) -> (i64, i64) {
        let until = self.until.unwrap_or(now_ms);
        let hours = self.hours.unwrap_or(default_hours).clamp(1, 720); // Cap at 30 days
        let since = self
            .since
            .unwrap_or_else(|| until.saturating_sub(hours * 3_600_000));
        (since, until)
    }

    pub fn filter(&self, now_ms: i64, default_hours: i64, event_type: Option<EventType>) -> EventFilter {
        let (since, until) = self.range(now_ms, default_hours);
        EventFilter {
            project_id: self.project_id.clone(),
            since,
            until,
            page_url: self.page_url.clone(),
            event_type,
        }
    }

    pub fn cache_key(&self, endpoint: &str, now_ms: i64, default_hours: i64) -> String {
        let (since, until) = self.range(now_ms, default_hours);
        format!(
            "{}:{}:{}:{}:{}",
            endpoint,
            self.project_id.as_deref().unwrap_or("all"),
            self.page_url.as_deref().unwrap_or("all"),
            // Relative windows are cached per minute so "now" does not defeat the cache
            if self.until.is_none() { since / 60_000 } else { since },
            if self.until.is_none() { until / 60_000 } else { until },
        )
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub db_ok: bool,
    pub buffer_usage: f64,
}
