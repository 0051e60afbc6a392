use crate::types::{PerformanceSample, VITALS};

/// A metric an alert rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    EventsPerMinute,
    JsErrorsPerMinute,
    /// 75th percentile of a web vital, e.g. `lcp_p75`.
    P75(&'static str),
}

impl Metric {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "events_per_minute" => Some(Metric::EventsPerMinute),
            "js_errors_per_minute" => Some(Metric::JsErrorsPerMinute),
            other => {
                let field = other.strip_suffix("_p75")?;
                VITALS.iter().copied().find(|v| *v == field).map(Metric::P75)
            }
        }
    }

    /// Whether computing this metric needs performance samples rather than an event count.
    pub fn uses_samples(&self) -> bool {
        !matches!(self, Metric::EventsPerMinute)
    }

    /// Compute a sample-based metric over a window of `window_minutes`.
    /// Returns `None` for [`Metric::EventsPerMinute`].
    pub fn from_samples(&self, samples: &[PerformanceSample], window_minutes: i64) -> Option<f64> {
        match self {
            Metric::EventsPerMinute => None,
            Metric::JsErrorsPerMinute => {
                let errors: usize = samples.iter().map(|s| s.js_errors.len()).sum();
                Some(per_minute(errors as u64, window_minutes))
            }
            Metric::P75(field) => {
                let values: Vec<f64> = samples.iter().filter_map(|s| s.vital(field)).collect();
                Some(p75(values))
            }
        }
    }
}

pub fn per_minute(count: u64, window_minutes: i64) -> f64 {
    count as f64 / window_minutes.max(1) as f64
}

/// Value at index `floor(0.75 * (n - 1))` of the ascending values; 0 when empty.
pub fn p75(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let idx = (0.75 * (values.len() - 1) as f64).floor() as usize;
    values[idx]
}
