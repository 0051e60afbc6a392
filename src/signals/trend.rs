use crate::signals::rage::{burst_windows, RageConfig};
use crate::signals::selector::resolve_selector;
use crate::types::{EventType, HourlyCount, InteractionEvent, PerformanceSample};
use chrono::DateTime;
use std::collections::{BTreeMap, HashMap, HashSet};

/// UTC hour key `YYYY-MM-DDTHH` for an epoch-millisecond timestamp.
pub fn hour_bucket(timestamp_ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(timestamp_ms).map(|dt| dt.format("%Y-%m-%dT%H").to_string())
}

fn into_sorted(counts: BTreeMap<String, u64>) -> Vec<HourlyCount> {
    counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(hour, count)| HourlyCount { hour, count })
        .collect()
}

/// Count timestamps per hour.
pub fn count_trend<I: IntoIterator<Item = i64>>(timestamps: I) -> Vec<HourlyCount> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for ts in timestamps {
        if let Some(hour) = hour_bucket(ts) {
            *counts.entry(hour).or_default() += 1;
        }
    }
    into_sorted(counts)
}

/// Sum of `js_errors` entries per hour of the owning sample.
pub fn error_trend(samples: &[PerformanceSample]) -> Vec<HourlyCount> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for sample in samples {
        if sample.js_errors.is_empty() {
            continue;
        }
        if let Some(hour) = hour_bucket(sample.timestamp) {
            *counts.entry(hour).or_default() += sample.js_errors.len() as u64;
        }
    }
    into_sorted(counts)
}

/// Distinct sessions per hour with at least one rage burst inside that hour.
///
/// Clicks are bucketed by hour first, so a burst straddling an hour
/// boundary only counts if one side alone reaches the threshold.
pub fn rage_trend(events: &[InteractionEvent], config: RageConfig) -> Vec<HourlyCount> {
    // hour -> session -> (page, selector) -> timestamps
    let mut buckets: BTreeMap<String, HashMap<&str, HashMap<(&str, String), Vec<i64>>>> =
        BTreeMap::new();

    for ev in events.iter().filter(|e| e.event_type == EventType::Click) {
        let Some(hour) = hour_bucket(ev.timestamp) else {
            continue;
        };
        buckets
            .entry(hour)
            .or_default()
            .entry(ev.session_id.as_str())
            .or_default()
            .entry((ev.page_url.as_str(), resolve_selector(&ev.metadata)))
            .or_default()
            .push(ev.timestamp);
    }

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for (hour, sessions) in buckets {
        let mut raging: HashSet<&str> = HashSet::new();
        for (session, targets) in sessions {
            let hit = targets.into_values().any(|mut ts| {
                ts.sort_unstable();
                !burst_windows(&ts, config).is_empty()
            });
            if hit {
                raging.insert(session);
            }
        }
        counts.insert(hour, raging.len() as u64);
    }

    into_sorted(counts)
}
