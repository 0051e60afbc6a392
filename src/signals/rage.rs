use crate::signals::selector::{group_by_target, RollupBuilder, SpotRollup};
use crate::types::{EventType, InteractionEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RageConfig {
    pub window_ms: i64,
    pub threshold: usize,
}

impl Default for RageConfig {
    fn default() -> Self {
        Self {
            window_ms: 3000,
            threshold: 3,
        }
    }
}

/// One burst of repeated clicks on the same target.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RageIncident {
    pub session_id: String,
    pub page_url: String,
    pub selector: String,
    pub count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Find non-overlapping bursts in an ascending timestamp slice.
///
/// Returns inclusive index ranges. Once a window reaches `threshold`
/// clicks it keeps absorbing clicks that still fall within `window_ms`
/// of its first click; the next window starts after the last absorbed
/// click, so one burst is never reported twice.
pub fn burst_windows(timestamps: &[i64], config: RageConfig) -> Vec<(usize, usize)> {
    let n = timestamps.len();
    let threshold = config.threshold.max(1);
    let mut bursts = Vec::new();
    let mut i = 0;
    let mut j = 0;

    while j < n {
        while timestamps[j] - timestamps[i] > config.window_ms {
            i += 1;
        }
        if j - i + 1 >= threshold {
            while j + 1 < n && timestamps[j + 1] - timestamps[i] <= config.window_ms {
                j += 1;
            }
            bursts.push((i, j));
            i = j + 1;
        }
        j += 1;
    }

    bursts
}

/// Detect rage clicks. Non-click events are ignored; clicks are grouped by
/// session, page and selector.
pub fn detect_rage_clicks(events: &[InteractionEvent], config: RageConfig) -> Vec<RageIncident> {
    let clicks = events.iter().filter(|e| e.event_type == EventType::Click);
    let mut incidents = Vec::new();

    for (key, group) in group_by_target(clicks) {
        let timestamps: Vec<i64> = group.iter().map(|e| e.timestamp).collect();
        for (start, end) in burst_windows(&timestamps, config) {
            incidents.push(RageIncident {
                session_id: key.session_id.clone(),
                page_url: key.page_url.clone(),
                selector: key.selector.clone(),
                count: (end - start + 1) as u64,
                first_seen: timestamps[start],
                last_seen: timestamps[end],
            });
        }
    }

    incidents
}

/// Roll incidents up per `(page_url, selector)`.
pub fn rollup_rage(incidents: &[RageIncident]) -> Vec<SpotRollup> {
    let mut builder = RollupBuilder::new();
    for inc in incidents {
        builder.add(
            &inc.page_url,
            &inc.selector,
            &inc.session_id,
            inc.count,
            inc.first_seen,
            inc.last_seen,
        );
    }
    builder.finish()
}
