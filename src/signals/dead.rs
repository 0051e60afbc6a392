use crate::signals::selector::{group_by_session, resolve_selector, RollupBuilder, SpotRollup};
use crate::types::{EventType, InteractionEvent};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static MEANINGFUL_ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)navigate|open|success").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeadClickConfig {
    pub idle_ms: i64,
}

impl Default for DeadClickConfig {
    fn default() -> Self {
        Self { idle_ms: 2000 }
    }
}

/// A click nothing visibly reacted to.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeadClickRecord {
    pub session_id: String,
    pub page_url: String,
    pub selector: String,
    pub timestamp: i64,
}

/// Whether `follower` proves that a click on `selector` had an effect.
fn is_reaction(follower: &InteractionEvent, selector: &str) -> bool {
    match follower.event_type {
        EventType::Pageview | EventType::Submit => return true,
        EventType::Click if resolve_selector(&follower.metadata) != selector => return true,
        _ => {}
    }
    follower
        .action()
        .is_some_and(|action| MEANINGFUL_ACTION_RE.is_match(action))
}

/// Detect dead clicks across all sessions in `events`.
///
/// Every event type is considered as a potential reaction, so pass the
/// full session timeline, not only clicks.
pub fn detect_dead_clicks(
    events: &[InteractionEvent],
    config: DeadClickConfig,
) -> Vec<DeadClickRecord> {
    let mut records = Vec::new();

    for (_, timeline) in group_by_session(events) {
        for (idx, ev) in timeline.iter().enumerate() {
            if ev.event_type != EventType::Click {
                continue;
            }
            let selector = resolve_selector(&ev.metadata);
            let t0 = ev.timestamp;

            let reacted = timeline[idx + 1..]
                .iter()
                .take_while(|next| next.timestamp - t0 <= config.idle_ms)
                .any(|next| is_reaction(next, &selector));

            if !reacted {
                records.push(DeadClickRecord {
                    session_id: ev.session_id.clone(),
                    page_url: ev.page_url.clone(),
                    selector,
                    timestamp: t0,
                });
            }
        }
    }

    records
}

/// Roll dead clicks up per `(page_url, selector)`; each record counts as
/// one incident of one click.
pub fn rollup_dead(records: &[DeadClickRecord]) -> Vec<SpotRollup> {
    let mut builder = RollupBuilder::new();
    for rec in records {
        builder.add(
            &rec.page_url,
            &rec.selector,
            &rec.session_id,
            1,
            rec.timestamp,
            rec.timestamp,
        );
    }
    builder.finish()
}
