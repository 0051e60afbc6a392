use crate::types::InteractionEvent;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Derive a stable identity for the element an event targeted.
///
/// Priority: `#elementId`, then the first two class tokens, then the
/// lower-cased tag name, then `"unknown"`. Both click detectors group on
/// this value, so it must stay a pure function of the metadata.
pub fn resolve_selector(metadata: &Value) -> String {
    let Some(obj) = metadata.as_object() else {
        return "unknown".to_string();
    };

    if let Some(id) = obj.get("elementId").and_then(Value::as_str) {
        if !id.is_empty() {
            return format!("#{id}");
        }
    }

    if let Some(class_name) = obj.get("className").and_then(Value::as_str) {
        let tokens: Vec<&str> = class_name.split_whitespace().take(2).collect();
        if !tokens.is_empty() {
            return format!(".{}", tokens.join("."));
        }
    }

    if let Some(tag) = obj.get("element").and_then(Value::as_str) {
        if !tag.is_empty() {
            return tag.to_lowercase();
        }
    }

    "unknown".to_string()
}

/// Grouping identity shared by the rage and dead click detectors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub session_id: String,
    pub page_url: String,
    pub selector: String,
}

impl GroupKey {
    pub fn of(event: &InteractionEvent) -> Self {
        Self {
            session_id: event.session_id.clone(),
            page_url: event.page_url.clone(),
            selector: resolve_selector(&event.metadata),
        }
    }
}

/// Group events by `session|page|selector`, each group in ascending time order.
/// The sort is stable, so equal timestamps keep their input order.
pub fn group_by_target<'a, I>(events: I) -> BTreeMap<GroupKey, Vec<&'a InteractionEvent>>
where
    I: IntoIterator<Item = &'a InteractionEvent>,
{
    let mut groups: BTreeMap<GroupKey, Vec<&InteractionEvent>> = BTreeMap::new();
    for ev in events {
        groups.entry(GroupKey::of(ev)).or_default().push(ev);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|e| e.timestamp);
    }
    groups
}

/// Split events into per-session timelines, each stably sorted by timestamp.
pub fn group_by_session(events: &[InteractionEvent]) -> BTreeMap<&str, Vec<&InteractionEvent>> {
    let mut sessions: BTreeMap<&str, Vec<&InteractionEvent>> = BTreeMap::new();
    for ev in events {
        sessions.entry(ev.session_id.as_str()).or_default().push(ev);
    }
    for timeline in sessions.values_mut() {
        timeline.sort_by_key(|e| e.timestamp);
    }
    sessions
}

/// Per-spot report row: one `(page_url, selector)` across all sessions.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SpotRollup {
    pub page_url: String,
    pub selector: String,
    pub incidents: u64,
    pub clicks: u64,
    pub sessions: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Default)]
struct SpotAccumulator {
    incidents: u64,
    clicks: u64,
    sessions: HashSet<String>,
    first_seen: i64,
    last_seen: i64,
}

/// Accumulates detector output into [`SpotRollup`] rows.
#[derive(Default)]
pub struct RollupBuilder {
    spots: HashMap<(String, String), SpotAccumulator>,
}

impl RollupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        page_url: &str,
        selector: &str,
        session_id: &str,
        clicks: u64,
        first_seen: i64,
        last_seen: i64,
    ) {
        let acc = self
            .spots
            .entry((page_url.to_string(), selector.to_string()))
            .or_insert_with(|| SpotAccumulator {
                first_seen,
                last_seen,
                ..Default::default()
            });
        acc.incidents += 1;
        acc.clicks += clicks;
        acc.sessions.insert(session_id.to_string());
        acc.first_seen = acc.first_seen.min(first_seen);
        acc.last_seen = acc.last_seen.max(last_seen);
    }

    /// Finish into rows sorted by incidents, then clicks, descending.
    pub fn finish(self) -> Vec<SpotRollup> {
        let mut rows: Vec<SpotRollup> = self
            .spots
            .into_iter()
            .map(|((page_url, selector), acc)| SpotRollup {
                page_url,
                selector,
                incidents: acc.incidents,
                clicks: acc.clicks,
                sessions: acc.sessions.len() as u64,
                first_seen: acc.first_seen,
                last_seen: acc.last_seen,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.incidents
                .cmp(&a.incidents)
                .then(b.clicks.cmp(&a.clicks))
                .then_with(|| a.page_url.cmp(&b.page_url))
                .then_with(|| a.selector.cmp(&b.selector))
        });
        rows
    }
}
