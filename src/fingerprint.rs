use crate::types::{ErrorRecord, PerformanceSample};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use xxhash_rust::xxh3::xxh3_64;

static LINE_COL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+:\d+").unwrap());

static PAREN_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^()]*\)").unwrap());

const MAX_STACK_LINES: usize = 5;
const MAX_FINGERPRINT_CHARS: usize = 1000;

/// Normalize a stack trace: neutralize `line:col` pairs and parenthesized
/// paths, keep the first few lines.
pub fn normalize_stack(stack: Option<&str>) -> String {
    let Some(stack) = stack else {
        return String::new();
    };

    stack
        .lines()
        .take(MAX_STACK_LINES)
        .map(|line| {
            let s = LINE_COL_RE.replace_all(line, ":<n>:<n>");
            let s = PAREN_PATH_RE.replace_all(&s, "(<path>)");
            s.trim().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compute the grouping key `name|message|normalized_stack`, capped at 1000 chars.
pub fn compute_fingerprint(name: &str, message: &str, stack: Option<&str>) -> String {
    let raw = format!(
        "{}|{}|{}",
        name.trim(),
        message.trim(),
        normalize_stack(stack)
    );
    match raw.char_indices().nth(MAX_FINGERPRINT_CHARS) {
        Some((idx, _)) => raw[..idx].to_string(),
        None => raw,
    }
}

/// Short stable id for a fingerprint, usable in URLs.
pub fn fingerprint_id(fingerprint: &str) -> String {
    format!("{:016x}", xxh3_64(fingerprint.as_bytes()))
}

/// One error record with the session and page it was captured on.
#[derive(Debug, Clone, Copy)]
pub struct ErrorOccurrence<'a> {
    pub record: &'a ErrorRecord,
    pub session_id: &'a str,
    pub page_url: &'a str,
    pub timestamp: i64,
}

/// Flatten the `js_errors` of each sample into occurrences.
/// Records without their own timestamp inherit the sample's.
pub fn occurrences(samples: &[PerformanceSample]) -> Vec<ErrorOccurrence<'_>> {
    samples
        .iter()
        .flat_map(|sample| {
            sample.js_errors.iter().map(move |record| ErrorOccurrence {
                record,
                session_id: &sample.session_id,
                page_url: &sample.page_url,
                timestamp: record.timestamp.unwrap_or(sample.timestamp),
            })
        })
        .collect()
}

/// Deduplicated error group.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorGroup {
    pub id: String,
    pub fingerprint: String,
    pub name: String,
    pub message: String,
    pub normalized_stack: String,
    pub count: u64,
    pub sessions: BTreeSet<String>,
    pub pages: BTreeSet<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Group occurrences by fingerprint; most frequent first, at most `limit` groups.
pub fn group_errors<'a, I>(occurrences: I, limit: usize) -> Vec<ErrorGroup>
where
    I: IntoIterator<Item = ErrorOccurrence<'a>>,
{
    let mut groups: HashMap<String, ErrorGroup> = HashMap::new();

    for occ in occurrences {
        let name = occ.record.name.trim();
        let message = occ.record.message.trim();
        if name.is_empty() && message.is_empty() {
            continue;
        }
        let stack = occ.record.stack.as_deref();
        let fingerprint = compute_fingerprint(name, message, stack);

        let group = groups
            .entry(fingerprint.clone())
            .or_insert_with(|| ErrorGroup {
                id: fingerprint_id(&fingerprint),
                fingerprint,
                name: name.to_string(),
                message: message.to_string(),
                normalized_stack: normalize_stack(stack),
                count: 0,
                sessions: BTreeSet::new(),
                pages: BTreeSet::new(),
                first_seen: occ.timestamp,
                last_seen: occ.timestamp,
            });

        group.count += 1;
        group.sessions.insert(occ.session_id.to_string());
        group.pages.insert(occ.page_url.to_string());
        group.first_seen = group.first_seen.min(occ.timestamp);
        group.last_seen = group.last_seen.max(occ.timestamp);
    }

    let mut out: Vec<ErrorGroup> = groups.into_values().collect();
    out.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(b.last_seen.cmp(&a.last_seen))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    out.truncate(limit);
    out
}
