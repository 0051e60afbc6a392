use crate::types::{EventType, InteractionEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_RADIUS: f64 = 20.0;

/// A raw interaction coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatPoint {
    pub x: f64,
    pub y: f64,
    pub intensity: f64,
}

impl HeatPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, intensity: 1.0 }
    }
}

/// Weighted centroid of one or more merged points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeatmapCluster {
    pub x: f64,
    pub y: f64,
    pub intensity: f64,
    pub count: u64,
}

/// Which interaction stream a heatmap is drawn from.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeatmapType {
    #[default]
    Click,
    Scroll,
    Move,
}

impl HeatmapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeatmapType::Click => "click",
            HeatmapType::Scroll => "scroll",
            HeatmapType::Move => "move",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            HeatmapType::Click => EventType::Click,
            HeatmapType::Scroll => EventType::Scroll,
            HeatmapType::Move => EventType::Mousemove,
        }
    }
}

/// Pull `{x, y, intensity}` out of event metadata. Events without numeric
/// coordinates are skipped; a missing or non-positive intensity counts as 1.
pub fn points_from_events<'a, I>(events: I) -> Vec<HeatPoint>
where
    I: IntoIterator<Item = &'a InteractionEvent>,
{
    events
        .into_iter()
        .filter_map(|ev| {
            let x = ev.metadata.get("x").and_then(Value::as_f64)?;
            let y = ev.metadata.get("y").and_then(Value::as_f64)?;
            let intensity = ev
                .metadata
                .get("intensity")
                .and_then(Value::as_f64)
                .filter(|i| *i > 0.0)
                .unwrap_or(1.0);
            Some(HeatPoint { x, y, intensity })
        })
        .collect()
}

/// Greedy single-pass clustering.
///
/// Each unmerged point, in input order, becomes a seed and absorbs every
/// later unmerged point within `radius` of the seed itself. The result
/// depends on input order: reordering the same points can yield different
/// clusters. O(n²); inputs are expected to be pre-filtered to one
/// page/type/device.
pub fn cluster_points(points: &[HeatPoint], radius: f64) -> Vec<HeatmapCluster> {
    let radius_sq = radius * radius;
    let mut merged = vec![false; points.len()];
    let mut clusters = Vec::new();

    for i in 0..points.len() {
        if merged[i] {
            continue;
        }
        merged[i] = true;
        let seed = points[i];

        let mut weight = seed.intensity;
        let mut sum_x = seed.x * seed.intensity;
        let mut sum_y = seed.y * seed.intensity;
        let mut count = 1u64;

        for j in (i + 1)..points.len() {
            if merged[j] {
                continue;
            }
            let p = points[j];
            let (dx, dy) = (p.x - seed.x, p.y - seed.y);
            if dx * dx + dy * dy <= radius_sq {
                merged[j] = true;
                weight += p.intensity;
                sum_x += p.x * p.intensity;
                sum_y += p.y * p.intensity;
                count += 1;
            }
        }

        let (x, y) = if weight > 0.0 {
            (sum_x / weight, sum_y / weight)
        } else {
            (seed.x, seed.y)
        };
        clusters.push(HeatmapCluster {
            x,
            y,
            intensity: weight,
            count,
        });
    }

    clusters
}

/// Like [`cluster_points`], but sorts by `(x, y)` first so the output does
/// not depend on arrival order.
pub fn cluster_points_sorted(points: &[HeatPoint], radius: f64) -> Vec<HeatmapCluster> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    cluster_points(&sorted, radius)
}

/// `intensity / max(intensity)` per cluster, for sizing and fading decals.
pub fn relative_intensity(clusters: &[HeatmapCluster]) -> Vec<f64> {
    let max = clusters.iter().map(|c| c.intensity).fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return vec![0.0; clusters.len()];
    }
    clusters.iter().map(|c| c.intensity / max).collect()
}
