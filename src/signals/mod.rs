//! Query-time detectors over an already-fetched event slice.
//!
//! Everything here is synchronous and side-effect free; callers fetch a
//! window from storage and run the detector on a blocking thread.

pub mod dead;
pub mod heatmap;
pub mod rage;
pub mod selector;
pub mod trend;

pub use selector::{resolve_selector, GroupKey, SpotRollup};
