pub mod dispatch;
pub mod evaluator;
pub mod metrics;
pub mod rules;
pub mod store;
