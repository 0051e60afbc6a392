pub mod alert;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod pipeline;
pub mod query;
pub mod routes;
pub mod sanitize;
pub mod signals;
pub mod storage;
pub mod types;
