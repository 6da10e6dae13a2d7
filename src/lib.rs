pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod fixtures;
pub mod indexer;
pub mod mapper;
pub mod metrics;
pub mod models;
pub mod store;
pub mod telemetry;
