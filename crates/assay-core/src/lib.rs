pub mod cancellation;
pub mod config;
pub mod dispatch;
pub mod execution;
pub mod export;
pub mod graph;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod persistence;
pub mod pipeline;
pub mod projection;
pub mod provenance;
pub mod skills;
pub mod sqlite;
