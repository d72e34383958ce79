pub mod api;
pub mod cache;
pub mod config;
pub mod entities;
pub mod error;
pub mod media;
pub mod metrics;
pub mod migrator;
pub mod notifications;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use sea_orm;
pub use redis;
