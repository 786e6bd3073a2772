//! Infrastructure layer: storage, background tasks, configuration.

pub mod config;
pub mod db;
pub mod jobs;
pub mod pipeline;
pub mod tasks;

pub use config::{AppConfig, ConfigError};
pub use db::{Database, DbError};
