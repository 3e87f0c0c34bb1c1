pub mod config;
pub mod database_ops {
    pub mod containers;
    pub mod db;
}
pub mod error;
pub mod logging;
pub mod models;
pub mod normalization;
pub mod pipeline;
pub mod source;

pub mod util {
    pub mod env;
}

pub use config::{Cli, Config};
pub use database_ops::containers::{upsert_container_batch, UpsertSummary};
pub use database_ops::db::{Db, RetryPolicy};
pub use error::{ConfigError, DbError};
pub use models::{ContainerRecord, IpAddress, IpFamily};
pub use pipeline::{BatchSink, Pipeline, PipelineReport, PipelineSettings};
