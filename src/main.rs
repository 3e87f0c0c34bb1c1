use anyhow::{Context, Result};
use clap::Parser;
use container_ingest::config::{Cli, Config};
use container_ingest::database_ops::db::Db;
use container_ingest::logging::{init_tracing, LogFormat};
use container_ingest::pipeline::{Pipeline, PipelineSettings};
use container_ingest::source::read_json_records;
use container_ingest::util::env as env_util;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing("info,sqlx=warn", LogFormat::from_env())?;

    let cli = Cli::parse();
    let config = Config::load(&cli).context("invalid configuration")?;
    info!(
        json_path = %config.json_path.display(),
        batch_rows = config.batch_rows.get(),
        max_queue = config.max_queue.get(),
        "starting container ingest"
    );

    let mut db = Db::new(&config);
    db.start().await.context("database startup failed")?;

    let pipeline = Pipeline::new(PipelineSettings::from(&config));
    let json_path = config.json_path.clone();
    let outcome = pipeline
        .run(move || read_json_records(&json_path), &db)
        .await;
    db.stop().await;

    let report = outcome?;
    info!(
        rows = report.rows_read,
        accepted = report.records_accepted,
        skipped = report.rows_skipped,
        batches = report.batches_written,
        "ingest complete"
    );
    Ok(())
}
