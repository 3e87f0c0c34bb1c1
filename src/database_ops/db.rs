use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use super::containers::{upsert_container_batch, UpsertSummary};
use crate::config::Config;
use crate::error::DbError;
use crate::models::ContainerRecord;
use crate::pipeline::BatchSink;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Backoff budget for startup connectivity. Delay before retry `n` is
/// `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(30),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Connection/network failures worth retrying at startup. Configuration,
/// authentication and SQL errors are not.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code == "57P03" || code == "53300")
            .unwrap_or(false),
        _ => false,
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the policy's
/// elapsed/attempt budget is spent (whichever comes first).
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                attempts += 1;
                if started.elapsed() > policy.max_elapsed || attempts >= policy.max_attempts {
                    return Err(DbError::RetriesExhausted {
                        attempts,
                        source: err,
                    });
                }
                let delay = policy.delay_for(attempts);
                warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "transient database error; backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[derive(Clone)]
struct DbSettings {
    dsn: String,
    schema_path: PathBuf,
    max_connections: u32,
    min_connections: u32,
    use_prepared: bool,
    retry: RetryPolicy,
}

/// Owns the connection pool. Unusable until [`Db::start`] succeeds.
pub struct Db {
    settings: DbSettings,
    pool: Option<PgPool>,
}

impl Db {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: DbSettings {
                dsn: config.db_dsn.clone(),
                schema_path: config.schema_path.clone(),
                max_connections: config.db_max_conns,
                min_connections: config.db_min_conns,
                use_prepared: config.use_prepared,
                retry: config.connect_retry.clone(),
            },
            pool: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.pool.is_some()
    }

    pub fn pool(&self) -> Result<&PgPool, DbError> {
        self.pool.as_ref().ok_or(DbError::NotStarted)
    }

    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    fn connect_options(&self) -> Result<PgConnectOptions, DbError> {
        let dsn = &self.settings.dsn;
        let mut options = PgConnectOptions::from_str(dsn)?;
        if dsn.contains("sslmode=require") {
            options = options.ssl_mode(PgSslMode::Require);
        }
        if !self.settings.use_prepared {
            // PgBouncer txn mode safe
            options = options.statement_cache_capacity(0);
        }
        Ok(options)
    }

    /// Builds the pool and applies the schema script, retrying transient
    /// connectivity failures per the configured [`RetryPolicy`].
    #[instrument(skip(self), fields(schema = %self.settings.schema_path.display()))]
    pub async fn start(&mut self) -> Result<(), DbError> {
        if self.pool.is_some() {
            return Ok(());
        }
        let schema = std::fs::read_to_string(&self.settings.schema_path).map_err(|source| {
            DbError::SchemaRead {
                path: self.settings.schema_path.clone(),
                source,
            }
        })?;
        let options = self.connect_options()?;
        let settings = self.settings.clone();

        let pool = retry_transient(&settings.retry, || {
            let options = options.clone();
            let schema = schema.as_str();
            let settings = &settings;
            async move {
                let pool = PgPoolOptions::new()
                    .max_connections(settings.max_connections)
                    .min_connections(settings.min_connections)
                    .acquire_timeout(ACQUIRE_TIMEOUT)
                    .idle_timeout(IDLE_TIMEOUT)
                    .connect_with(options)
                    .await?;
                if let Err(err) = sqlx::raw_sql(schema).execute(&pool).await {
                    pool.close().await;
                    return Err(err);
                }
                Ok(pool)
            }
        })
        .await?;

        info!(
            max_conns = settings.max_connections,
            min_conns = settings.min_connections,
            "connected to db; schema ensured"
        );
        self.pool = Some(pool);
        Ok(())
    }

    /// Closes every pooled connection. No-op when never started.
    pub async fn stop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            info!("db pool closed");
        }
    }

    /// Upserts one batch in its own transaction on a pooled connection.
    #[instrument(skip(self, batch), fields(size = batch.len()))]
    pub async fn upsert_batch(&self, batch: &[ContainerRecord]) -> Result<UpsertSummary, DbError> {
        let pool = self.pool()?;
        if batch.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let mut conn = pool.acquire().await?;
        let summary = upsert_container_batch(&mut *conn, batch).await?;
        Ok(summary)
    }
}

#[async_trait]
impl BatchSink for Db {
    async fn write_batch(&self, batch: Vec<ContainerRecord>) -> anyhow::Result<()> {
        let summary = self.upsert_batch(&batch).await?;
        info!(
            containers = summary.containers,
            ips = summary.ips,
            unresolved = summary.unresolved,
            "batch committed"
        );
        Ok(())
    }
}
