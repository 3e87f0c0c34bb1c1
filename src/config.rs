use clap::Parser;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::database_ops::db::RetryPolicy;
use crate::error::ConfigError;
use crate::util::env as env_util;

const DEFAULT_BATCH_ROWS: usize = 100;
const DEFAULT_MAX_QUEUE: usize = 1;
const DEFAULT_SCHEMA_PATH: &str = "schema.sql";
const DEFAULT_MAX_CONNS: u32 = 5;
const DEFAULT_MIN_CONNS: u32 = 1;

/// Command-line overrides; anything unset falls back to the environment.
#[derive(Debug, Default, Parser)]
#[command(name = "container-ingest", about = "Load container inventory JSON into Postgres")]
pub struct Cli {
    /// Input JSON file (overrides JSON_PATH)
    #[arg(long)]
    pub json_path: Option<PathBuf>,
    /// Records per transaction (overrides BATCH_ROWS)
    #[arg(long)]
    pub batch_rows: Option<NonZeroUsize>,
    /// Bounded queue capacity between parser and writer (overrides MAX_QUEUE)
    #[arg(long)]
    pub max_queue: Option<NonZeroUsize>,
    /// Idempotent schema script run at startup (overrides SCHEMA_PATH)
    #[arg(long)]
    pub schema_path: Option<PathBuf>,
}

/// Runtime configuration, built once in `main` and passed by reference.
#[derive(Clone)]
pub struct Config {
    pub json_path: PathBuf,
    pub db_dsn: String,
    pub batch_rows: NonZeroUsize,
    pub max_queue: NonZeroUsize,
    pub schema_path: PathBuf,
    pub db_max_conns: u32,
    pub db_min_conns: u32,
    pub use_prepared: bool,
    pub connect_retry: RetryPolicy,
}

// SECURITY: never print the DSN; it usually carries credentials.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("json_path", &self.json_path)
            .field("db_dsn", &"<redacted>")
            .field("batch_rows", &self.batch_rows)
            .field("max_queue", &self.max_queue)
            .field("schema_path", &self.schema_path)
            .field("db_max_conns", &self.db_max_conns)
            .field("db_min_conns", &self.db_min_conns)
            .field("use_prepared", &self.use_prepared)
            .field("connect_retry", &self.connect_retry)
            .finish()
    }
}

impl Config {
    /// Reads the process environment (after `.env`) and applies CLI overrides.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_lookup(cli, env_util::env_opt)
    }

    pub fn from_lookup<F>(cli: &Cli, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let json_path = match &cli.json_path {
            Some(p) => p.clone(),
            None => PathBuf::from(vars.required("JSON_PATH")?),
        };
        let db_dsn = vars.required("DB_DSN")?;
        let batch_rows = match cli.batch_rows {
            Some(n) => n,
            None => vars.positive("BATCH_ROWS", DEFAULT_BATCH_ROWS)?,
        };
        let max_queue = match cli.max_queue {
            Some(n) => n,
            None => vars.positive("MAX_QUEUE", DEFAULT_MAX_QUEUE)?,
        };
        let schema_path = match &cli.schema_path {
            Some(p) => p.clone(),
            None => lookup("SCHEMA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEMA_PATH)),
        };

        let db_max_conns: u32 = vars.parsed("DB_MAX_CONNS", DEFAULT_MAX_CONNS, "an integer")?;
        let db_min_conns: u32 = vars.parsed("DB_MIN_CONNS", DEFAULT_MIN_CONNS, "an integer")?;
        if db_max_conns == 0 || db_min_conns > db_max_conns {
            return Err(ConfigError::Invalid {
                key: "DB_MAX_CONNS",
                expected: "a positive integer no smaller than DB_MIN_CONNS",
                value: db_max_conns.to_string(),
            });
        }

        let defaults = RetryPolicy::default();
        let connect_retry = RetryPolicy {
            base_delay: Duration::from_millis(vars.parsed(
                "CONNECT_BACKOFF_BASE_MS",
                defaults.base_delay.as_millis() as u64,
                "milliseconds",
            )?),
            max_delay: Duration::from_millis(vars.parsed(
                "CONNECT_BACKOFF_MAX_MS",
                defaults.max_delay.as_millis() as u64,
                "milliseconds",
            )?),
            max_elapsed: Duration::from_secs(vars.parsed(
                "CONNECT_TIMEOUT_SECS",
                defaults.max_elapsed.as_secs(),
                "seconds",
            )?),
            max_attempts: vars
                .positive("CONNECT_MAX_ATTEMPTS", defaults.max_attempts as usize)?
                .get() as u32,
        };

        Ok(Self {
            json_path,
            db_dsn,
            batch_rows,
            max_queue,
            schema_path,
            db_max_conns,
            db_min_conns,
            use_prepared: lookup("USE_PREPARED")
                .map(|v| env_util::parse_flag(&v))
                .unwrap_or(false),
            connect_retry,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        (self.0)(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T: FromStr>(
        &self,
        key: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key,
                expected,
                value: raw,
            }),
        }
    }

    fn positive(&self, key: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
        let value: usize = self.parsed(key, default, "a positive integer")?;
        NonZeroUsize::new(value).ok_or(ConfigError::Invalid {
            key,
            expected: "a positive integer",
            value: value.to_string(),
        })
    }
}
