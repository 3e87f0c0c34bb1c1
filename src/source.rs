use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, instrument};

use crate::normalization::RawRow;

/// Reads the whole input document: a JSON array of row objects.
///
/// Blocking; the pipeline calls this from `spawn_blocking`.
#[instrument]
pub fn read_json_records(path: &Path) -> Result<Vec<RawRow>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);
    let doc: Value = serde_json::from_reader(reader)
        .with_context(|| format!("parse JSON from {}", path.display()))?;
    let Value::Array(items) = doc else {
        bail!("{} must contain a JSON array of rows", path.display());
    };
    let rows: Vec<RawRow> = items.into_iter().map(RawRow::from_value).collect();
    info!(rows = rows.len(), "input document loaded");
    Ok(rows)
}
