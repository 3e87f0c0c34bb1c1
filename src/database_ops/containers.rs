//! Transactional batch upsert of containers and their IP addresses.
//!
//! Phase 1 stages containers in a transaction-scoped temp table, merges them
//! on `(name, created_at)` and re-reads the surrogate ids. Phase 2 stages the
//! dependent `(container_id, ip_address)` rows and merges them. Both phases
//! share one transaction; any error drops it, which rolls everything back.

use chrono::{DateTime, Utc};
use sqlx::{Connection, Executor, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::models::{ContainerRecord, IpFamily};

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;
const CONTAINER_COLUMNS: usize = 5;
const IP_COLUMNS: usize = 4;

const CREATE_CONTAINER_STAGE: &str = "CREATE TEMP TABLE tmp_containers (
    name               TEXT,
    status             TEXT,
    created_at         TIMESTAMPTZ,
    cpu_usage          BIGINT,
    memory_usage_bytes BIGINT
) ON COMMIT DROP";

const MERGE_CONTAINERS: &str = "INSERT INTO containers (name, status, created_at, cpu_usage, memory_usage_bytes)
    SELECT name, status, created_at, cpu_usage, memory_usage_bytes FROM tmp_containers
    ON CONFLICT (name, created_at) DO UPDATE
    SET status = EXCLUDED.status,
        cpu_usage = EXCLUDED.cpu_usage,
        memory_usage_bytes = EXCLUDED.memory_usage_bytes";

const SELECT_STAGED_IDS: &str = "SELECT c.id, c.name, c.created_at
    FROM containers c
    JOIN tmp_containers t ON t.name = c.name AND t.created_at = c.created_at";

const CREATE_IP_STAGE: &str = "CREATE TEMP TABLE tmp_container_ips (
    container_id BIGINT,
    ip_address   TEXT,
    family       TEXT,
    scope        TEXT
) ON COMMIT DROP";

const MERGE_IPS: &str = "INSERT INTO container_ips (container_id, ip_address, family, scope)
    SELECT container_id, ip_address, family, scope FROM tmp_container_ips
    ON CONFLICT (container_id, ip_address) DO UPDATE
    SET family = EXCLUDED.family,
        scope = EXCLUDED.scope";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Distinct business keys merged.
    pub containers: usize,
    /// Distinct `(container_id, ip_address)` pairs merged.
    pub ips: usize,
    /// Records whose key did not resolve to an id after the merge.
    pub unresolved: usize,
}

struct IpRow<'a> {
    container_id: i64,
    ip_address: &'a str,
    family: IpFamily,
    scope: Option<&'a str>,
}

/// Upserts `batch` atomically on `conn`. An empty batch opens no transaction.
#[instrument(skip(conn, batch), fields(size = batch.len()))]
pub async fn upsert_container_batch(
    conn: &mut PgConnection,
    batch: &[ContainerRecord],
) -> Result<UpsertSummary, sqlx::Error> {
    if batch.is_empty() {
        return Ok(UpsertSummary::default());
    }
    let containers = last_per_business_key(batch);

    let mut tx = conn.begin().await?;

    (&mut *tx).execute(sqlx::raw_sql(CREATE_CONTAINER_STAGE)).await?;
    for chunk in containers.chunks(MAX_BIND_PARAMS / CONTAINER_COLUMNS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO tmp_containers (name, status, created_at, cpu_usage, memory_usage_bytes) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.name.as_str())
                .push_bind(r.status.as_deref())
                .push_bind(r.created_at)
                .push_bind(r.cpu_usage)
                .push_bind(r.memory_usage_bytes);
        });
        qb.build().persistent(false).execute(&mut *tx).await?;
    }
    (&mut *tx).execute(sqlx::raw_sql(MERGE_CONTAINERS)).await?;

    let ids: HashMap<(String, DateTime<Utc>), i64> =
        sqlx::query_as::<_, (i64, String, DateTime<Utc>)>(SELECT_STAGED_IDS)
            .persistent(false)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|(id, name, created_at)| ((name, created_at), id))
            .collect();

    let (ip_rows, unresolved) = resolve_ip_rows(batch, &ids);
    if unresolved > 0 {
        warn!(
            unresolved,
            "records without a container id after merge; their addresses were skipped"
        );
    }

    if !ip_rows.is_empty() {
        (&mut *tx).execute(sqlx::raw_sql(CREATE_IP_STAGE)).await?;
        for chunk in ip_rows.chunks(MAX_BIND_PARAMS / IP_COLUMNS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO tmp_container_ips (container_id, ip_address, family, scope) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.container_id)
                    .push_bind(r.ip_address)
                    .push_bind(r.family.as_str())
                    .push_bind(r.scope);
            });
            qb.build().persistent(false).execute(&mut *tx).await?;
        }
        (&mut *tx).execute(sqlx::raw_sql(MERGE_IPS)).await?;
    }

    tx.commit().await?;

    let summary = UpsertSummary {
        containers: containers.len(),
        ips: ip_rows.len(),
        unresolved,
    };
    debug!(?summary, "batch upserted");
    Ok(summary)
}

/// Collapses records sharing a business key to the last occurrence, keeping
/// first-seen order. One `ON CONFLICT DO UPDATE` may not touch a row twice.
fn last_per_business_key(batch: &[ContainerRecord]) -> Vec<&ContainerRecord> {
    let mut slots: HashMap<(&str, DateTime<Utc>), usize> = HashMap::with_capacity(batch.len());
    let mut out: Vec<&ContainerRecord> = Vec::with_capacity(batch.len());
    for rec in batch {
        match slots.get(&rec.business_key()) {
            Some(&slot) => out[slot] = rec,
            None => {
                slots.insert(rec.business_key(), out.len());
                out.push(rec);
            }
        }
    }
    out
}

/// Builds the dependent rows for every record whose key resolved, last write
/// winning per `(container_id, ip_address)`. Returns the rows and the number
/// of records that did not resolve.
fn resolve_ip_rows<'a>(
    batch: &'a [ContainerRecord],
    ids: &HashMap<(String, DateTime<Utc>), i64>,
) -> (Vec<IpRow<'a>>, usize) {
    let mut rows: Vec<IpRow<'a>> = Vec::new();
    let mut slots: HashMap<(i64, &'a str), usize> = HashMap::new();
    let mut unresolved = 0usize;
    for rec in batch {
        let Some(&container_id) = ids.get(&(rec.name.clone(), rec.created_at)) else {
            unresolved += 1;
            continue;
        };
        for ip in &rec.ips {
            let row = IpRow {
                container_id,
                ip_address: ip.ip_address.as_str(),
                family: ip.family,
                scope: ip.scope.as_deref(),
            };
            match slots.get(&(container_id, row.ip_address)) {
                Some(&slot) => rows[slot] = row,
                None => {
                    slots.insert((container_id, row.ip_address), rows.len());
                    rows.push(row);
                }
            }
        }
    }
    (rows, unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IpAddress;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).single().unwrap()
    }

    fn rec(name: &str, h: u32, status: &str, ips: &[(&str, IpFamily, Option<&str>)]) -> ContainerRecord {
        ContainerRecord {
            name: name.to_string(),
            status: Some(status.to_string()),
            created_at: ts(h),
            cpu_usage: None,
            memory_usage_bytes: None,
            ips: ips
                .iter()
                .map(|(addr, family, scope)| IpAddress {
                    ip_address: addr.to_string(),
                    family: *family,
                    scope: scope.map(str::to_string),
                })
                .collect(),
        }
    }

    #[test]
    fn duplicate_keys_keep_last_values_first_position() {
        let batch = vec![
            rec("a", 0, "created", &[]),
            rec("b", 0, "running", &[]),
            rec("a", 0, "running", &[]),
            rec("a", 1, "exited", &[]),
        ];
        let merged = last_per_business_key(&batch);
        let view: Vec<(&str, DateTime<Utc>, &str)> = merged
            .iter()
            .map(|r| (r.name.as_str(), r.created_at, r.status.as_deref().unwrap()))
            .collect();
        assert_eq!(
            view,
            vec![
                ("a", ts(0), "running"),
                ("b", ts(0), "running"),
                ("a", ts(1), "exited"),
            ]
        );
    }

    #[test]
    fn ip_rows_follow_resolved_ids() {
        let batch = vec![
            rec("a", 0, "up", &[("10.0.0.1", IpFamily::Inet, None), ("fe80::1", IpFamily::Inet6, Some("link"))]),
            rec("ghost", 0, "up", &[("10.0.0.9", IpFamily::Inet, None)]),
            rec("b", 0, "up", &[]),
        ];
        let ids = HashMap::from([
            (("a".to_string(), ts(0)), 11),
            (("b".to_string(), ts(0)), 12),
        ]);
        let (rows, unresolved) = resolve_ip_rows(&batch, &ids);
        assert_eq!(unresolved, 1);
        let view: Vec<(i64, &str, &str, Option<&str>)> = rows
            .iter()
            .map(|r| (r.container_id, r.ip_address, r.family.as_str(), r.scope))
            .collect();
        assert_eq!(
            view,
            vec![(11, "10.0.0.1", "inet", None), (11, "fe80::1", "inet6", Some("link"))]
        );
    }

    #[test]
    fn repeated_addresses_collapse_to_last() {
        let batch = vec![
            rec("a", 0, "up", &[("10.0.0.1", IpFamily::Inet, Some("global"))]),
            rec("a", 0, "up", &[("10.0.0.1", IpFamily::Inet, Some("host")), ("10.0.0.2", IpFamily::Inet, None)]),
        ];
        let ids = HashMap::from([(("a".to_string(), ts(0)), 7)]);
        let (rows, unresolved) = resolve_ip_rows(&batch, &ids);
        assert_eq!(unresolved, 0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ip_address, "10.0.0.1");
        assert_eq!(rows[0].scope, Some("host"));
        assert_eq!(rows[1].ip_address, "10.0.0.2");
    }
}
