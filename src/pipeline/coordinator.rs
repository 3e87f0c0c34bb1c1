use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::batcher::Batcher;
use crate::config::Config;
use crate::models::ContainerRecord;
use crate::normalization::{validate_row, RawRow};

/// Producer → consumer message. `End` is the explicit end-of-stream marker.
#[derive(Debug)]
pub enum QueueMessage {
    Batch(Vec<ContainerRecord>),
    End,
}

/// Write side of the pipeline. Each call is awaited before the next batch is popped.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write_batch(&self, batch: Vec<ContainerRecord>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub batch_rows: NonZeroUsize,
    pub max_queue: NonZeroUsize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_rows: config.batch_rows,
            max_queue: config.max_queue,
        }
    }
}

/// Counters readable while a run is in flight.
#[derive(Debug, Default)]
pub struct PipelineProgress {
    produced: AtomicUsize,
    written: AtomicUsize,
}

impl PipelineProgress {
    pub fn batches_produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn batches_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub rows_read: usize,
    pub records_accepted: usize,
    pub rows_skipped: usize,
    pub batches_written: usize,
}

#[derive(Debug, Clone, Copy)]
struct ProducerReport {
    rows_read: usize,
    records_accepted: usize,
}

pub struct Pipeline {
    settings: PipelineSettings,
    progress: Arc<PipelineProgress>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            progress: Arc::new(PipelineProgress::default()),
        }
    }

    pub fn progress(&self) -> Arc<PipelineProgress> {
        self.progress.clone()
    }

    /// Runs producer and consumer to completion over one bounded queue.
    ///
    /// `load` reads the whole input on a blocking thread. The first error from
    /// either stage fails the run and drops the other stage, so nothing is
    /// written after it.
    #[instrument(skip_all, fields(batch_rows = self.settings.batch_rows.get(), max_queue = self.settings.max_queue.get()))]
    pub async fn run<L, S>(&self, load: L, sink: &S) -> Result<PipelineReport>
    where
        L: FnOnce() -> Result<Vec<RawRow>> + Send + 'static,
        S: BatchSink + ?Sized,
    {
        let (tx, rx) = mpsc::channel(self.settings.max_queue.get());
        let requeue = tx.clone();

        let (produced, batches_written) = tokio::try_join!(
            produce(load, self.settings.batch_rows, tx, &self.progress),
            consume(rx, requeue, sink, &self.progress),
        )?;

        let report = PipelineReport {
            rows_read: produced.rows_read,
            records_accepted: produced.records_accepted,
            rows_skipped: produced.rows_read - produced.records_accepted,
            batches_written,
        };
        info!(
            rows_read = report.rows_read,
            accepted = report.records_accepted,
            skipped = report.rows_skipped,
            batches = report.batches_written,
            "pipeline finished"
        );
        Ok(report)
    }
}

async fn produce<L>(
    load: L,
    batch_rows: NonZeroUsize,
    tx: mpsc::Sender<QueueMessage>,
    progress: &PipelineProgress,
) -> Result<ProducerReport>
where
    L: FnOnce() -> Result<Vec<RawRow>> + Send + 'static,
{
    let rows = tokio::task::spawn_blocking(load)
        .await
        .context("input loader task failed")??;
    let rows_read = rows.len();
    info!(rows = rows_read, "producer loaded input");

    let mut records_accepted = 0usize;
    let records = rows
        .into_iter()
        .filter_map(validate_row)
        .inspect(|_| records_accepted += 1);
    for batch in Batcher::new(records, batch_rows) {
        debug!(size = batch.len(), "enqueueing batch");
        tx.send(QueueMessage::Batch(batch))
            .await
            .map_err(|_| anyhow!("batch queue closed before the producer finished"))?;
        progress.produced.fetch_add(1, Ordering::SeqCst);
    }
    tx.send(QueueMessage::End)
        .await
        .map_err(|_| anyhow!("batch queue closed before the end marker was sent"))?;
    info!(batches = progress.batches_produced(), "producer finished");

    Ok(ProducerReport {
        rows_read,
        records_accepted,
    })
}

async fn consume<S>(
    mut rx: mpsc::Receiver<QueueMessage>,
    requeue: mpsc::Sender<QueueMessage>,
    sink: &S,
    progress: &PipelineProgress,
) -> Result<usize>
where
    S: BatchSink + ?Sized,
{
    let mut written = 0usize;
    loop {
        match rx.recv().await {
            Some(QueueMessage::Batch(batch)) => {
                let size = batch.len();
                sink.write_batch(batch)
                    .await
                    .with_context(|| format!("writing batch {} ({size} records)", written + 1))?;
                written += 1;
                progress.written.fetch_add(1, Ordering::SeqCst);
                debug!(batch = written, size, "batch written");
            }
            Some(QueueMessage::End) => {
                // Leave the marker for any other consumer sharing the queue.
                if requeue.try_send(QueueMessage::End).is_err() {
                    debug!("end marker not re-enqueued; queue full or closed");
                }
                break;
            }
            None => bail!("batch queue closed without an end marker"),
        }
    }
    info!(batches = written, "consumer finished");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn rows(n: usize) -> Vec<RawRow> {
        (0..n)
            .map(|i| {
                RawRow::from_value(json!({
                    "name": format!("c-{i}"),
                    "created_at": "2024-01-01T00:00:00Z",
                }))
            })
            .collect()
    }

    fn settings(batch_rows: usize, max_queue: usize) -> PipelineSettings {
        PipelineSettings {
            batch_rows: NonZeroUsize::new(batch_rows).unwrap(),
            max_queue: NonZeroUsize::new(max_queue).unwrap(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn write_batch(&self, batch: Vec<ContainerRecord>) -> Result<()> {
            let mut batches = self.batches.lock().unwrap();
            if self.fail_on == Some(batches.len() + 1) {
                bail!("store rejected batch");
            }
            batches.push(batch.into_iter().map(|r| r.name).collect());
            Ok(())
        }
    }

    /// Blocks every write until a permit is released by the test.
    struct GatedSink {
        gate: Semaphore,
        started: AtomicUsize,
    }

    #[async_trait]
    impl BatchSink for GatedSink {
        async fn write_batch(&self, _batch: Vec<ContainerRecord>) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            Ok(())
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn writes_batches_in_production_order() {
        let sink = RecordingSink::default();
        let pipeline = Pipeline::new(settings(2, 1));
        let report = pipeline.run(|| Ok(rows(5)), &sink).await.unwrap();

        assert_eq!(
            report,
            PipelineReport {
                rows_read: 5,
                records_accepted: 5,
                rows_skipped: 0,
                batches_written: 3,
            }
        );
        let batches = sink.batches.lock().unwrap();
        assert_eq!(
            *batches,
            vec![
                vec!["c-0".to_string(), "c-1".to_string()],
                vec!["c-2".to_string(), "c-3".to_string()],
                vec!["c-4".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn invalid_rows_are_counted_not_written() {
        let mut input = rows(3);
        input.push(RawRow::from_value(json!({"name": "no-ts"})));
        input.push(RawRow::from_value(json!({"created_at": "2024-01-01T00:00:00Z"})));
        let sink = RecordingSink::default();
        let report = Pipeline::new(settings(10, 1))
            .run(move || Ok(input), &sink)
            .await
            .unwrap();
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.records_accepted, 3);
        assert_eq!(report.rows_skipped, 2);
        assert_eq!(report.batches_written, 1);
    }

    #[tokio::test]
    async fn empty_input_writes_nothing() {
        let sink = RecordingSink::default();
        let report = Pipeline::new(settings(10, 1))
            .run(|| Ok(Vec::new()), &sink)
            .await
            .unwrap();
        assert_eq!(report.batches_written, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn producer_blocks_when_queue_is_full() {
        let sink = GatedSink {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        };
        let pipeline = Pipeline::new(settings(1, 1));
        let progress = pipeline.progress();

        let checks = async {
            // First batch popped and in flight, second queued, third blocked.
            wait_until(|| sink.started.load(Ordering::SeqCst) == 1 && progress.batches_produced() == 2)
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(progress.batches_produced(), 2);
            assert_eq!(progress.batches_written(), 0);

            sink.gate.add_permits(1);
            wait_until(|| progress.batches_produced() == 3).await;
            assert_eq!(progress.batches_written(), 1);
            sink.gate.add_permits(2);
        };

        let (report, ()) = tokio::join!(pipeline.run(|| Ok(rows(3)), &sink), checks);
        assert_eq!(report.unwrap().batches_written, 3);
        assert_eq!(progress.batches_written(), 3);
    }

    #[tokio::test]
    async fn sink_failure_stops_the_pipeline() {
        let sink = RecordingSink {
            fail_on: Some(2),
            ..Default::default()
        };
        let pipeline = Pipeline::new(settings(1, 1));
        let err = pipeline.run(|| Ok(rows(5)), &sink).await.unwrap_err();
        assert!(format!("{err:#}").contains("store rejected batch"));
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(pipeline.progress().batches_written(), 1);
    }

    #[tokio::test]
    async fn loader_failure_fails_the_run() {
        let sink = RecordingSink::default();
        let err = Pipeline::new(settings(1, 1))
            .run(|| Err(anyhow!("disk on fire")), &sink)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("disk on fire"));
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loader_panic_is_an_error() {
        let sink = RecordingSink::default();
        let result = Pipeline::new(settings(1, 1))
            .run(|| -> Result<Vec<RawRow>> { panic!("loader bug") }, &sink)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn records_reach_sink_normalized() {
        struct Capture(Mutex<Vec<ContainerRecord>>);

        #[async_trait]
        impl BatchSink for Capture {
            async fn write_batch(&self, batch: Vec<ContainerRecord>) -> Result<()> {
                self.0.lock().unwrap().extend(batch);
                Ok(())
            }
        }

        let sink = Capture(Mutex::new(Vec::new()));
        let input = vec![RawRow::from_value(json!({
            "name": "web-1",
            "created_at": "2024-01-01T01:00:00+01:00",
        }))];
        Pipeline::new(settings(5, 1))
            .run(move || Ok(input), &sink)
            .await
            .unwrap();
        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].created_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap()
        );
    }
}
