//! Per-shard labeling loop.
//!
//! Reads the shard input, resumes from its checkpoint, and labels the
//! remaining records batch by batch in input order: blank texts are
//! skipped, the fast tier is asked first, and only records the engine does
//! not fast-accept go to the pro tier. Progress is checkpointed every
//! `interval_batches` batches and the final output replaces the checkpoint.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::classify::{Classifier, Tier};
use crate::config::LabelerConfig;
use crate::consensus::{ConsensusEngine, Screening};
use crate::dataset::{Dataset, DatasetError, OutputSchema, Record};
use crate::gateway::{ModelUsage, TallyUsageSink};
use crate::labels::ConsensusDecision;
use crate::report::StrategyCounts;
use crate::shard::{self, fingerprint_ids, ShardId};

/// Exit code of a worker process stopped by a termination signal.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("shard {shard_id} cancelled after {processed} records")]
    Cancelled { shard_id: ShardId, processed: usize },
}

impl WorkerError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Cancelled { .. } => EXIT_CANCELLED,
            _ => 1,
        }
    }
}

/// What one worker run should label.
#[derive(Debug, Clone)]
pub struct ShardJob {
    pub shard_id: ShardId,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Restrict to these input rows (0-based, end exclusive).
    pub rows: Option<Range<usize>>,
    pub run_id: Option<Uuid>,
}

/// Summary of a finished shard.
#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub shard_id: ShardId,
    pub records: usize,
    pub resumed_from: usize,
    pub audited: u64,
    pub strategies: StrategyCounts,
    pub usage: BTreeMap<String, ModelUsage>,
    pub output: PathBuf,
    pub elapsed_ms: u64,
}

/// Counters for one labeled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub audited: u64,
    pub pro_records: usize,
}

pub struct ShardWorker<R: Rng = StdRng> {
    classifier: Classifier,
    engine: ConsensusEngine<R>,
    checkpoints: CheckpointStore,
    config: LabelerConfig,
    cancel: Arc<AtomicBool>,
    usage: Option<Arc<TallyUsageSink>>,
}

impl<R: Rng> ShardWorker<R> {
    pub fn new(
        classifier: Classifier,
        engine: ConsensusEngine<R>,
        checkpoints: CheckpointStore,
        config: LabelerConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            classifier,
            engine,
            checkpoints,
            config,
            cancel,
            usage: None,
        }
    }

    /// Include this sink's totals in the shard report.
    pub fn with_usage(mut self, usage: Arc<TallyUsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    fn usage_snapshot(&self) -> BTreeMap<String, ModelUsage> {
        self.usage
            .as_ref()
            .map(|u| u.snapshot())
            .unwrap_or_default()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = self.config.classifier.request_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Label one shard end to end.
    pub async fn run(&mut self, job: &ShardJob) -> Result<ShardReport, WorkerError> {
        let started = Instant::now();
        let shard_id = job.shard_id;

        let mut input = Dataset::read_csv(&job.input)?;
        if let Some(rows) = &job.rows {
            input = input.slice(rows.clone());
        }
        let records = input.records(&self.config.columns)?;
        let schema = OutputSchema::for_input(input.headers());
        let fingerprint = fingerprint_ids(records.iter().map(|r| r.record_id.as_str()));

        if let Some(done) = shard::finished_output(
            &job.output,
            schema.headers(),
            &self.config.columns.id_column,
            &fingerprint,
        ) {
            info!(
                shard_id = shard_id.get(),
                records = records.len(),
                output = %job.output.display(),
                "shard output already complete; nothing to label"
            );
            return Ok(ShardReport {
                shard_id,
                records: records.len(),
                resumed_from: records.len(),
                audited: 0,
                strategies: StrategyCounts::from_rows(&schema.columns(), done.rows()),
                usage: self.usage_snapshot(),
                output: job.output.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let resume = self
            .checkpoints
            .resume(shard_id, &fingerprint, records.len(), schema.headers());
        let resumed_from = resume.index;
        let mut out_rows = resume.rows;
        let mut strategies = StrategyCounts::from_rows(&schema.columns(), &out_rows);

        info!(
            shard_id = shard_id.get(),
            records = records.len(),
            resumed_from,
            run_id = ?job.run_id,
            input = %job.input.display(),
            "starting shard"
        );

        let batch_size = self.config.classifier.batch_size.max(1);
        let interval = self.config.checkpoint.interval_batches.max(1);
        let total_batches = records.len().div_ceil(batch_size);
        let mut processed = resumed_from;
        let mut saved = resumed_from;
        let mut unsaved_batches = 0usize;
        let mut audited = 0u64;

        while processed < records.len() {
            if self.cancelled() {
                if saved < processed {
                    self.checkpoints.save(
                        shard_id,
                        processed,
                        &fingerprint,
                        schema.headers(),
                        &out_rows,
                    )?;
                }
                warn!(shard_id = shard_id.get(), processed, "cancelled; checkpoint kept");
                return Err(WorkerError::Cancelled {
                    shard_id,
                    processed,
                });
            }

            let end = (processed + batch_size).min(records.len());
            let batch = &records[processed..end];
            let (decisions, stats) = self.label_batch(batch).await;
            audited += stats.audited;

            for (decision, source) in decisions.iter().zip(&input.rows()[processed..end]) {
                strategies.record(decision.strategy);
                out_rows.push(schema.labeled_row(source, decision));
            }
            processed = end;
            unsaved_batches += 1;

            if unsaved_batches >= interval || processed == records.len() {
                self.checkpoints.save(
                    shard_id,
                    processed,
                    &fingerprint,
                    schema.headers(),
                    &out_rows,
                )?;
                saved = processed;
                unsaved_batches = 0;
            }

            info!(
                shard_id = shard_id.get(),
                batch = processed.div_ceil(batch_size),
                total_batches,
                processed,
                total = records.len(),
                pro = stats.pro_records,
                "batch done"
            );
        }

        Dataset::new(schema.headers().to_vec(), out_rows).write_csv(&job.output)?;
        self.checkpoints.clear(shard_id)?;

        let report = ShardReport {
            shard_id,
            records: records.len(),
            resumed_from,
            audited,
            strategies,
            usage: self.usage_snapshot(),
            output: job.output.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            shard_id = shard_id.get(),
            records = report.records,
            audited,
            strategies = %report.strategies,
            cost_nanodollars = self.usage.as_ref().map(|u| u.total_cost_nanodollars()).unwrap_or(0),
            output = %job.output.display(),
            "shard complete"
        );
        Ok(report)
    }

    /// Decide every record of a batch, in input order.
    pub async fn label_batch(&mut self, records: &[Record]) -> (Vec<ConsensusDecision>, BatchStats) {
        let mut stats = BatchStats::default();
        let mut decisions: Vec<Option<ConsensusDecision>> = vec![None; records.len()];

        let mut to_classify = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if record.has_text() {
                to_classify.push(i);
            } else {
                decisions[i] = Some(ConsensusDecision::skipped(record.record_id.as_str()));
            }
        }

        if !to_classify.is_empty() {
            let batch: Vec<Record> = to_classify.iter().map(|&i| records[i].clone()).collect();
            let fast = self.classifier.classify_batch(Tier::Fast, &batch).await;
            self.pause().await;

            let mut pending = Vec::new();
            for (j, result) in fast.iter().enumerate() {
                match self.engine.screen(&batch[j].record_id, result) {
                    Screening::Accepted(decision) => decisions[to_classify[j]] = Some(decision),
                    Screening::NeedsPro { audited } => {
                        if audited {
                            stats.audited += 1;
                        }
                        pending.push(j);
                    }
                }
            }

            if !pending.is_empty() {
                let pro_batch: Vec<Record> = pending.iter().map(|&j| batch[j].clone()).collect();
                let pro = self.classifier.classify_batch(Tier::Pro, &pro_batch).await;
                self.pause().await;
                stats.pro_records = pending.len();

                for (k, &j) in pending.iter().enumerate() {
                    let decision = self.engine.decide(&batch[j].record_id, &fast[j], &pro[k]);
                    debug!(
                        record_id = %batch[j].record_id,
                        fast = %fast[j].label,
                        pro = %pro[k].label,
                        strategy = %decision.strategy,
                        "pro tier consulted"
                    );
                    decisions[to_classify[j]] = Some(decision);
                }
            }
        }

        (decisions.into_iter().flatten().collect(), stats)
    }
}
