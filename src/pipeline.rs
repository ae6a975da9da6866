//! End-to-end run: split → one worker process per shard → merge.
//!
//! Usage:
//! ```bash
//! labeler orchestrate --input comments.csv --credentials keys.txt --output labeled.csv
//! ```
//!
//! The work directory holds shard inputs and outputs, the manifest, the
//! effective config, checkpoints and per-shard logs. Those are removed after
//! a run in which every shard succeeded, unless temp files are kept; other
//! files in the directory are left alone. Rerunning over a kept work
//! directory skips finished shards and resumes the rest from their
//! checkpoints.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::{ConfigError, LabelerConfig};
use crate::dataset::{Dataset, DatasetError, LabelColumns, OutputSchema};
use crate::merge::{self, MergeError, MergeOptions, MergeStats, ShardOutput};
use crate::orchestrator::{
    self, Orchestrator, OrchestratorError, ShardOutcome, ShardStatus, ShardTask, WorkerCommand,
};
use crate::report::StrategyCounts;
use crate::shard::{self, ShardError, ShardManifest, MANIFEST_FILE};

const SHARDS_DIR: &str = "shards";
const CHECKPOINTS_DIR: &str = "checkpoints";
const LOGS_DIR: &str = "logs";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("output {output} would be removed with the run files in {work_dir}")]
    OutputInWorkDir { output: PathBuf, work_dir: PathBuf },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// One credential per shard.
    pub credentials: Vec<String>,
    pub config: LabelerConfig,
    /// Defaults to `<output dir>/<input stem>_shards`.
    pub work_dir: Option<PathBuf>,
    pub keep_temp: bool,
    pub max_workers: Option<usize>,
    pub worker: WorkerCommand,
    /// Forwarded to workers.
    pub log_json: bool,
}

impl PipelineRequest {
    pub fn work_dir(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) => dir.clone(),
            None => {
                let parent = self
                    .output
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."));
                parent.join(format!("{}_shards", shard::file_stem(&self.input)))
            }
        }
    }
}

/// What happened in one orchestrated run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub shards: Vec<ShardOutcome>,
    /// Shards whose checkpoint rows were merged in place of a final output.
    pub partial_shards: Vec<u32>,
    pub strategies: StrategyCounts,
    pub merge: MergeStats,
    pub output: PathBuf,
    pub review: Option<PathBuf>,
    /// Set when the work directory was kept.
    pub work_dir: Option<PathBuf>,
}

impl PipelineReport {
    pub fn all_succeeded(&self) -> bool {
        self.shards.iter().all(|s| s.status.is_success())
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}", self.run_id)?;
        for shard in &self.shards {
            write!(f, "  shard {:>3}: {}", shard.shard_id.get(), shard.status)?;
            if !shard.status.is_success() {
                write!(f, " (log: {})", shard.log_path.display())?;
            }
            if self.partial_shards.contains(&shard.shard_id.get()) {
                write!(f, " [partial results merged]")?;
            }
            writeln!(f)?;
        }
        let ok = self.shards.iter().filter(|s| s.status.is_success()).count();
        writeln!(f, "shards: {ok}/{} succeeded", self.shards.len())?;
        writeln!(f, "strategies: {} (total {})", self.strategies, self.strategies.total())?;
        writeln!(
            f,
            "merged rows: {} (matched {}, not yet labeled {}, dropped {})",
            self.merge.output_rows,
            self.merge.matched,
            self.merge.unmatched,
            self.merge.dropped_degenerate
        )?;
        writeln!(f, "output: {}", self.output.display())?;
        if let Some(review) = &self.review {
            writeln!(f, "review queue: {}", review.display())?;
        }
        if let Some(dir) = &self.work_dir {
            writeln!(f, "work dir kept: {}", dir.display())?;
        }
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Arguments for the `label` subcommand of one shard.
fn worker_args(manifest: &Path, shard_id: u32, config: &Path, log_json: bool) -> Vec<String> {
    let mut args = vec![
        "label".to_string(),
        "--manifest".to_string(),
        manifest.display().to_string(),
        "--shard".to_string(),
        shard_id.to_string(),
        "--config".to_string(),
        config.display().to_string(),
    ];
    if log_json {
        args.push("--log-json".to_string());
    }
    args
}

/// Run the whole pipeline. `shutdown` resolving stops the workers.
pub async fn run_pipeline<F>(req: PipelineRequest, shutdown: F) -> Result<PipelineReport, PipelineError>
where
    F: Future<Output = ()>,
{
    req.config.validate()?;
    if req.credentials.is_empty() {
        return Err(ConfigError::InvalidShardCount(0).into());
    }

    let dataset = Dataset::read_csv(&req.input)?;
    dataset.validate_columns(&req.config.columns)?;

    let work_dir = req.work_dir();
    if run_artifacts(&work_dir)
        .iter()
        .any(|artifact| req.output.starts_with(artifact))
    {
        return Err(PipelineError::OutputInWorkDir {
            output: req.output.clone(),
            work_dir,
        });
    }
    let shard_dir = work_dir.join(SHARDS_DIR);
    let manifest = shard::split_dataset(
        &dataset,
        &req.input,
        req.credentials.len(),
        &shard_dir,
        &req.config.columns,
    )?;
    if manifest.shards.len() < req.credentials.len() {
        warn!(
            credentials = req.credentials.len(),
            shards = manifest.shards.len(),
            "more credentials than shards; extra credentials unused"
        );
    }

    // Workers share one config; checkpoints live in the work dir so a rerun resumes.
    let mut worker_config = req.config.clone();
    worker_config.checkpoint.dir = work_dir.join(CHECKPOINTS_DIR);
    let config_path = work_dir.join(CONFIG_FILE);
    worker_config.save(&config_path)?;

    let manifest_path = shard_dir.join(MANIFEST_FILE);
    let log_dir = work_dir.join(LOGS_DIR);
    let output_schema = OutputSchema::for_input(dataset.headers());
    let mut tasks = Vec::new();
    let mut outcomes = Vec::new();
    for (entry, credential) in manifest.shards.iter().zip(&req.credentials) {
        let log_path = orchestrator::log_path(&log_dir, entry.shard_id);
        let finished = shard::finished_output(
            &entry.output,
            output_schema.headers(),
            &req.config.columns.id_column,
            &entry.fingerprint,
        );
        if finished.is_some() {
            info!(shard_id = entry.shard_id.get(), "shard already labeled; not relaunching");
            outcomes.push(ShardOutcome {
                shard_id: entry.shard_id,
                status: ShardStatus::Succeeded,
                log_path,
                elapsed_ms: 0,
            });
            continue;
        }
        tasks.push(ShardTask {
            shard_id: entry.shard_id,
            args: worker_args(
                &manifest_path,
                entry.shard_id.get(),
                &config_path,
                req.log_json,
            ),
            credential: credential.clone(),
            log_path,
        });
    }

    info!(
        run_id = %manifest.run_id,
        input = %req.input.display(),
        rows = dataset.len(),
        shards = manifest.shards.len(),
        launching = tasks.len(),
        "starting labeling run"
    );

    if !tasks.is_empty() {
        let mut orch = Orchestrator::new(req.worker.clone());
        if let Some(n) = req.max_workers {
            orch = orch.max_workers(n);
        }
        outcomes.extend(orch.run(tasks, shutdown).await?);
        outcomes.sort_by_key(|o| o.shard_id);
    }

    let checkpoints = CheckpointStore::new(&worker_config.checkpoint.dir);
    let (outputs, partial_shards) = collect_outputs(&manifest, &outcomes, &checkpoints)?;

    let mut strategies = StrategyCounts::default();
    for output in &outputs {
        if let Some(cols) = LabelColumns::locate(output.dataset.headers()) {
            strategies.add(&StrategyCounts::from_rows(&cols, output.dataset.rows()));
        }
    }

    let options = MergeOptions {
        id_column: req.config.columns.id_column.clone(),
        human_review: req.config.human_review,
    };
    let merged = merge::merge_labels(&dataset, &outputs, &options)?;
    let review = merge::write_outcome(&merged, &req.output)?;

    let all_succeeded = outcomes.iter().all(|o| o.status.is_success());
    let kept_dir = if all_succeeded && !req.keep_temp {
        remove_run_artifacts(&work_dir)?;
        None
    } else {
        Some(work_dir)
    };

    Ok(PipelineReport {
        run_id: manifest.run_id,
        shards: outcomes,
        partial_shards,
        strategies,
        merge: merged.stats,
        output: req.output,
        review,
        work_dir: kept_dir,
    })
}

/// Files and directories a run creates inside its work directory.
fn run_artifacts(work_dir: &Path) -> [PathBuf; 4] {
    [
        work_dir.join(SHARDS_DIR),
        work_dir.join(CHECKPOINTS_DIR),
        work_dir.join(LOGS_DIR),
        work_dir.join(CONFIG_FILE),
    ]
}

/// Remove what the run created; the work directory itself only if empty.
fn remove_run_artifacts(work_dir: &Path) -> Result<(), PipelineError> {
    for path in run_artifacts(work_dir) {
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path)(e)),
        }
    }
    if let Err(e) = std::fs::remove_dir(work_dir) {
        debug!(path = %work_dir.display(), error = %e, "work dir not removed");
    }
    Ok(())
}

/// Final output for succeeded shards, checkpoint rows for the others.
fn collect_outputs(
    manifest: &ShardManifest,
    outcomes: &[ShardOutcome],
    checkpoints: &CheckpointStore,
) -> Result<(Vec<ShardOutput>, Vec<u32>), PipelineError> {
    let mut outputs = Vec::new();
    let mut partial = Vec::new();

    for (shard_id, output) in manifest.outputs() {
        let succeeded = outcomes
            .iter()
            .any(|o| o.shard_id == shard_id && o.status.is_success());
        let path = if succeeded && output.exists() {
            output
        } else {
            let results = checkpoints.results_path(shard_id);
            if !results.exists() {
                warn!(shard_id = shard_id.get(), "no results for shard; its records stay unlabeled");
                continue;
            }
            warn!(
                shard_id = shard_id.get(),
                path = %results.display(),
                "merging partial results from checkpoint"
            );
            partial.push(shard_id.get());
            results
        };
        outputs.push(ShardOutput {
            dataset: Dataset::read_csv(&path)?,
            path,
        });
    }
    Ok((outputs, partial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_work_dir_sits_next_to_output() {
        let req = PipelineRequest {
            input: PathBuf::from("/data/comments.csv"),
            output: PathBuf::from("/out/labeled.csv"),
            credentials: vec!["k".into()],
            config: LabelerConfig::default(),
            work_dir: None,
            keep_temp: false,
            max_workers: None,
            worker: WorkerCommand::new("labeler", vec![]),
            log_json: false,
        };
        assert_eq!(req.work_dir(), PathBuf::from("/out/comments_shards"));

        let bare = PipelineRequest {
            output: PathBuf::from("labeled.csv"),
            ..req
        };
        assert_eq!(bare.work_dir(), PathBuf::from("./comments_shards"));
    }

    #[cfg(unix)]
    mod runs {
        use super::*;
        use crate::labels::{ConsensusDecision, Label, Strategy};

        fn write_input(dir: &Path) -> PathBuf {
            let path = dir.join("comments.csv");
            Dataset::new(
                vec!["record_id".into(), "text".into()],
                ["a", "b", "c", "d"]
                    .iter()
                    .map(|id| vec![id.to_string(), format!("text {id}")])
                    .collect(),
            )
            .write_csv(&path)
            .unwrap();
            path
        }

        fn request(dir: &Path, work_dir: PathBuf, output: PathBuf, script: &str) -> PipelineRequest {
            PipelineRequest {
                input: write_input(dir),
                output,
                credentials: vec!["key-a".into(), "key-b".into()],
                config: LabelerConfig::default(),
                work_dir: Some(work_dir),
                keep_temp: false,
                max_workers: None,
                worker: WorkerCommand::new("/bin/sh", vec!["-c".into(), script.into()]),
                log_json: false,
            }
        }

        /// Labeled rows for `ids`, as a worker would write them.
        fn labeled(ids: &[&str]) -> Dataset {
            let schema = OutputSchema::for_input(&["record_id".to_string(), "text".to_string()]);
            let rows = ids
                .iter()
                .map(|id| {
                    let decision = ConsensusDecision {
                        record_id: id.to_string(),
                        final_label: Some(Label::Positive),
                        strategy: Strategy::Agreement,
                        margin: None,
                        score: 0.8,
                    };
                    schema.labeled_row(&[id.to_string(), format!("text {id}")], &decision)
                })
                .collect();
            Dataset::new(schema.headers().to_vec(), rows)
        }

        fn labels(path: &Path) -> Vec<(String, String)> {
            let ds = Dataset::read_csv(path).unwrap();
            let cols = LabelColumns::locate(ds.headers()).unwrap();
            ds.rows()
                .iter()
                .map(|row| (row[0].clone(), cols.read(row).final_label))
                .collect()
        }

        #[tokio::test]
        async fn cleanup_keeps_output_and_unrelated_files_in_work_dir() {
            let dir = tempfile::tempdir().unwrap();
            let work_dir = dir.path().join("out");
            std::fs::create_dir_all(&work_dir).unwrap();
            std::fs::write(work_dir.join("notes.txt"), "mine").unwrap();
            let output = work_dir.join("labeled.csv");

            let req = request(dir.path(), work_dir.clone(), output.clone(), "exit 0");
            let report = run_pipeline(req, std::future::pending()).await.unwrap();

            assert!(report.all_succeeded());
            assert!(report.work_dir.is_none());
            assert!(output.exists());
            assert_eq!(std::fs::read_to_string(work_dir.join("notes.txt")).unwrap(), "mine");
            for artifact in run_artifacts(&work_dir) {
                assert!(!artifact.exists(), "{} left behind", artifact.display());
            }
        }

        #[tokio::test]
        async fn empty_work_dir_is_removed_after_success() {
            let dir = tempfile::tempdir().unwrap();
            let work_dir = dir.path().join("run");
            let req = request(dir.path(), work_dir.clone(), dir.path().join("labeled.csv"), "exit 0");
            run_pipeline(req, std::future::pending()).await.unwrap();
            assert!(!work_dir.exists());
        }

        #[tokio::test]
        async fn output_among_run_files_is_refused() {
            let dir = tempfile::tempdir().unwrap();
            let work_dir = dir.path().join("run");
            let output = work_dir.join("shards").join("labeled.csv");
            let req = request(dir.path(), work_dir.clone(), output, "exit 0");

            let err = run_pipeline(req, std::future::pending()).await.unwrap_err();
            assert!(matches!(err, PipelineError::OutputInWorkDir { .. }));
            assert!(!work_dir.exists());
        }

        #[tokio::test]
        async fn failed_shard_contributes_checkpoint_rows_and_keeps_work_dir() {
            let dir = tempfile::tempdir().unwrap();
            let work_dir = dir.path().join("run");
            let checkpoints = CheckpointStore::new(work_dir.join(CHECKPOINTS_DIR));
            // Shard 1 (rows a, b) got through one record before failing.
            labeled(&["a"])
                .write_csv(&checkpoints.results_path(shard::ShardId(1)))
                .unwrap();
            let output = dir.path().join("labeled.csv");

            let req = request(dir.path(), work_dir.clone(), output.clone(), "exit 1");
            let report = run_pipeline(req, std::future::pending()).await.unwrap();

            assert!(!report.all_succeeded());
            assert_eq!(report.partial_shards, vec![1]);
            assert_eq!(report.work_dir.as_deref(), Some(work_dir.as_path()));
            assert!(work_dir.join(SHARDS_DIR).join(MANIFEST_FILE).exists());
            assert_eq!(report.merge.matched, 1);
            assert_eq!(report.merge.unmatched, 3);
            assert_eq!(report.strategies.agreement, 1);
            assert_eq!(
                labels(&output),
                vec![
                    ("a".to_string(), "positive".to_string()),
                    ("b".to_string(), String::new()),
                    ("c".to_string(), String::new()),
                    ("d".to_string(), String::new()),
                ]
            );
        }

        #[tokio::test]
        async fn rerun_does_not_relaunch_finished_shards() {
            let dir = tempfile::tempdir().unwrap();
            let work_dir = dir.path().join("run");
            let shard_dir = work_dir.join(SHARDS_DIR);
            std::fs::create_dir_all(&shard_dir).unwrap();
            // Shard 1 finished in an earlier run; shard 2 did not.
            labeled(&["a", "b"])
                .write_csv(&shard_dir.join("comments_part1_labeled.csv"))
                .unwrap();
            let launched = dir.path().join("launched.txt");
            // $4 is the shard id after `label --manifest <path> --shard`.
            let script = format!("echo \"$4\" >> {}", launched.display());
            let output = dir.path().join("labeled.csv");

            let req = request(dir.path(), work_dir, output.clone(), &script);
            let report = run_pipeline(req, std::future::pending()).await.unwrap();

            assert_eq!(std::fs::read_to_string(&launched).unwrap().trim(), "2");
            let ids: Vec<u32> = report.shards.iter().map(|s| s.shard_id.get()).collect();
            assert_eq!(ids, vec![1, 2]);
            assert!(report.all_succeeded());
            assert!(report.partial_shards.is_empty());
            assert_eq!(report.merge.matched, 2);
            assert_eq!(labels(&output)[1], ("b".to_string(), "positive".to_string()));
        }
    }

    #[test]
    fn worker_args_select_shard_from_manifest() {
        let args = worker_args(Path::new("w/manifest.json"), 3, Path::new("w/config.json"), true);
        assert_eq!(
            args,
            vec![
                "label",
                "--manifest",
                "w/manifest.json",
                "--shard",
                "3",
                "--config",
                "w/config.json",
                "--log-json"
            ]
        );
    }
}
