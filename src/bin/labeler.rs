#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use consensus_labeler::checkpoint::CheckpointStore;
use consensus_labeler::classify::Classifier;
use consensus_labeler::config::{self, HumanReviewPolicy, LabelerConfig, CREDENTIAL_ENV};
use consensus_labeler::consensus::ConsensusEngine;
use consensus_labeler::dataset::Dataset;
use consensus_labeler::gateway::{GatewayConfig, ProviderGateway, TallyUsageSink};
use consensus_labeler::logging::init_logging;
use consensus_labeler::merge::{self, MergeOptions};
use consensus_labeler::orchestrator::WorkerCommand;
use consensus_labeler::pipeline::{self, PipelineRequest};
use consensus_labeler::report::DatasetStats;
use consensus_labeler::shard::{self, ShardId, ShardManifest};
use consensus_labeler::worker::{ShardJob, ShardWorker};

#[derive(Parser)]
#[command(name = "labeler", version, about = "Two-tier consensus sentiment labeling")]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log JSON lines instead of plain text
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a dataset into shard files plus a manifest
    Split {
        #[arg(long)]
        input: PathBuf,
        /// Number of shards
        #[arg(long, required_unless_present = "credentials")]
        shards: Option<usize>,
        /// One shard per credential in this file
        #[arg(long, conflicts_with = "shards")]
        credentials: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Label one shard (credential from LABELER_API_KEY or --credential)
    Label {
        /// Manifest written by `split`; selects the shard by --shard
        #[arg(long, requires = "shard", conflicts_with = "input")]
        manifest: Option<PathBuf>,
        #[arg(long)]
        shard: Option<u32>,
        /// Label this file directly instead of a manifest shard
        #[arg(long, required_unless_present = "manifest")]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        /// First row to label (1-based, inclusive)
        #[arg(long)]
        start: Option<usize>,
        /// Last row to label (1-based, inclusive)
        #[arg(long)]
        end: Option<usize>,
        #[arg(long)]
        credential: Option<String>,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Split, label every shard in its own process, and merge
    Orchestrate {
        #[arg(long)]
        input: PathBuf,
        /// One credential per line; one shard per credential
        #[arg(long)]
        credentials: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[command(flatten)]
        run: RunOptions,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Relabel a dataset from another text column (default `text_cleaned`)
    Recheck {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        credentials: PathBuf,
        /// Defaults to `<input stem>_rechecked.csv`
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        run: RunOptions,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Merge shard outputs back onto the original dataset
    Merge {
        #[arg(long)]
        original: PathBuf,
        /// Take shard outputs from this manifest, in shard id order
        #[arg(long, required_unless_present = "outputs")]
        manifest: Option<PathBuf>,
        /// Shard outputs; later files win on duplicate ids
        #[arg(long, num_args = 1.., conflicts_with = "manifest")]
        outputs: Vec<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, value_enum)]
        human_review: Option<HumanReviewPolicy>,
        #[arg(long)]
        id_column: Option<String>,
    },
    /// Label and strategy distribution of a labeled CSV
    Stats {
        #[arg(long)]
        input: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
struct ConfigOverrides {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    fast_model: Option<String>,
    #[arg(long)]
    pro_model: Option<String>,
    /// Fast-tier confidence needed to skip the pro tier
    #[arg(long)]
    conf_fast_accept: Option<f64>,
    #[arg(long)]
    audit_rate: Option<f64>,
    #[arg(long)]
    margin_threshold: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    request_delay_ms: Option<u64>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    id_column: Option<String>,
    #[arg(long)]
    text_column: Option<String>,
    /// Extra column passed to the model as context (repeatable)
    #[arg(long = "context-column")]
    context_columns: Vec<String>,
    #[arg(long, value_enum)]
    human_review: Option<HumanReviewPolicy>,
}

impl ConfigOverrides {
    fn apply(&self, cfg: &mut LabelerConfig) {
        if let Some(v) = self.batch_size {
            cfg.classifier.batch_size = v;
        }
        if let Some(v) = &self.fast_model {
            cfg.classifier.fast_model = v.clone();
        }
        if let Some(v) = &self.pro_model {
            cfg.classifier.pro_model = v.clone();
        }
        if let Some(v) = self.conf_fast_accept {
            cfg.consensus.conf_fast_accept = v;
        }
        if let Some(v) = self.audit_rate {
            cfg.consensus.audit_rate = v;
        }
        if let Some(v) = self.margin_threshold {
            cfg.consensus.margin_threshold = v;
        }
        if self.seed.is_some() {
            cfg.consensus.seed = self.seed;
        }
        if let Some(v) = self.request_delay_ms {
            cfg.classifier.request_delay_ms = v;
        }
        if let Some(v) = &self.checkpoint_dir {
            cfg.checkpoint.dir = v.clone();
        }
        if let Some(v) = &self.id_column {
            cfg.columns.id_column = v.clone();
        }
        if let Some(v) = &self.text_column {
            cfg.columns.text_column = v.clone();
        }
        if !self.context_columns.is_empty() {
            cfg.columns.context_columns = self.context_columns.clone();
        }
        if let Some(v) = self.human_review {
            cfg.human_review = v;
        }
    }
}

#[derive(Args, Debug)]
struct RunOptions {
    /// Keep shard files, checkpoints and logs after a successful run
    #[arg(long)]
    keep_temp: bool,
    /// Upper bound on concurrently running shard processes
    #[arg(long)]
    max_workers: Option<usize>,
    /// Defaults to `<output dir>/<input stem>_shards`
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_json);
    let load_config = |overrides: &ConfigOverrides| -> Result<LabelerConfig, config::ConfigError> {
        let mut cfg = LabelerConfig::load_or_default(cli.config.as_deref())?;
        overrides.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    };

    match &cli.command {
        Commands::Split {
            input,
            shards,
            credentials,
            out_dir,
            overrides,
        } => {
            let cfg = load_config(overrides)?;
            let requested = match (shards, credentials) {
                (Some(n), _) => *n,
                (None, Some(path)) => config::read_credentials(path)?.len(),
                (None, None) => return Err("split requires --shards or --credentials".into()),
            };
            let dataset = Dataset::read_csv(input)?;
            let manifest = shard::split_dataset(&dataset, input, requested, out_dir, &cfg.columns)?;
            for entry in &manifest.shards {
                println!(
                    "shard {}: rows {}..{} -> {}",
                    entry.shard_id,
                    entry.start + 1,
                    entry.start + entry.len,
                    entry.input.display()
                );
            }
            println!("manifest: {}", out_dir.join(shard::MANIFEST_FILE).display());
        }
        Commands::Label {
            manifest,
            shard,
            input,
            output,
            start,
            end,
            credential,
            overrides,
        } => {
            let mut cfg = load_config(overrides)?;
            let job = label_job(
                manifest.as_deref(),
                *shard,
                input.as_deref(),
                output.as_deref(),
                *start,
                *end,
            )?;
            if manifest.is_none() && shard.is_none() {
                cfg.checkpoint.dir = standalone_checkpoint_dir(&cfg.checkpoint.dir, &job.output);
            }
            let credential = match credential {
                Some(key) => key.clone(),
                None => std::env::var(CREDENTIAL_ENV)
                    .map_err(|_| config::ConfigError::MissingCredential)?,
            };
            run_label(job, cfg, &credential).await?;
        }
        Commands::Orchestrate {
            input,
            credentials,
            output,
            run,
            overrides,
        } => {
            let cfg = load_config(overrides)?;
            orchestrate(input, credentials, output.clone(), run, cfg, cli.log_json).await?;
        }
        Commands::Recheck {
            input,
            credentials,
            output,
            run,
            overrides,
        } => {
            let mut cfg = LabelerConfig::load_or_default(cli.config.as_deref())?;
            cfg.columns.text_column = "text_cleaned".to_string();
            overrides.apply(&mut cfg);
            cfg.validate()?;
            let output = output
                .clone()
                .unwrap_or_else(|| merge::recheck_output_path(input));
            orchestrate(input, credentials, output, run, cfg, cli.log_json).await?;
        }
        Commands::Merge {
            original,
            manifest,
            outputs,
            output,
            human_review,
            id_column,
        } => {
            let cfg = LabelerConfig::load_or_default(cli.config.as_deref())?;
            let files: Vec<PathBuf> = match manifest {
                Some(path) => ShardManifest::load(path)?
                    .outputs()
                    .into_iter()
                    .map(|(_, path)| path)
                    .collect(),
                None => outputs.clone(),
            };
            let options = MergeOptions {
                id_column: id_column.clone().unwrap_or(cfg.columns.id_column),
                human_review: human_review.unwrap_or(cfg.human_review),
            };
            let outcome = merge::merge_files(original, &files, &options)?;
            let review = merge::write_outcome(&outcome, output)?;
            println!("{}", serde_json::to_string_pretty(&outcome.stats)?);
            if let Some(path) = review {
                println!("review queue: {}", path.display());
            }
        }
        Commands::Stats { input, json } => {
            let dataset = Dataset::read_csv(input)?;
            let stats = DatasetStats::from_dataset(&dataset, input)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{stats}");
            }
        }
    }

    Ok(())
}

/// Resolve what a `label` invocation should work on.
fn label_job(
    manifest: Option<&Path>,
    shard: Option<u32>,
    input: Option<&Path>,
    output: Option<&Path>,
    start: Option<usize>,
    end: Option<usize>,
) -> Result<ShardJob, Box<dyn std::error::Error>> {
    let rows = match (start, end) {
        (None, None) => None,
        (start, end) => {
            let start = start.unwrap_or(1);
            if start == 0 {
                return Err("--start is 1-based".into());
            }
            let end = end.unwrap_or(usize::MAX);
            if end < start {
                return Err(format!("--end {end} is before --start {start}").into());
            }
            Some(start - 1..end)
        }
    };

    match (manifest, input) {
        (Some(path), _) => {
            let manifest = ShardManifest::load(path)?;
            let shard_id = ShardId(shard.ok_or("--manifest requires --shard")?);
            let entry = manifest.shard(shard_id)?;
            Ok(ShardJob {
                shard_id,
                input: entry.input.clone(),
                output: output.map(Path::to_path_buf).unwrap_or_else(|| entry.output.clone()),
                rows,
                run_id: Some(manifest.run_id),
            })
        }
        (None, Some(input)) => {
            let output = output.ok_or("--input requires --output")?;
            Ok(ShardJob {
                shard_id: ShardId(shard.unwrap_or(1)),
                input: input.to_path_buf(),
                output: output.to_path_buf(),
                rows,
                run_id: None,
            })
        }
        (None, None) => Err("label requires --manifest or --input".into()),
    }
}

/// Checkpoint directory for `label --input` without `--shard`, one per output
/// file so separate direct runs never share `shard_1`.
fn standalone_checkpoint_dir(root: &Path, output: &Path) -> PathBuf {
    let absolute = std::path::absolute(output).unwrap_or_else(|_| output.to_path_buf());
    let hash = blake3::hash(absolute.to_string_lossy().as_bytes()).to_hex();
    root.join(format!("{}-{}", shard::file_stem(output), &hash[..8]))
}

/// Worker entry point. Exits the process with the worker's exit code on failure.
async fn run_label(
    job: ShardJob,
    mut cfg: LabelerConfig,
    credential: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Same seed, different audit draws per shard.
    cfg.consensus.seed = cfg
        .consensus
        .seed
        .map(|seed| seed.wrapping_add(u64::from(job.shard_id.get())));

    let usage = Arc::new(TallyUsageSink::new());
    // The classifier owns retries; the gateway makes one attempt per call.
    let gateway = ProviderGateway::for_credential(
        credential,
        usage.clone(),
        GatewayConfig {
            max_retries: 0,
            ..GatewayConfig::default()
        },
    )?;
    let classifier = Classifier::new(Arc::new(gateway), cfg.classifier.clone())
        .with_attribution(job.run_id, Some(job.shard_id.get()));
    let engine = ConsensusEngine::new(cfg.consensus.clone())?;
    let checkpoints = CheckpointStore::new(&cfg.checkpoint.dir);

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        flag.store(true, Ordering::SeqCst);
    });

    let mut worker = ShardWorker::new(classifier, engine, checkpoints, cfg, cancel).with_usage(usage);
    match worker.run(&job).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            error!(shard_id = job.shard_id.get(), error = %err, "shard failed");
            std::process::exit(err.exit_code());
        }
    }
}

async fn orchestrate(
    input: &Path,
    credentials: &Path,
    output: PathBuf,
    run: &RunOptions,
    cfg: LabelerConfig,
    log_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = PipelineRequest {
        input: input.to_path_buf(),
        output,
        credentials: config::read_credentials(credentials)?,
        config: cfg,
        work_dir: run.work_dir.clone(),
        keep_temp: run.keep_temp,
        max_workers: run.max_workers,
        worker: WorkerCommand::current_exe()?,
        log_json,
    };
    let report = pipeline::run_pipeline(request, shutdown_signal()).await?;
    print!("{report}");

    if report.all_succeeded() {
        info!(run_id = %report.run_id, "all shards succeeded");
        Ok(())
    } else {
        let failed = report
            .shards
            .iter()
            .filter(|s| !s.status.is_success())
            .count();
        Err(format!("{failed} shard(s) did not finish; rerun with the same work dir to resume").into())
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C; stopping");
        },
        _ = terminate => {
            info!("received SIGTERM; stopping");
        },
    }
}
