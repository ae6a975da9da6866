#![forbid(unsafe_code)]

//! # consensus-labeler
//!
//! Sharded, resumable sentiment labeling of CSV datasets with two LLM tiers.
//!
//! Every record is first classified by a cheap fast-tier model. Confident
//! fast answers are accepted, except for a random audit sample; the rest go
//! to a slower pro-tier model and the two opinions are combined by agreement
//! or weighted soft voting. Records the tiers cannot settle are left for
//! human review.
//!
//! Large datasets are split into shards, each labeled by its own worker
//! process with its own credential and checkpoint, and merged back onto the
//! original dataset afterwards.

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod consensus;
pub mod dataset;
pub mod gateway;
pub mod labels;
pub mod logging;
pub mod merge;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod shard;
pub mod worker;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use classify::{Classifier, ClassificationError, Tier};
pub use config::{ConfigError, HumanReviewPolicy, LabelerConfig};
pub use consensus::{weighted_soft_vote, ConsensusEngine, Screening};
pub use dataset::{Dataset, DatasetError, Record};
pub use gateway::{ChatGateway, ProviderGateway, UsageSink};
pub use labels::{ClassificationResult, Confidence, ConsensusDecision, Label, Strategy};
pub use merge::{merge_files, merge_labels, MergeError, MergeOptions};
pub use orchestrator::{Orchestrator, ShardOutcome, ShardStatus, WorkerCommand};
pub use pipeline::{run_pipeline, PipelineError, PipelineReport, PipelineRequest};
pub use shard::{split_dataset, ShardId, ShardManifest};
pub use worker::{ShardJob, ShardReport, ShardWorker, WorkerError};
