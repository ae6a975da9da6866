//! Recombining shard outputs with the original dataset.
//!
//! Shard outputs are read in order into `record_id -> label cells`, so a
//! later output overwrites an earlier one for the same id. The cells are
//! left-joined onto the original rows: ids no shard labeled keep whatever
//! label cells they already had. Rows that ended up neutral with a score of
//! exactly zero carried no signal and are dropped. Human-review rows follow
//! the configured [`HumanReviewPolicy`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::HumanReviewPolicy;
use crate::dataset::{Dataset, DatasetError, LabelCells, LabelColumns};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("{path} has no '{column}' column")]
    MissingIdColumn { path: PathBuf, column: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    pub id_column: String,
    pub human_review: HumanReviewPolicy,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            id_column: "record_id".to_string(),
            human_review: HumanReviewPolicy::Keep,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub shard_files: u64,
    pub shard_rows: u64,
    /// Shard rows replaced by a later row with the same id.
    pub overwritten: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub dropped_degenerate: u64,
    pub human_review_excluded: u64,
    pub human_review_queued: u64,
    pub output_rows: u64,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    /// Rows set aside for review under [`HumanReviewPolicy::Queue`].
    pub review: Option<Dataset>,
    pub stats: MergeStats,
}

/// One shard output to merge, with where it came from for error messages.
#[derive(Debug, Clone)]
pub struct ShardOutput {
    pub path: PathBuf,
    pub dataset: Dataset,
}

/// Merge in-memory shard outputs onto `original`.
pub fn merge_labels(
    original: &Dataset,
    outputs: &[ShardOutput],
    options: &MergeOptions,
) -> Result<MergeOutcome, MergeError> {
    let mut stats = MergeStats::default();

    let mut labels: HashMap<String, LabelCells> = HashMap::new();
    for output in outputs {
        let ds = &output.dataset;
        let id_idx = ds
            .column(&options.id_column)
            .ok_or_else(|| MergeError::MissingIdColumn {
                path: output.path.clone(),
                column: options.id_column.clone(),
            })?;
        let columns = LabelColumns::locate(ds.headers())
            .ok_or_else(|| DatasetError::NotLabeled(output.path.clone()))?;

        stats.shard_files += 1;
        for row in ds.rows() {
            stats.shard_rows += 1;
            if labels
                .insert(row[id_idx].clone(), columns.read(row))
                .is_some()
            {
                stats.overwritten += 1;
            }
        }
    }

    let orig_id = original
        .column(&options.id_column)
        .ok_or_else(|| MergeError::MissingIdColumn {
            path: PathBuf::from("<original>"),
            column: options.id_column.clone(),
        })?;
    let mut headers = original.headers().to_vec();
    let columns = LabelColumns::ensure(&mut headers);

    let mut kept = Vec::with_capacity(original.len());
    let mut review = Vec::new();
    for source in original.rows() {
        let mut row = source.clone();
        row.resize(headers.len(), String::new());

        match labels.get(&row[orig_id]) {
            Some(cells) => {
                stats.matched += 1;
                columns.write(&mut row, cells);
            }
            None => stats.unmatched += 1,
        }

        let cells = columns.read(&row);
        if cells.is_degenerate() {
            stats.dropped_degenerate += 1;
            continue;
        }
        if cells.is_human_review() {
            match options.human_review {
                HumanReviewPolicy::Keep => {}
                HumanReviewPolicy::Exclude => {
                    stats.human_review_excluded += 1;
                    continue;
                }
                HumanReviewPolicy::Queue => {
                    stats.human_review_queued += 1;
                    review.push(row);
                    continue;
                }
            }
        }
        kept.push(row);
    }

    stats.output_rows = kept.len() as u64;
    let review = (options.human_review == HumanReviewPolicy::Queue)
        .then(|| Dataset::new(headers.clone(), review));

    Ok(MergeOutcome {
        dataset: Dataset::new(headers, kept),
        review,
        stats,
    })
}

/// Read the original and shard output files and merge them.
///
/// Outputs are consumed in the given order. A missing output file means the
/// shard has not produced labels yet; it is skipped with a warning.
pub fn merge_files(
    original: &Path,
    outputs: &[PathBuf],
    options: &MergeOptions,
) -> Result<MergeOutcome, MergeError> {
    let base = Dataset::read_csv(original)?;
    let mut loaded = Vec::with_capacity(outputs.len());
    for path in outputs {
        if !path.exists() {
            warn!(path = %path.display(), "shard output missing; treating its records as not yet labeled");
            continue;
        }
        loaded.push(ShardOutput {
            path: path.clone(),
            dataset: Dataset::read_csv(path)?,
        });
    }
    merge_labels(&base, &loaded, options)
}

/// `<dir>/<stem>_review.csv` next to `output`.
pub fn review_path(output: &Path) -> PathBuf {
    sibling(output, "review")
}

/// Default output for a recheck pass over `input`: `<stem>_rechecked.csv`.
pub fn recheck_output_path(input: &Path) -> PathBuf {
    sibling(input, "rechecked")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!("{stem}_{suffix}.csv"))
}

/// Write the merged dataset (and review queue, if any). Returns the review path.
pub fn write_outcome(outcome: &MergeOutcome, output: &Path) -> Result<Option<PathBuf>, MergeError> {
    outcome.dataset.write_csv(output)?;
    let review = match &outcome.review {
        Some(review) => {
            let path = review_path(output);
            review.write_csv(&path)?;
            Some(path)
        }
        None => None,
    };
    info!(
        output = %output.display(),
        rows = outcome.stats.output_rows,
        matched = outcome.stats.matched,
        unmatched = outcome.stats.unmatched,
        dropped = outcome.stats.dropped_degenerate,
        overwritten = outcome.stats.overwritten,
        "merged dataset written"
    );
    Ok(review)
}
