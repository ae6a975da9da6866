//! Shard splitting and the shard manifest.
//!
//! A dataset of `T` rows is cut into `N` contiguous, order-preserving
//! shards. The first `T mod N` shards get one extra row. Shard ids are
//! 1-based and travel with the shard through label and merge via the
//! manifest written next to the shard files.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ColumnConfig, ConfigError};
use crate::dataset::{Dataset, DatasetError};

/// File name of the manifest inside a shard directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// 1-based shard identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous slice `[start, start + len)` of the source rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub id: ShardId,
    pub start: usize,
    pub len: usize,
}

impl ShardRange {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("shard {0} is not in the manifest")]
    UnknownShard(ShardId),
}

/// Plan `requested` shards over `total` rows.
///
/// Fails when `requested < 1`. More shards than rows is clamped to one row
/// per shard with a warning; zero rows yields no shards.
pub fn plan_shards(total: usize, requested: usize) -> Result<Vec<ShardRange>, ConfigError> {
    if requested < 1 {
        return Err(ConfigError::InvalidShardCount(requested));
    }
    let n = if requested > total {
        warn!(
            requested,
            total, "more shards requested than rows; clamping shard count"
        );
        total
    } else {
        requested
    };
    if n == 0 {
        return Ok(Vec::new());
    }

    let base = total / n;
    let extra = total % n;
    let mut start = 0;
    let mut ranges = Vec::with_capacity(n);
    for i in 0..n {
        let len = base + usize::from(i < extra);
        ranges.push(ShardRange {
            id: ShardId(i as u32 + 1),
            start,
            len,
        });
        start += len;
    }
    Ok(ranges)
}

/// blake3 over the record ids of a shard, in order.
pub fn fingerprint_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// A shard output that already covers the whole shard: same columns and the
/// same record ids in the same order. `None` when missing or incomplete.
pub fn finished_output(
    output: &Path,
    headers: &[String],
    id_column: &str,
    fingerprint: &str,
) -> Option<Dataset> {
    if !output.exists() {
        return None;
    }
    let done = match Dataset::read_csv(output) {
        Ok(ds) => ds,
        Err(e) => {
            warn!(path = %output.display(), error = %e, "unreadable shard output; relabeling");
            return None;
        }
    };
    if done.headers() != headers {
        return None;
    }
    let id = done.column(id_column)?;
    let ids = done.rows().iter().map(|row| row.get(id).map_or("", String::as_str));
    (fingerprint_ids(ids) == fingerprint).then_some(done)
}

// =============================================================================
// Manifest
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub shard_id: ShardId,
    pub start: usize,
    pub len: usize,
    pub input: PathBuf,
    pub output: PathBuf,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source: PathBuf,
    pub total_rows: usize,
    pub shards: Vec<ShardEntry>,
}

impl ShardManifest {
    pub fn shard(&self, id: ShardId) -> Result<&ShardEntry, ShardError> {
        self.shards
            .iter()
            .find(|s| s.shard_id == id)
            .ok_or(ShardError::UnknownShard(id))
    }

    /// Shard outputs in ascending shard id order.
    pub fn outputs(&self) -> Vec<(ShardId, PathBuf)> {
        let mut out: Vec<_> = self
            .shards
            .iter()
            .map(|s| (s.shard_id, s.output.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn load(path: &Path) -> Result<Self, ShardError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ShardError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ShardError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ShardError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| ShardError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
        crate::dataset::write_atomically(path, &json).map_err(|source| ShardError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Shard file stem: `data.csv` → `data`.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string())
}

/// Write `<stem>_part<N>.csv` files plus the manifest into `dir`.
pub fn split_dataset(
    dataset: &Dataset,
    source: &Path,
    requested: usize,
    dir: &Path,
    columns: &ColumnConfig,
) -> Result<ShardManifest, ShardError> {
    let records = dataset.records(columns)?;
    let plan = plan_shards(dataset.len(), requested)?;
    std::fs::create_dir_all(dir).map_err(|source| ShardError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let stem = file_stem(source);
    let mut shards = Vec::with_capacity(plan.len());
    for range in &plan {
        let input = dir.join(format!("{stem}_part{}.csv", range.id));
        let output = dir.join(format!("{stem}_part{}_labeled.csv", range.id));
        dataset.slice(range.start..range.end()).write_csv(&input)?;
        let fingerprint = fingerprint_ids(
            records[range.start..range.end()]
                .iter()
                .map(|r| r.record_id.as_str()),
        );
        info!(
            shard_id = range.id.get(),
            start = range.start,
            len = range.len,
            path = %input.display(),
            "wrote shard"
        );
        shards.push(ShardEntry {
            shard_id: range.id,
            start: range.start,
            len: range.len,
            input,
            output,
            fingerprint,
        });
    }

    let manifest = ShardManifest {
        run_id: Uuid::new_v4(),
        created_at: Utc::now(),
        source: source.to_path_buf(),
        total_rows: dataset.len(),
        shards,
    };
    manifest.save(&dir.join(MANIFEST_FILE))?;
    Ok(manifest)
}
