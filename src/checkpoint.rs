//! Per-shard checkpoints.
//!
//! Each shard owns a `shard_<id>` directory under the checkpoint root with
//! two files: `checkpoint.json` with the resume index and `results.csv`
//! with every output row produced so far. Both are replaced atomically
//! (temp file + rename), results first, so a crash between the two writes
//! leaves a results file that is ahead of the checkpoint, never behind it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::{encode_csv, write_atomically, Dataset, DatasetError};
use crate::shard::ShardId;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encoding error: {0}")]
    Encode(String),
    #[error("shard {shard_id}: checkpoint would move back from {stored} to {requested}")]
    Regression {
        shard_id: ShardId,
        stored: usize,
        requested: usize,
    },
    #[error("shard {shard_id}: {rows} result rows do not match index {index}")]
    RowCountMismatch {
        shard_id: ShardId,
        rows: usize,
        index: usize,
    },
}

impl From<DatasetError> for CheckpointError {
    fn from(err: DatasetError) -> Self {
        CheckpointError::Encode(err.to_string())
    }
}

/// Persisted progress of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub shard_id: ShardId,
    /// Number of shard records fully processed; also the resume index.
    pub last_processed_index: usize,
    /// Unix seconds of the write.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the shard input the index refers to.
    pub fingerprint: String,
}

/// Where a worker picks up, with the rows it already produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resume {
    pub index: usize,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_dir(&self, shard_id: ShardId) -> PathBuf {
        self.dir.join(format!("shard_{shard_id}"))
    }

    pub fn checkpoint_path(&self, shard_id: ShardId) -> PathBuf {
        self.shard_dir(shard_id).join("checkpoint.json")
    }

    pub fn results_path(&self, shard_id: ShardId) -> PathBuf {
        self.shard_dir(shard_id).join("results.csv")
    }

    /// Stored checkpoint, `None` if missing or unreadable.
    pub fn read(&self, shard_id: ShardId) -> Option<Checkpoint> {
        let path = self.checkpoint_path(shard_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(shard_id = shard_id.get(), error = %e, "unreadable checkpoint; ignoring");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(shard_id = shard_id.get(), error = %e, "corrupt checkpoint; ignoring");
                None
            }
        }
    }

    /// Resume index for a shard: 0 when there is no usable checkpoint.
    pub fn load(&self, shard_id: ShardId) -> usize {
        self.read(shard_id)
            .map(|cp| cp.last_processed_index)
            .unwrap_or(0)
    }

    /// Resume point for a shard whose input has `fingerprint` and
    /// `shard_size` records and whose output has `headers`.
    ///
    /// Anything inconsistent (other input, index past the end, missing or
    /// short results, other columns) restarts the shard from 0.
    pub fn resume(
        &self,
        shard_id: ShardId,
        fingerprint: &str,
        shard_size: usize,
        headers: &[String],
    ) -> Resume {
        let Some(cp) = self.read(shard_id) else {
            return Resume::default();
        };
        let restart = |reason: &str| {
            warn!(
                shard_id = shard_id.get(),
                index = cp.last_processed_index,
                reason,
                "discarding checkpoint; starting shard from the beginning"
            );
            Resume::default()
        };

        if cp.fingerprint != fingerprint {
            return restart("shard input changed");
        }
        if cp.last_processed_index > shard_size {
            return restart("index past end of shard");
        }
        if cp.last_processed_index == 0 {
            return Resume::default();
        }

        let results = match Dataset::read_csv(&self.results_path(shard_id)) {
            Ok(ds) => ds,
            Err(_) => return restart("results file missing or unreadable"),
        };
        if results.headers() != headers {
            return restart("results columns differ");
        }
        if results.len() < cp.last_processed_index {
            return restart("results file shorter than checkpoint");
        }

        let mut rows = results.into_rows();
        rows.truncate(cp.last_processed_index);
        debug!(
            shard_id = shard_id.get(),
            index = cp.last_processed_index,
            "resuming from checkpoint"
        );
        Resume {
            index: cp.last_processed_index,
            rows,
        }
    }

    /// Persist `rows` (exactly the first `last_index` outputs) and the index.
    pub fn save(
        &self,
        shard_id: ShardId,
        last_index: usize,
        fingerprint: &str,
        headers: &[String],
        rows: &[Vec<String>],
    ) -> Result<Checkpoint, CheckpointError> {
        if rows.len() != last_index {
            return Err(CheckpointError::RowCountMismatch {
                shard_id,
                rows: rows.len(),
                index: last_index,
            });
        }
        if let Some(stored) = self.read(shard_id) {
            if stored.fingerprint == fingerprint && stored.last_processed_index > last_index {
                return Err(CheckpointError::Regression {
                    shard_id,
                    stored: stored.last_processed_index,
                    requested: last_index,
                });
            }
        }

        let results_path = self.results_path(shard_id);
        let bytes = encode_csv(headers, rows)?;
        write_atomically(&results_path, &bytes).map_err(|source| CheckpointError::Io {
            path: results_path,
            source,
        })?;

        let checkpoint = Checkpoint {
            shard_id,
            last_processed_index: last_index,
            timestamp: Utc::now(),
            fingerprint: fingerprint.to_string(),
        };
        let path = self.checkpoint_path(shard_id);
        let json = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;
        write_atomically(&path, &json).map_err(|source| CheckpointError::Io { path, source })?;
        Ok(checkpoint)
    }

    /// Remove both files of a finished shard, then its directory if empty.
    pub fn clear(&self, shard_id: ShardId) -> Result<(), CheckpointError> {
        for path in [self.checkpoint_path(shard_id), self.results_path(shard_id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CheckpointError::Io { path, source }),
            }
        }
        let _ = std::fs::remove_dir(self.shard_dir(shard_id));
        Ok(())
    }
}
