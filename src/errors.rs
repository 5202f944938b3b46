// Error taxonomy for the dedup stages.
//
// Every stage function returns `Result<T>`; the binary wraps these in anyhow at the edge.

use std::fmt;
use std::path::{Path, PathBuf};

pub type Result<T, E = DedupError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Banding/hash parameters are unusable. Raised before any stage runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// A task saw a different config fingerprint than the rest of the run.
    #[error("configuration mismatch in {origin}: run uses fingerprint {expected:016x}, found {found:016x}")]
    ConfigMismatch {
        origin: String,
        expected: u64,
        found: u64,
    },

    /// Malformed intermediate record. Never skipped, since dropping it may drop duplicate evidence.
    #[error("corrupt record in {path:?}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// The replayed shard no longer matches what the signature stage observed.
    #[error("ordering violation in shard {shard}: signature stage saw {expected} documents, replay saw {observed}")]
    OrderingViolation {
        shard: u32,
        expected: u64,
        observed: u64,
    },

    #[error("storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed document in shard {shard}, line {line}: {reason}")]
    Document { shard: u32, line: u64, reason: String },

    #[error("stage {stage} is incomplete, missing units {missing:?}")]
    IncompleteStage { stage: Stage, missing: Vec<u32> },

    #[error("stage {stage} failed for {} unit(s): {}", .failures.len(), format_failures(.failures))]
    StageFailed {
        stage: Stage,
        failures: Vec<(u32, String)>,
    },

    #[error("invalid manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DedupError {
    /// Storage failures are transient; re-running the failing unit is enough.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DedupError::Storage { .. })
    }

    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        DedupError::CorruptRecord {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

fn format_failures(failures: &[(u32, String)]) -> String {
    failures
        .iter()
        .map(|(unit, err)| format!("[{unit}] {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Attach a path to a raw io error.
pub trait StorageContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, std::io::Error> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| DedupError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The four barrier-separated stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Signature,
    Bucket,
    Cluster,
    Filter,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Signature, Stage::Bucket, Stage::Cluster, Stage::Filter];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Signature => "signature",
            Stage::Bucket => "bucket",
            Stage::Cluster => "cluster",
            Stage::Filter => "filter",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_is_retryable() {
        let io = DedupError::Storage {
            path: PathBuf::from("/tmp/x"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        };
        assert!(io.is_retryable());
        assert!(!DedupError::Config("bad".into()).is_retryable());
        assert!(!DedupError::OrderingViolation { shard: 1, expected: 3, observed: 2 }.is_retryable());
    }

    #[test]
    fn test_stage_failed_lists_units() {
        let err = DedupError::StageFailed {
            stage: Stage::Bucket,
            failures: vec![(3, "disk full".into()), (7, "corrupt".into())],
        };
        let msg = err.to_string();
        assert!(msg.contains("bucket"));
        assert!(msg.contains("[3] disk full"));
        assert!(msg.contains("[7] corrupt"));
    }
}
