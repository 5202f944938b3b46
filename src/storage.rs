//! Local-filesystem intermediate storage.
//!
//! Keys are `(stage, unit)`; each key has exactly one writer. Files are written
//! under a temporary name in the destination directory and renamed into place
//! on success, and a unit's completion marker is written only after all of its
//! outputs are published.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::DedupConfig;
use crate::errors::{DedupError, Result, Stage, StorageContext};
use crate::records::{Record, RecordWriter};

/// Written to `run.json` by the first task of a run and checked by every later one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub fingerprint: u64,
    pub num_shards: u32,
    pub config: DedupConfig,
}

/// A file that becomes visible under its final name only on `commit`.
pub struct AtomicFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    pub fn create(final_path: &Path) -> Result<Self> {
        let dir = final_path
            .parent()
            .ok_or_else(|| DedupError::Config(format!("no parent directory for {:?}", final_path)))?;
        fs::create_dir_all(dir).at(dir)?;
        let name = final_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("out");
        let tmp_path = dir.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4()));
        let file = File::create(&tmp_path).at(&tmp_path)?;
        Ok(Self {
            tmp_path,
            final_path: final_path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Flush, fsync and rename over any previous version. On failure the temp
    /// file is removed, so retries do not accumulate partial files.
    pub fn commit(mut self) -> Result<()> {
        let published = self.publish();
        if published.is_err() {
            let _ = fs::remove_file(&self.tmp_path);
        }
        published
    }

    fn publish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| e.into_error())
                .at(&self.tmp_path)?;
            file.sync_all().at(&self.tmp_path)?;
        }
        fs::rename(&self.tmp_path, &self.final_path).at(&self.final_path)?;
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "file already committed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        // Not committed: discard the partial file
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Layout of one run's intermediate storage.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_manifest_path(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn signature_file(&self, partition: u32, shard: u32) -> PathBuf {
        self.root
            .join("signatures")
            .join(format!("{:05}", partition))
            .join(format!("{:05}.entries", shard))
    }

    pub fn signature_partition_dir(&self, partition: u32) -> PathBuf {
        self.root.join("signatures").join(format!("{:05}", partition))
    }

    pub fn edge_file(&self, partition: u32) -> PathBuf {
        self.root.join("edges").join(format!("{:05}.edges", partition))
    }

    pub fn removal_file(&self, shard: u32) -> PathBuf {
        self.root.join("removals").join(format!("{:05}.remove", shard))
    }

    pub fn cluster_file(&self, shard: u32) -> PathBuf {
        self.root.join("removals").join(format!("{:05}.clusters", shard))
    }

    fn stage_dir(&self, stage: Stage) -> PathBuf {
        match stage {
            Stage::Signature => self.root.join("signatures"),
            Stage::Bucket => self.root.join("edges"),
            Stage::Cluster => self.root.join("removals"),
            Stage::Filter => self.root.join("filter"),
        }
    }

    pub fn marker_path(&self, stage: Stage, unit: u32) -> PathBuf {
        self.stage_dir(stage).join("done").join(format!("{:05}.json", unit))
    }

    pub fn is_complete(&self, stage: Stage, unit: u32) -> bool {
        self.marker_path(stage, unit).is_file()
    }

    /// Removes a unit's marker before it is (re-)run, so a crash mid-retry reads as incomplete.
    pub fn clear_marker(&self, stage: Stage, unit: u32) -> Result<()> {
        let path = self.marker_path(stage, unit);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DedupError::Storage { path, source: e }),
        }
    }

    pub fn mark_complete<M: Serialize>(&self, stage: Stage, unit: u32, manifest: &M) -> Result<()> {
        let path = self.marker_path(stage, unit);
        write_json_atomic(&path, manifest)
    }

    pub fn read_marker<M: DeserializeOwned>(&self, stage: Stage, unit: u32) -> Result<M> {
        read_json(&self.marker_path(stage, unit))
    }

    pub fn missing_units(&self, stage: Stage, num_units: u32) -> Vec<u32> {
        (0..num_units).filter(|&u| !self.is_complete(stage, u)).collect()
    }

    /// The barrier: a stage may only read from `stage` once all of its units are marked done.
    pub fn require_complete(&self, stage: Stage, num_units: u32) -> Result<()> {
        let missing = self.missing_units(stage, num_units);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DedupError::IncompleteStage { stage, missing })
        }
    }

    /// Creates `run.json` on first use; afterwards the stored fingerprint and
    /// shard count must match the caller's.
    pub fn open_run(&self, config: &DedupConfig, num_shards: u32) -> Result<RunManifest> {
        let manifest = RunManifest {
            fingerprint: config.fingerprint(),
            num_shards,
            config: config.clone(),
        };
        let path = self.run_manifest_path();
        if !path.is_file() {
            write_json_atomic(&path, &manifest)?;
        }
        // Re-read even after writing: a concurrent first task may have won the rename
        let stored: RunManifest = read_json(&path)?;
        if stored.fingerprint != manifest.fingerprint {
            return Err(DedupError::ConfigMismatch {
                origin: path.display().to_string(),
                expected: stored.fingerprint,
                found: manifest.fingerprint,
            });
        }
        if stored.num_shards != num_shards {
            return Err(DedupError::Config(format!(
                "work dir {:?} was started with {} shards, input now has {}",
                self.root, stored.num_shards, num_shards
            )));
        }
        Ok(stored)
    }

    pub fn load_run(&self) -> Result<RunManifest> {
        read_json(&self.run_manifest_path())
    }
}

/// Writes a complete record file atomically.
pub fn write_records<'a, T, I>(path: &Path, fingerprint: u64, records: I) -> Result<u64>
where
    T: Record + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let file = AtomicFile::create(path)?;
    let mut writer = RecordWriter::<_, T>::new(file, fingerprint).at(path)?;
    let mut count = 0u64;
    for record in records {
        writer.write(record).at(path)?;
        count += 1;
    }
    let file = writer.finish().at(path)?;
    file.commit()?;
    Ok(count)
}

pub fn write_json_atomic<M: Serialize>(path: &Path, value: &M) -> Result<()> {
    let mut file = AtomicFile::create(path)?;
    serde_json::to_writer_pretty(&mut file, value).map_err(|source| DedupError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    file.commit()
}

pub fn read_json<M: DeserializeOwned>(path: &Path) -> Result<M> {
    let bytes = fs::read(path).at(path)?;
    serde_json::from_slice(&bytes).map_err(|source| DedupError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}
