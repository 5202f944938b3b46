#![allow(dead_code)]

use anyhow::Result;
use flate2::read::GzDecoder;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use neardup::pipeline::StageReport;
use neardup::{DedupConfig, JsonlSource, Pipeline};

pub struct TestEnvironment {
    _temp_dir: TempDir, // Prefixed with _ to indicate it's kept for Drop cleanup
    pub input_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub removed_dir: PathBuf,
    pub config_path: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let work_dir = temp_dir.path().join("work");
        let output_dir = temp_dir.path().join("output");
        let removed_dir = temp_dir.path().join("removed");
        let config_path = temp_dir.path().join("config.yaml");

        fs::create_dir_all(&input_dir)?;

        Ok(TestEnvironment {
            _temp_dir: temp_dir,
            input_dir,
            work_dir,
            output_dir,
            removed_dir,
            config_path,
        })
    }

    /// Small signatures (2 bands x 2 rows, bigram shingles) over 3 partitions.
    pub fn config(&self) -> DedupConfig {
        DedupConfig {
            shingle_size: 2,
            num_bands: 2,
            rows_per_band: 2,
            partition_count: 3,
            hash_seed: 7,
            input_dir: self.input_dir.clone(),
            work_dir: self.work_dir.clone(),
            output_dir: self.output_dir.clone(),
            worker_threads: 2,
            ..Default::default()
        }
    }

    pub fn write_config(&self, config: &DedupConfig) -> Result<PathBuf> {
        let yaml = serde_yaml::to_string(config)?;
        fs::write(&self.config_path, yaml)?;
        Ok(self.config_path.clone())
    }

    /// Writes `<name>.jsonl` (`name` may contain subdirectories) with one `{"id", "text"}` record per pair.
    pub fn write_shard(&self, name: &str, docs: &[(&str, &str)]) -> Result<PathBuf> {
        let path = self.input_dir.join(format!("{}.jsonl", name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        for (id, text) in docs {
            writeln!(file, "{}", json!({"id": id, "text": text}))?;
        }
        Ok(path)
    }

    pub fn append_to_shard(&self, name: &str, id: &str, text: &str) -> Result<()> {
        let path = self.input_dir.join(format!("{}.jsonl", name));
        let mut file = fs::OpenOptions::new().append(true).open(path)?;
        writeln!(file, "{}", json!({"id": id, "text": text}))?;
        Ok(())
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", name))
    }

    pub fn output_ids(&self, name: &str) -> Result<Vec<String>> {
        ids(&read_jsonl(&self.output_path(name))?)
    }

    pub fn removed_ids(&self, name: &str) -> Result<Vec<String>> {
        ids(&read_jsonl(&self.removed_dir.join(format!("{}.jsonl", name)))?)
    }
}

/// Builds a fresh source over `config.input_dir` and runs every stage.
pub fn run_pipeline(config: &DedupConfig, resume: bool) -> neardup::Result<Vec<StageReport>> {
    let source = JsonlSource::new(&config.input_dir, &config.content_key, &config.id_key)?;
    Pipeline::new(config, &source)?.resume(resume).run()
}

/// Reads a `.jsonl` or `.jsonl.gz` file, skipping blank lines.
pub fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut records = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}

pub fn ids(records: &[Value]) -> Result<Vec<String>> {
    records
        .iter()
        .map(|r| {
            r.get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("record without id: {}", r))
        })
        .collect()
}
