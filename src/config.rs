use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::{DedupError, Result, StorageContext};

/*=================================================================
=                             CONFIG                              =
=================================================================*/

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    // Minhash parameters
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
    #[serde(default = "default_num_bands")]
    pub num_bands: usize,
    #[serde(default = "default_rows_per_band")]
    pub rows_per_band: usize,
    #[serde(default)]
    pub num_hash_functions: Option<usize>,
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,
    #[serde(default = "default_hash_seed")]
    pub hash_seed: u64,

    // Text processing options
    #[serde(default)]
    pub tokenizer: Tokenizer,
    #[serde(default = "default_punctuation_chars")]
    pub punctuation_chars: String,

    // Data configuration
    #[serde(default = "default_content_key")]
    pub content_key: String,
    #[serde(default = "default_id_key")]
    pub id_key: String,

    // Directory paths
    #[serde(default)]
    pub input_dir: PathBuf,
    #[serde(default)]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub removed_output_dir: Option<PathBuf>,

    // Output options
    #[serde(default)]
    pub compress_output: bool,
    #[serde(default)]
    pub annotate_clusters: bool,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tokenizer {
    /// Unicode word segmentation.
    #[default]
    Word,
    /// One token per non-whitespace character.
    Char,
}

fn default_shingle_size() -> usize {
    5
}

fn default_num_bands() -> usize {
    14
}

fn default_rows_per_band() -> usize {
    8
}

fn default_partition_count() -> usize {
    16
}

fn default_hash_seed() -> u64 {
    1
}

fn default_punctuation_chars() -> String {
    "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~".to_string()
}

fn default_content_key() -> String {
    "text".to_string()
}

fn default_id_key() -> String {
    "id".to_string()
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shingle_size: default_shingle_size(),
            num_bands: default_num_bands(),
            rows_per_band: default_rows_per_band(),
            num_hash_functions: None,
            partition_count: default_partition_count(),
            hash_seed: default_hash_seed(),
            tokenizer: Tokenizer::default(),
            punctuation_chars: default_punctuation_chars(),
            content_key: default_content_key(),
            id_key: default_id_key(),
            input_dir: PathBuf::new(),
            work_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            removed_output_dir: None,
            compress_output: false,
            annotate_clusters: false,
            worker_threads: default_worker_threads(),
        }
    }
}

impl DedupConfig {
    /// H = num_bands * rows_per_band.
    pub fn signature_len(&self) -> usize {
        self.num_bands * self.rows_per_band
    }

    pub fn validate(&self) -> Result<()> {
        if self.shingle_size == 0 {
            return Err(DedupError::Config("shingle_size must be >= 1".into()));
        }
        if self.num_bands == 0 || self.rows_per_band == 0 {
            return Err(DedupError::Config("num_bands and rows_per_band must be >= 1".into()));
        }
        if self.num_bands > u16::MAX as usize || self.rows_per_band > u16::MAX as usize {
            return Err(DedupError::Config(format!(
                "num_bands ({}) and rows_per_band ({}) must fit in 16 bits",
                self.num_bands, self.rows_per_band
            )));
        }
        if let Some(h) = self.num_hash_functions {
            if h != self.signature_len() {
                return Err(DedupError::Config(format!(
                    "num_hash_functions ({}) must equal num_bands ({}) * rows_per_band ({})",
                    h, self.num_bands, self.rows_per_band
                )));
            }
        }
        if self.partition_count == 0 || self.partition_count > u32::MAX as usize {
            return Err(DedupError::Config("partition_count must be in 1..=u32::MAX".into()));
        }
        Ok(())
    }

    /// Fields that change hashing, banding or routing. Paths and output options are excluded,
    /// so relocating a run does not invalidate its intermediate files.
    pub fn fingerprint(&self) -> u64 {
        let canonical = json!({
            "shingle_size": self.shingle_size,
            "num_bands": self.num_bands,
            "rows_per_band": self.rows_per_band,
            "partition_count": self.partition_count,
            "hash_seed": self.hash_seed,
            "tokenizer": self.tokenizer,
            "punctuation_chars": self.punctuation_chars,
            "content_key": self.content_key,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }

    /// Directory paths are only needed by the file-backed runner.
    pub fn require_paths(&self) -> Result<()> {
        for (name, path) in [
            ("input_dir", &self.input_dir),
            ("work_dir", &self.work_dir),
            ("output_dir", &self.output_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(DedupError::Config(format!("{name} is required")));
            }
        }
        self.check_output_dirs()
    }

    /// Kept and removed documents must land in distinct directories, and neither
    /// may sit inside `input_dir`, where outputs would be picked up as new shards.
    pub fn check_output_dirs(&self) -> Result<()> {
        let mut outputs = vec![("output_dir", &self.output_dir)];
        if let Some(removed) = &self.removed_output_dir {
            if removed == &self.output_dir {
                return Err(DedupError::Config(format!(
                    "removed_output_dir and output_dir are both {:?}",
                    removed
                )));
            }
            outputs.push(("removed_output_dir", removed));
        }
        if self.input_dir.as_os_str().is_empty() {
            return Ok(());
        }
        for (name, dir) in outputs {
            if !dir.as_os_str().is_empty() && dir.starts_with(&self.input_dir) {
                return Err(DedupError::Config(format!(
                    "{name} {:?} is inside input_dir {:?}",
                    dir, self.input_dir
                )));
            }
        }
        Ok(())
    }
}

pub fn read_config(config_path: &Path) -> Result<DedupConfig> {
    let contents = std::fs::read_to_string(config_path).at(config_path)?;
    let config: DedupConfig = serde_yaml::from_str(&contents)
        .map_err(|e| DedupError::Config(format!("{}: {}", config_path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
