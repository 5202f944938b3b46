// Document sources and sinks: the edges of the pipeline.
//
// A shard is one input file. Its documents are its JSON lines, in file order,
// and replaying a shard reopens the file, so the order is identical every time.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::errors::{DedupError, Result, StorageContext};
use crate::storage::AtomicFile;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub text: String,
    /// The full source record; written back as-is by [`JsonlSink`].
    pub metadata: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let text = text.into();
        let metadata = serde_json::json!({ "id": id, "text": text });
        Self { id, text, metadata }
    }
}

pub type DocumentIter = Box<dyn Iterator<Item = Result<Document>> + Send>;

/// Produces each shard as a lazy, ordered, restartable sequence.
pub trait DocumentSource: Sync {
    fn num_shards(&self) -> u32;

    /// Human-readable shard name, used for output file names.
    fn shard_name(&self, shard: u32) -> String {
        format!("{:05}", shard)
    }

    fn open(&self, shard: u32) -> Result<DocumentIter>;
}

pub trait DocumentSink {
    fn write(&mut self, doc: &Document) -> Result<()>;

    /// Publishes everything written; returns the number of documents.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/*=================================================================
=                           JSONL                                 =
=================================================================*/

const SHARD_SUFFIXES: [&str; 3] = [".jsonl", ".jsonl.gz", ".jsonl.zst"];

pub fn expand_dirs(input_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(input_dir).follow_links(true) {
        let entry = entry.map_err(|e| DedupError::Storage {
            path: input_dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if SHARD_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            files.push(entry.into_path());
        }
    }
    // Shard ids are positions in this list
    files.sort();
    Ok(files)
}

pub fn open_compressed(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).at(path)?;
    let reader: Box<dyn BufRead + Send> = match path.extension().and_then(|s| s.to_str()) {
        Some("gz") => Box::new(BufReader::new(GzDecoder::new(file))),
        Some("zst") => Box::new(BufReader::new(ZstdDecoder::new(file).at(path)?)),
        _ => Box::new(BufReader::new(file)),
    };
    Ok(reader)
}

pub fn get_nested_json_val<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = obj;
    for subkey in key.split('.') {
        current = current.get(subkey)?;
    }
    Some(current)
}

/// Strips `.jsonl[.gz|.zst]` from a shard file name.
pub fn shard_stem(path: &Path) -> String {
    let filename = path.file_name().and_then(|s| s.to_str()).unwrap_or("unknown");
    match filename.find(".jsonl") {
        Some(pos) => filename[..pos].to_string(),
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string(),
    }
}

/// Output name of a shard: its path relative to `input_dir`, subdirectories
/// kept, with the `.jsonl[.gz|.zst]` suffix stripped from the file name.
pub fn shard_name_for(input_dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(input_dir).unwrap_or(path);
    let stem = shard_stem(relative);
    match relative.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            let mut parts: Vec<String> = parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            parts.push(stem);
            parts.join("/")
        }
        None => stem,
    }
}

pub struct JsonlSource {
    files: Vec<PathBuf>,
    names: Vec<String>,
    content_key: String,
    id_key: String,
}

impl JsonlSource {
    /// Fails when two shard files would publish to the same output name,
    /// e.g. `x.jsonl` next to `x.jsonl.gz`.
    pub fn new(input_dir: &Path, content_key: &str, id_key: &str) -> Result<Self> {
        let files = expand_dirs(input_dir)?;
        let names: Vec<String> = files.iter().map(|f| shard_name_for(input_dir, f)).collect();
        let mut seen: HashMap<&str, &PathBuf> = HashMap::new();
        for (name, file) in names.iter().zip(files.iter()) {
            if let Some(other) = seen.insert(name.as_str(), file) {
                return Err(DedupError::Config(format!(
                    "shards {:?} and {:?} both map to output name '{}'",
                    other, file, name
                )));
            }
        }
        Ok(Self {
            files,
            names,
            content_key: content_key.to_string(),
            id_key: id_key.to_string(),
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl DocumentSource for JsonlSource {
    fn num_shards(&self) -> u32 {
        self.files.len() as u32
    }

    fn shard_name(&self, shard: u32) -> String {
        self.names
            .get(shard as usize)
            .cloned()
            .unwrap_or_else(|| format!("{:05}", shard))
    }

    fn open(&self, shard: u32) -> Result<DocumentIter> {
        let path = self
            .files
            .get(shard as usize)
            .ok_or_else(|| DedupError::Config(format!("shard {} out of range ({} shards)", shard, self.files.len())))?
            .clone();
        let reader = open_compressed(&path)?;
        Ok(Box::new(JsonlDocuments {
            shard,
            path,
            lines: reader.lines(),
            line_num: 0,
            content_key: self.content_key.clone(),
            id_key: self.id_key.clone(),
        }))
    }
}

struct JsonlDocuments {
    shard: u32,
    path: PathBuf,
    lines: std::io::Lines<Box<dyn BufRead + Send>>,
    line_num: u64,
    content_key: String,
    id_key: String,
}

impl JsonlDocuments {
    fn parse(&self, line: &str) -> Result<Document> {
        let bad = |reason: String| DedupError::Document {
            shard: self.shard,
            line: self.line_num,
            reason,
        };
        let record: Value = serde_json::from_str(line).map_err(|e| bad(e.to_string()))?;
        let text = match get_nested_json_val(&record, &self.content_key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(_) => return Err(bad(format!("value at '{}' is not a string", self.content_key))),
        };
        let id = match get_nested_json_val(&record, &self.id_key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => format!("{}/{}", self.shard, self.line_num),
        };
        Ok(Document {
            id,
            text,
            metadata: record,
        })
    }
}

impl Iterator for JsonlDocuments {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(DedupError::Storage { path: self.path.clone(), source: e })),
            };
            // Blank lines are not documents and do not take an index
            if line.trim().is_empty() {
                continue;
            }
            let doc = self.parse(&line);
            self.line_num += 1;
            return Some(doc);
        }
    }
}

/// Writes documents as JSON lines, optionally gzipped, published on `finish`.
pub struct JsonlSink {
    writer: SinkWriter,
    path: PathBuf,
    count: u64,
}

enum SinkWriter {
    Plain(AtomicFile),
    Gzip(GzEncoder<AtomicFile>),
}

impl SinkWriter {
    fn get_mut(&mut self) -> &mut dyn Write {
        match self {
            SinkWriter::Plain(f) => f,
            SinkWriter::Gzip(gz) => gz,
        }
    }
}

impl JsonlSink {
    pub fn create(output_dir: &Path, stem: &str, compress: bool) -> Result<Self> {
        let name = if compress {
            format!("{}.jsonl.gz", stem)
        } else {
            format!("{}.jsonl", stem)
        };
        let path = output_dir.join(name);
        let file = AtomicFile::create(&path)?;
        let writer = if compress {
            SinkWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            SinkWriter::Plain(file)
        };
        Ok(Self {
            writer,
            path,
            count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentSink for JsonlSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        let line = serde_json::to_vec(&doc.metadata).map_err(|source| DedupError::Manifest {
            path: self.path.clone(),
            source,
        })?;
        let writer = self.writer.get_mut();
        writer.write_all(&line).at(&self.path)?;
        writer.write_all(b"\n").at(&self.path)?;
        self.count += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let JsonlSink { writer, path, count } = *self;
        let file = match writer {
            SinkWriter::Plain(file) => file,
            SinkWriter::Gzip(gz) => gz.finish().at(&path)?,
        };
        file.commit()?;
        Ok(count)
    }
}

/// Collects documents in memory; handy for callers that post-process output.
#[derive(Debug, Default)]
pub struct VecSink {
    pub docs: Vec<Document>,
}

impl DocumentSink for VecSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        self.docs.push(doc.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        Ok(self.docs.len() as u64)
    }
}

/// Shards held in memory, one `Vec` of texts per shard.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub shards: Vec<Vec<Document>>,
}

impl MemorySource {
    pub fn from_texts(shards: &[&[&str]]) -> Self {
        let shards = shards
            .iter()
            .enumerate()
            .map(|(s, texts)| {
                texts
                    .iter()
                    .enumerate()
                    .map(|(i, t)| Document::new(format!("{}/{}", s, i), *t))
                    .collect()
            })
            .collect();
        Self { shards }
    }
}

impl DocumentSource for MemorySource {
    fn num_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    fn open(&self, shard: u32) -> Result<DocumentIter> {
        let docs = self
            .shards
            .get(shard as usize)
            .cloned()
            .ok_or_else(|| DedupError::Config(format!("shard {} out of range", shard)))?;
        Ok(Box::new(docs.into_iter().map(Ok)))
    }
}
