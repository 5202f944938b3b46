//! Binary format of the intermediate files exchanged between stages.
//!
//! Every file is `magic | version | fingerprint`, then a sequence of records each
//! prefixed by [`TAG_RECORD`], then [`TAG_END`] and the record count. A file that
//! stops before its trailer is corrupt, which is what a reader sees if a writer
//! died mid-file and its temp file was published by hand.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{DedupError, Result, StorageContext};

const FORMAT_VERSION: u16 = 1;
const TAG_RECORD: u8 = 1;
const TAG_END: u8 = 0;

/// A document's position in the corpus. Ordered by shard, then index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocRef {
    pub shard: u32,
    pub index: u64,
}

impl DocRef {
    pub fn new(shard: u32, index: u64) -> Self {
        Self { shard, index }
    }
}

impl std::fmt::Display for DocRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.shard, self.index)
    }
}

/// One band of one document, routed to a bucket partition.
///
/// Field order gives the sort order used inside each partition file: entries of
/// one bucket are adjacent, and within a bucket equal band values are adjacent
/// with the smallest reference first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BucketEntry {
    pub bucket_key: u64,
    pub band: u16,
    pub band_values: Vec<u32>,
    pub shard_id: u32,
    pub local_index: u64,
}

impl BucketEntry {
    pub fn doc(&self) -> DocRef {
        DocRef::new(self.shard_id, self.local_index)
    }
}

/// Undirected edge, stored with `a < b` (self-edges allowed, `a == b`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DuplicateEdge {
    pub a: DocRef,
    pub b: DocRef,
}

impl DuplicateEdge {
    pub fn new(x: DocRef, y: DocRef) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemovalList {
    pub shard_id: u32,
    pub indices: Vec<u64>,
}

/// Cluster membership of one document, for annotating kept survivors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterAnnotation {
    pub local_index: u64,
    pub survivor: DocRef,
    pub size: u64,
}

/*=================================================================
=                           CODEC                                 =
=================================================================*/

pub trait Record: Sized {
    const MAGIC: [u8; 8];
    fn encode(&self, out: &mut Vec<u8>);
    fn decode<R: Read>(input: &mut R) -> io::Result<Self>;
}

fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn encode_ref(doc: &DocRef, out: &mut Vec<u8>) {
    out.extend_from_slice(&doc.shard.to_le_bytes());
    out.extend_from_slice(&doc.index.to_le_bytes());
}

fn decode_ref<R: Read>(input: &mut R) -> io::Result<DocRef> {
    Ok(DocRef::new(read_u32(input)?, read_u64(input)?))
}

impl Record for BucketEntry {
    const MAGIC: [u8; 8] = *b"NDUPBKT\0";

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bucket_key.to_le_bytes());
        out.extend_from_slice(&self.band.to_le_bytes());
        out.extend_from_slice(&self.shard_id.to_le_bytes());
        out.extend_from_slice(&self.local_index.to_le_bytes());
        out.extend_from_slice(&(self.band_values.len() as u16).to_le_bytes());
        for v in &self.band_values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn decode<R: Read>(input: &mut R) -> io::Result<Self> {
        let bucket_key = read_u64(input)?;
        let band = read_u16(input)?;
        let shard_id = read_u32(input)?;
        let local_index = read_u64(input)?;
        let n = read_u16(input)? as usize;
        let mut band_values = Vec::with_capacity(n);
        for _ in 0..n {
            band_values.push(read_u32(input)?);
        }
        Ok(Self {
            bucket_key,
            band,
            band_values,
            shard_id,
            local_index,
        })
    }
}

impl Record for DuplicateEdge {
    const MAGIC: [u8; 8] = *b"NDUPEDG\0";

    fn encode(&self, out: &mut Vec<u8>) {
        encode_ref(&self.a, out);
        encode_ref(&self.b, out);
    }

    fn decode<R: Read>(input: &mut R) -> io::Result<Self> {
        let a = decode_ref(input)?;
        let b = decode_ref(input)?;
        Ok(Self { a, b })
    }
}

impl Record for RemovalList {
    const MAGIC: [u8; 8] = *b"NDUPRMV\0";

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.shard_id.to_le_bytes());
        out.extend_from_slice(&(self.indices.len() as u64).to_le_bytes());
        for idx in &self.indices {
            out.extend_from_slice(&idx.to_le_bytes());
        }
    }

    fn decode<R: Read>(input: &mut R) -> io::Result<Self> {
        let shard_id = read_u32(input)?;
        let n = read_u64(input)?;
        let mut indices = Vec::new();
        for _ in 0..n {
            indices.push(read_u64(input)?);
        }
        Ok(Self { shard_id, indices })
    }
}

impl Record for ClusterAnnotation {
    const MAGIC: [u8; 8] = *b"NDUPCLS\0";

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.local_index.to_le_bytes());
        encode_ref(&self.survivor, out);
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    fn decode<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            local_index: read_u64(input)?,
            survivor: decode_ref(input)?,
            size: read_u64(input)?,
        })
    }
}

/// Streams records of one kind into any writer.
pub struct RecordWriter<W: Write, T: Record> {
    inner: BufWriter<W>,
    buf: Vec<u8>,
    count: u64,
    _kind: std::marker::PhantomData<T>,
}

impl<W: Write, T: Record> RecordWriter<W, T> {
    pub fn new(inner: W, fingerprint: u64) -> io::Result<Self> {
        let mut inner = BufWriter::new(inner);
        inner.write_all(&T::MAGIC)?;
        inner.write_all(&FORMAT_VERSION.to_le_bytes())?;
        inner.write_all(&fingerprint.to_le_bytes())?;
        Ok(Self {
            inner,
            buf: Vec::with_capacity(64),
            count: 0,
            _kind: std::marker::PhantomData,
        })
    }

    pub fn write(&mut self, record: &T) -> io::Result<()> {
        self.buf.clear();
        self.buf.push(TAG_RECORD);
        record.encode(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        self.count += 1;
        Ok(())
    }

    /// Writes the trailer and hands back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(&[TAG_END])?;
        self.inner.write_all(&self.count.to_le_bytes())?;
        self.inner.into_inner().map_err(|e| e.into_error())
    }
}

/// Iterates the records of one intermediate file, validating framing as it goes.
pub struct RecordReader<T: Record> {
    path: PathBuf,
    input: BufReader<std::fs::File>,
    seen: u64,
    done: bool,
    _kind: std::marker::PhantomData<T>,
}

impl<T: Record> RecordReader<T> {
    pub fn open(path: &Path, expected_fingerprint: u64) -> Result<Self> {
        let file = std::fs::File::open(path).at(path)?;
        let mut input = BufReader::new(file);

        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|_| DedupError::corrupt(path, "truncated header"))?;
        if magic != T::MAGIC {
            return Err(DedupError::corrupt(path, format!("bad magic {:?}", magic)));
        }
        let version = read_u16(&mut input).map_err(|_| DedupError::corrupt(path, "truncated header"))?;
        if version != FORMAT_VERSION {
            return Err(DedupError::corrupt(path, format!("unsupported format version {}", version)));
        }
        let fingerprint = read_u64(&mut input).map_err(|_| DedupError::corrupt(path, "truncated header"))?;
        if fingerprint != expected_fingerprint {
            return Err(DedupError::ConfigMismatch {
                origin: path.display().to_string(),
                expected: expected_fingerprint,
                found: fingerprint,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            input,
            seen: 0,
            done: false,
            _kind: std::marker::PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_next(&mut self) -> Result<Option<T>> {
        let mut tag = [0u8; 1];
        if self.input.read_exact(&mut tag).is_err() {
            return Err(DedupError::corrupt(&self.path, "missing trailer"));
        }
        match tag[0] {
            TAG_RECORD => {
                let record = T::decode(&mut self.input).map_err(|e| {
                    DedupError::corrupt(&self.path, format!("truncated record #{}: {}", self.seen, e))
                })?;
                self.seen += 1;
                Ok(Some(record))
            }
            TAG_END => {
                let count = read_u64(&mut self.input)
                    .map_err(|_| DedupError::corrupt(&self.path, "truncated trailer"))?;
                if count != self.seen {
                    return Err(DedupError::corrupt(
                        &self.path,
                        format!("trailer says {} records, read {}", count, self.seen),
                    ));
                }
                let trailing = self.input.fill_buf().at(&self.path)?;
                if !trailing.is_empty() {
                    return Err(DedupError::corrupt(&self.path, "bytes after trailer"));
                }
                Ok(None)
            }
            other => Err(DedupError::corrupt(&self.path, format!("bad record tag {}", other))),
        }
    }
}

impl<T: Record> Iterator for RecordReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads a whole file into memory.
pub fn read_all<T: Record>(path: &Path, fingerprint: u64) -> Result<Vec<T>> {
    RecordReader::<T>::open(path, fingerprint)?.collect()
}
