//! Near-duplicate removal over sharded JSONL corpora.
//!
//! MinHash signatures are banded into LSH buckets, bucket collisions become
//! duplicate edges, edges are unioned into clusters, and every cluster keeps
//! exactly one document. Each stage is a set of independent units whose
//! outputs live in a shared work directory; see [`pipeline::Pipeline`].

pub mod buckets;
pub mod cluster;
pub mod config;
pub mod documents;
pub mod errors;
pub mod filter;
pub mod minhash;
pub mod pipeline;
pub mod records;
pub mod signature;
pub mod storage;
pub mod text;

pub use config::{read_config, DedupConfig, Tokenizer};
pub use documents::{Document, DocumentSink, DocumentSource, JsonlSink, JsonlSource};
pub use errors::{DedupError, Result, Stage};
pub use pipeline::Pipeline;
pub use records::DocRef;
