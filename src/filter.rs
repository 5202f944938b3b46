// Filter stage: replay a shard and drop every document on its removal list.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;
use tracing::info;

use crate::config::DedupConfig;
use crate::documents::{Document, DocumentSink, DocumentSource, JsonlSink};
use crate::errors::{DedupError, Result, Stage};
use crate::records::{read_all, ClusterAnnotation, RemovalList};
use crate::signature::ShardManifest;
use crate::storage::WorkDir;

/// One replayed document and whether it survives.
#[derive(Debug, Clone, PartialEq)]
pub enum Replayed {
    Kept(u64, Document),
    Removed(u64, Document),
}

/// Lazy filter over a shard replay.
///
/// Iterating yields the documents whose position is not in `removals` (sorted
/// ascending). When the replay ends the replay length is checked against
/// `expected`, and every removal index must have been reached; a mismatch is
/// yielded as a final `OrderingViolation`, since positions no longer identify
/// the same documents.
pub struct RemovalFilter<I> {
    docs: I,
    shard: u32,
    removals: Vec<u64>,
    cursor: usize,
    position: u64,
    expected: Option<u64>,
    finished: bool,
}

impl<I: Iterator<Item = Result<Document>>> RemovalFilter<I> {
    pub fn new(docs: I, shard: u32, removals: Vec<u64>, expected: Option<u64>) -> Self {
        Self {
            docs,
            shard,
            removals,
            cursor: 0,
            position: 0,
            expected,
            finished: false,
        }
    }

    pub fn removed_count(&self) -> u64 {
        self.cursor as u64
    }

    pub fn replayed_count(&self) -> u64 {
        self.position
    }

    /// Next document of the replay, kept or removed.
    pub fn next_replayed(&mut self) -> Option<Result<Replayed>> {
        if self.finished {
            return None;
        }
        let doc = match self.docs.next() {
            Some(Ok(doc)) => doc,
            Some(Err(e)) => {
                self.finished = true;
                return Some(Err(e));
            }
            None => {
                self.finished = true;
                return self.check_end().err().map(Err);
            }
        };
        let position = self.position;
        self.position += 1;
        if self.removals.get(self.cursor) == Some(&position) {
            self.cursor += 1;
            Some(Ok(Replayed::Removed(position, doc)))
        } else {
            Some(Ok(Replayed::Kept(position, doc)))
        }
    }

    fn check_end(&self) -> Result<()> {
        if let Some(expected) = self.expected {
            if expected != self.position {
                return Err(DedupError::OrderingViolation {
                    shard: self.shard,
                    expected,
                    observed: self.position,
                });
            }
        }
        if let Some(&beyond) = self.removals.get(self.cursor) {
            // A removal past the end of the replay: the shard shrank
            return Err(DedupError::OrderingViolation {
                shard: self.shard,
                expected: beyond + 1,
                observed: self.position,
            });
        }
        Ok(())
    }
}

impl<I: Iterator<Item = Result<Document>>> Iterator for RemovalFilter<I> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_replayed()? {
                Ok(Replayed::Kept(_, doc)) => return Some(Ok(doc)),
                Ok(Replayed::Removed(..)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Completion marker of one filtered shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterManifest {
    pub shard: u32,
    pub input: u64,
    pub kept: u64,
    pub removed: u64,
}

fn annotate(doc: &mut Document, annotation: &ClusterAnnotation) {
    if let Value::Object(map) = &mut doc.metadata {
        map.insert("minhash_cluster_id".to_string(), json!(annotation.survivor.to_string()));
        map.insert("minhash_cluster_size".to_string(), json!(annotation.size));
    }
}

fn load_removals(config: &DedupConfig, work: &WorkDir, shard: u32) -> Result<Vec<u64>> {
    let path = work.removal_file(shard);
    let lists = read_all::<RemovalList>(&path, config.fingerprint())?;
    let removals = match lists.as_slice() {
        [] => Vec::new(),
        [list] if list.shard_id == shard => list.indices.clone(),
        _ => {
            return Err(DedupError::corrupt(
                &path,
                format!("expected a single removal list for shard {}", shard),
            ))
        }
    };
    if removals.windows(2).any(|w| w[0] >= w[1]) {
        return Err(DedupError::corrupt(&path, "removal list is not strictly ascending"));
    }
    Ok(removals)
}

/// Replays `shard` into `sink`, sending dropped documents to `removed_sink` when given.
/// Requires the cluster stage to be complete.
pub fn filter_shard(
    config: &DedupConfig,
    work: &WorkDir,
    source: &dyn DocumentSource,
    shard: u32,
    mut sink: Box<dyn DocumentSink>,
    mut removed_sink: Option<Box<dyn DocumentSink>>,
) -> Result<FilterManifest> {
    work.require_complete(Stage::Cluster, 1)?;
    let signature: ShardManifest = work.read_marker(Stage::Signature, shard)?;
    let removals = load_removals(config, work, shard)?;

    let annotations: HashMap<u64, ClusterAnnotation> = if config.annotate_clusters {
        read_all::<ClusterAnnotation>(&work.cluster_file(shard), config.fingerprint())?
            .into_iter()
            .map(|a| (a.local_index, a))
            .collect()
    } else {
        HashMap::new()
    };

    let mut filter = RemovalFilter::new(source.open(shard)?, shard, removals, Some(signature.documents));
    let mut kept = 0u64;
    while let Some(replayed) = filter.next_replayed() {
        match replayed? {
            Replayed::Kept(position, mut doc) => {
                if let Some(annotation) = annotations.get(&position) {
                    annotate(&mut doc, annotation);
                }
                sink.write(&doc)?;
                kept += 1;
            }
            Replayed::Removed(_, doc) => {
                if let Some(removed_sink) = removed_sink.as_mut() {
                    removed_sink.write(&doc)?;
                }
            }
        }
    }

    // Publish only after the replay passed its ordering checks
    sink.finish()?;
    if let Some(removed_sink) = removed_sink {
        removed_sink.finish()?;
    }

    Ok(FilterManifest {
        shard,
        input: filter.replayed_count(),
        kept,
        removed: filter.removed_count(),
    })
}

/// Runs one shard with the JSONL sinks from the config, then marks it done.
pub fn run_filter_stage(
    config: &DedupConfig,
    work: &WorkDir,
    source: &dyn DocumentSource,
    shard: u32,
) -> Result<FilterManifest> {
    let start = Instant::now();
    config.check_output_dirs()?;
    work.clear_marker(Stage::Filter, shard)?;

    let stem = source.shard_name(shard);
    let sink = Box::new(JsonlSink::create(&config.output_dir, &stem, config.compress_output)?);
    let removed_sink: Option<Box<dyn DocumentSink>> = match &config.removed_output_dir {
        Some(dir) => Some(Box::new(JsonlSink::create(dir, &stem, config.compress_output)?)),
        None => None,
    };

    let manifest = filter_shard(config, work, source, shard, sink, removed_sink)?;
    work.mark_complete(Stage::Filter, shard, &manifest)?;

    info!(
        shard,
        input = manifest.input,
        kept = manifest.kept,
        removed = manifest.removed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "filter stage done"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(n: usize) -> Vec<Result<Document>> {
        (0..n).map(|i| Ok(Document::new(format!("d{}", i), format!("text {}", i)))).collect()
    }

    fn ids(filter: RemovalFilter<std::vec::IntoIter<Result<Document>>>) -> Result<Vec<String>> {
        filter.map(|d| d.map(|d| d.id)).collect()
    }

    #[test]
    fn test_drops_listed_positions() {
        let filter = RemovalFilter::new(docs(5).into_iter(), 0, vec![1, 4], Some(5));
        assert_eq!(ids(filter).unwrap(), vec!["d0", "d2", "d3"]);
    }

    #[test]
    fn test_empty_removal_list_keeps_everything() {
        let filter = RemovalFilter::new(docs(3).into_iter(), 0, vec![], Some(3));
        assert_eq!(ids(filter).unwrap().len(), 3);
    }

    #[test]
    fn test_empty_shard() {
        let filter = RemovalFilter::new(docs(0).into_iter(), 2, vec![], Some(0));
        assert!(ids(filter).unwrap().is_empty());
    }

    #[test]
    fn test_count_mismatch_is_ordering_violation() {
        let filter = RemovalFilter::new(docs(4).into_iter(), 3, vec![0], Some(5));
        match ids(filter) {
            Err(DedupError::OrderingViolation { shard, expected, observed }) => {
                assert_eq!((shard, expected, observed), (3, 5, 4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_removal_past_end_is_ordering_violation() {
        let filter = RemovalFilter::new(docs(3).into_iter(), 0, vec![1, 7], None);
        assert!(matches!(ids(filter), Err(DedupError::OrderingViolation { .. })));
    }

    #[test]
    fn test_replayed_reports_positions() {
        let mut filter = RemovalFilter::new(docs(3).into_iter(), 0, vec![1], Some(3));
        let mut seen = Vec::new();
        while let Some(r) = filter.next_replayed() {
            seen.push(match r.unwrap() {
                Replayed::Kept(p, _) => (p, true),
                Replayed::Removed(p, _) => (p, false),
            });
        }
        assert_eq!(seen, vec![(0, true), (1, false), (2, true)]);
        assert_eq!(filter.removed_count(), 1);
    }
}
