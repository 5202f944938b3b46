// Bucket match stage: one partition, all shards -> verified duplicate edges.
//
// Each shard's partition file is already sorted, so the partition is consumed as
// a k-way merge and only one bucket group is ever held in memory.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::DedupConfig;
use crate::errors::{DedupError, Result, Stage};
use crate::records::{BucketEntry, DuplicateEdge, RecordReader};
use crate::storage::{write_records, WorkDir};

/// Completion marker of one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub partition: u32,
    pub entries: u64,
    /// Buckets holding two or more entries.
    pub groups: u64,
    /// Entries that shared a bucket key with a different band index or band values.
    pub collisions: u64,
    pub edges: u64,
}

/// Merges several individually sorted entry streams into one sorted stream.
///
/// Each source is labelled with its file; a source that goes backwards is
/// reported as corrupt, since an unsorted file would split bucket groups.
pub struct MergedEntries<I: Iterator<Item = Result<BucketEntry>>> {
    sources: Vec<(PathBuf, I)>,
    heap: BinaryHeap<Reverse<(BucketEntry, usize)>>,
    failed: bool,
}

impl<I: Iterator<Item = Result<BucketEntry>>> MergedEntries<I> {
    pub fn new(sources: Vec<(PathBuf, I)>) -> Result<Self> {
        let mut merged = Self {
            sources,
            heap: BinaryHeap::new(),
            failed: false,
        };
        for i in 0..merged.sources.len() {
            merged.refill(i, None)?;
        }
        Ok(merged)
    }

    /// Pulls the next entry of `source`, which must not sort before `prev`,
    /// the entry that source yielded last.
    fn refill(&mut self, source: usize, prev: Option<&BucketEntry>) -> Result<()> {
        let (path, entries) = &mut self.sources[source];
        if let Some(next) = entries.next() {
            let next = next?;
            if prev.is_some_and(|prev| next < *prev) {
                return Err(DedupError::corrupt(
                    path.as_path(),
                    format!("entries out of order at bucket key {:016x}", next.bucket_key),
                ));
            }
            self.heap.push(Reverse((next, source)));
        }
        Ok(())
    }
}

impl<I: Iterator<Item = Result<BucketEntry>>> Iterator for MergedEntries<I> {
    type Item = Result<BucketEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Reverse((entry, source)) = self.heap.pop()?;
        if let Err(e) = self.refill(source, Some(&entry)) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(entry))
    }
}

/// Consumes a key-sorted entry stream and emits star edges for every verified group.
///
/// Within one bucket key, entries only count as duplicates of each other when
/// their band index and raw band values are equal. Each such run is connected
/// as a star around its smallest reference.
pub fn match_buckets<I>(entries: I, partition: u32) -> Result<(Vec<DuplicateEdge>, PartitionManifest)>
where
    I: Iterator<Item = Result<BucketEntry>>,
{
    let mut manifest = PartitionManifest {
        partition,
        ..Default::default()
    };
    let mut edges = Vec::new();
    let mut group: Vec<BucketEntry> = Vec::new();

    for entry in entries {
        let entry = entry?;
        manifest.entries += 1;
        if group.last().is_some_and(|last| last.bucket_key != entry.bucket_key) {
            resolve_group(&group, &mut edges, &mut manifest);
            group.clear();
        }
        group.push(entry);
    }
    resolve_group(&group, &mut edges, &mut manifest);

    edges.sort_unstable();
    edges.dedup();
    manifest.edges = edges.len() as u64;
    Ok((edges, manifest))
}

fn resolve_group(group: &[BucketEntry], edges: &mut Vec<DuplicateEdge>, manifest: &mut PartitionManifest) {
    if group.len() < 2 {
        return;
    }
    manifest.groups += 1;

    // Sorted input: equal (band, values) runs are contiguous, smallest reference first
    let mut runs = 0u64;
    let mut start = 0;
    while start < group.len() {
        let mut end = start + 1;
        while end < group.len()
            && group[end].band == group[start].band
            && group[end].band_values == group[start].band_values
        {
            end += 1;
        }
        let hub = group[start].doc();
        for member in &group[start + 1..end] {
            let doc = member.doc();
            if doc != hub {
                edges.push(DuplicateEdge::new(hub, doc));
            }
        }
        runs += 1;
        start = end;
    }

    if runs > 1 {
        // Same key, different values: a hash collision, not duplicate evidence
        let collided = group.len() as u64;
        manifest.collisions += collided;
        warn!(
            partition = manifest.partition,
            bucket_key = group[0].bucket_key,
            runs,
            entries = collided,
            "bucket key collision, groups kept apart"
        );
    }
}

/// Runs one partition: requires every shard's signatures, writes the edge file, marks it done.
pub fn run_bucket_stage(
    config: &DedupConfig,
    work: &WorkDir,
    num_shards: u32,
    partition: u32,
) -> Result<PartitionManifest> {
    let start = Instant::now();
    work.require_complete(Stage::Signature, num_shards)?;
    work.clear_marker(Stage::Bucket, partition)?;

    let fingerprint = config.fingerprint();
    let readers = (0..num_shards)
        .map(|shard| {
            let path = work.signature_file(partition, shard);
            RecordReader::<BucketEntry>::open(&path, fingerprint).map(|reader| (path, reader))
        })
        .collect::<Result<Vec<_>>>()?;
    let merged = MergedEntries::new(readers)?;
    let (edges, manifest) = match_buckets(merged, partition).inspect_err(|e| {
        warn!(partition, error = %e, "partition input unreadable, duplicate evidence may be incomplete");
    })?;

    write_records(&work.edge_file(partition), fingerprint, edges.iter())?;
    work.mark_complete(Stage::Bucket, partition, &manifest)?;

    info!(
        partition,
        entries = manifest.entries,
        groups = manifest.groups,
        collisions = manifest.collisions,
        edges = manifest.edges,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "bucket stage done"
    );
    Ok(manifest)
}
