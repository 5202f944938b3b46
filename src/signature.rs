// Signature stage: shard -> banded bucket entries, fanned out to partition files.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::documents::{Document, DocumentSource};
use crate::errors::{Result, Stage};
use crate::minhash::{bucket_key, partition_for, ShingleHasher};
use crate::records::BucketEntry;
use crate::storage::{write_records, WorkDir};

/// Documents are signed in parallel batches of this size.
const SIGNATURE_BATCH: usize = 1024;

/// Completion marker of one shard. `documents` is the replay length the filter stage must see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub shard: u32,
    pub documents: u64,
    pub signed: u64,
    pub skipped_empty: u64,
    pub entries: u64,
}

/// Bucket entries of one shard, one sorted `Vec` per partition.
pub fn compute_shard_entries<I>(
    config: &DedupConfig,
    hasher: &ShingleHasher,
    shard: u32,
    docs: I,
) -> Result<(Vec<Vec<BucketEntry>>, ShardManifest)>
where
    I: Iterator<Item = Result<Document>>,
{
    let mut partitions: Vec<Vec<BucketEntry>> = vec![Vec::new(); config.partition_count];
    let mut manifest = ShardManifest {
        shard,
        ..Default::default()
    };

    let mut batch: Vec<Document> = Vec::with_capacity(SIGNATURE_BATCH);
    let mut docs = docs.peekable();
    while docs.peek().is_some() {
        batch.clear();
        for doc in docs.by_ref().take(SIGNATURE_BATCH) {
            batch.push(doc?);
        }
        let first_index = manifest.documents;
        let signatures: Vec<_> = batch.par_iter().map(|doc| hasher.signature(&doc.text)).collect();

        for (offset, signature) in signatures.into_iter().enumerate() {
            let local_index = first_index + offset as u64;
            let Some(signature) = signature else {
                manifest.skipped_empty += 1;
                continue;
            };
            manifest.signed += 1;
            for (band, values) in signature.bands(config.rows_per_band).enumerate() {
                let key = bucket_key(band, values);
                let partition = partition_for(key, config.partition_count) as usize;
                partitions[partition].push(BucketEntry {
                    bucket_key: key,
                    band: band as u16,
                    band_values: values.to_vec(),
                    shard_id: shard,
                    local_index,
                });
                manifest.entries += 1;
            }
        }
        manifest.documents += batch.len() as u64;
    }

    for entries in partitions.iter_mut() {
        entries.sort_unstable();
    }
    Ok((partitions, manifest))
}

/// Runs one shard end to end: signs, writes every partition file, then marks the shard done.
pub fn run_signature_stage(
    config: &DedupConfig,
    work: &WorkDir,
    source: &dyn DocumentSource,
    shard: u32,
) -> Result<ShardManifest> {
    let start = Instant::now();
    work.clear_marker(Stage::Signature, shard)?;

    let hasher = ShingleHasher::new(config);
    let (partitions, manifest) = compute_shard_entries(config, &hasher, shard, source.open(shard)?)?;

    let fingerprint = config.fingerprint();
    for (partition, entries) in partitions.iter().enumerate() {
        let path = work.signature_file(partition as u32, shard);
        let written = write_records(&path, fingerprint, entries.iter())?;
        debug!(shard, partition, written, "wrote signature partition");
    }
    work.mark_complete(Stage::Signature, shard, &manifest)?;

    info!(
        shard,
        documents = manifest.documents,
        skipped_empty = manifest.skipped_empty,
        entries = manifest.entries,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "signature stage done"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::MemorySource;
    use crate::records::read_all;

    fn small_config() -> DedupConfig {
        DedupConfig {
            shingle_size: 2,
            num_bands: 3,
            rows_per_band: 2,
            partition_count: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_every_signed_document_yields_num_bands_entries() {
        let config = small_config();
        let hasher = ShingleHasher::new(&config);
        let source = MemorySource::from_texts(&[&["alpha beta gamma", "", "delta epsilon", "zeta"]]);
        let (partitions, manifest) =
            compute_shard_entries(&config, &hasher, 0, source.open(0).unwrap()).unwrap();

        assert_eq!(manifest.documents, 4);
        assert_eq!(manifest.signed, 3);
        assert_eq!(manifest.skipped_empty, 1);
        assert_eq!(manifest.entries, 9);

        let all: Vec<&BucketEntry> = partitions.iter().flatten().collect();
        assert_eq!(all.len(), 9);
        for local_index in [0u64, 2, 3] {
            let bands: Vec<u16> = all
                .iter()
                .filter(|e| e.local_index == local_index)
                .map(|e| e.band)
                .collect();
            assert_eq!(bands.len(), 3);
        }
        assert!(all.iter().all(|e| e.local_index != 1));
    }

    #[test]
    fn test_partition_routing_is_by_key() {
        let config = small_config();
        let hasher = ShingleHasher::new(&config);
        let source = MemorySource::from_texts(&[&["one two three four", "five six seven"]]);
        let (partitions, _) = compute_shard_entries(&config, &hasher, 0, source.open(0).unwrap()).unwrap();
        for (p, entries) in partitions.iter().enumerate() {
            for e in entries {
                assert_eq!(partition_for(e.bucket_key, config.partition_count) as usize, p);
            }
            assert!(entries.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_stage_writes_all_partitions_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let work = WorkDir::new(dir.path());
        let config = small_config();
        let source = MemorySource::from_texts(&[&["some text here"], &[]]);

        let manifest = run_signature_stage(&config, &work, &source, 1).unwrap();
        assert_eq!(manifest.documents, 0);
        assert!(work.is_complete(Stage::Signature, 1));
        assert!(!work.is_complete(Stage::Signature, 0));
        for p in 0..4 {
            let entries = read_all::<BucketEntry>(&work.signature_file(p, 1), config.fingerprint()).unwrap();
            assert!(entries.is_empty());
        }
        let stored: ShardManifest = work.read_marker(Stage::Signature, 1).unwrap();
        assert_eq!(stored, manifest);
    }
}
