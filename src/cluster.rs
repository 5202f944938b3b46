//! # Cluster stage
//!
//! Fan-in point of the pipeline: every partition's edges are unioned into one
//! disjoint-set forest over the documents that appear in at least one edge.
//! Each connected component keeps its smallest `(shard, index)` reference and
//! every other member goes on its shard's removal list.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::errors::{DedupError, Result, Stage};
use crate::records::{read_all, ClusterAnnotation, DocRef, DuplicateEdge, RemovalList};
use crate::storage::{write_records, WorkDir};

/// The cluster stage is a single unit.
pub const CLUSTER_UNIT: u32 = 0;

/// Dense ids are `u32` with `u32::MAX` reserved as a sentinel, so at most this
/// many distinct documents can appear in edges.
pub const MAX_REFERENCED_DOCUMENTS: usize = u32::MAX as usize;

fn check_dense_capacity(referenced: usize) -> Result<()> {
    if referenced > MAX_REFERENCED_DOCUMENTS {
        return Err(DedupError::Config(format!(
            "{} documents referenced by duplicate edges, cluster stage supports at most {}",
            referenced, MAX_REFERENCED_DOCUMENTS
        )));
    }
    Ok(())
}

/// Disjoint Set Union over dense ids `0..n`.
///
/// Flat `parent`/`rank` arrays; union by rank, find with path halving.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<u32>,
    rank: Vec<u8>,
    components: usize,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
            components: n,
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn components(&self) -> usize {
        self.components
    }

    #[inline]
    pub fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    /// Returns false when `a` and `b` were already connected.
    pub fn union(&mut self, a: u32, b: u32) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (rank_a, rank_b) = (self.rank[ra as usize], self.rank[rb as usize]);
        if rank_a < rank_b {
            self.parent[ra as usize] = rb;
        } else if rank_a > rank_b {
            self.parent[rb as usize] = ra;
        } else {
            self.parent[rb as usize] = ra;
            self.rank[ra as usize] += 1;
        }
        self.components -= 1;
        true
    }
}

/// Connected components over the referenced documents.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Every referenced document, sorted; position = dense id.
    docs: Vec<DocRef>,
    /// Dense id of each document's survivor.
    survivor: Vec<u32>,
    /// Members per survivor id (0 for non-survivors).
    size: Vec<u64>,
}

impl Clustering {
    pub fn num_documents(&self) -> usize {
        self.docs.len()
    }

    pub fn survivor_of(&self, doc: DocRef) -> Option<DocRef> {
        let id = self.docs.binary_search(&doc).ok()?;
        Some(self.docs[self.survivor[id] as usize])
    }

    pub fn is_duplicate(&self, doc: DocRef) -> bool {
        self.survivor_of(doc).is_some_and(|s| s != doc)
    }

    /// Clusters as sorted member lists, ordered by survivor.
    pub fn clusters(&self) -> Vec<Vec<DocRef>> {
        let mut out: Vec<Vec<DocRef>> = Vec::new();
        let mut slot = vec![usize::MAX; self.docs.len()];
        for (id, &s) in self.survivor.iter().enumerate() {
            let s = s as usize;
            if slot[s] == usize::MAX {
                slot[s] = out.len();
                out.push(Vec::new());
            }
            out[slot[s]].push(self.docs[id]);
        }
        out
    }

    pub fn num_clusters(&self) -> usize {
        self.size.iter().filter(|&&n| n > 0).count()
    }

    pub fn largest_cluster(&self) -> u64 {
        self.size.iter().copied().max().unwrap_or(0)
    }

    /// Non-survivor members grouped per shard; indices ascending within a shard.
    pub fn removal_lists(&self, num_shards: u32) -> Vec<RemovalList> {
        let mut lists: Vec<RemovalList> = (0..num_shards)
            .map(|shard_id| RemovalList {
                shard_id,
                indices: Vec::new(),
            })
            .collect();
        for (id, doc) in self.docs.iter().enumerate() {
            if self.survivor[id] as usize != id {
                if let Some(list) = lists.get_mut(doc.shard as usize) {
                    list.indices.push(doc.index);
                }
            }
        }
        lists
    }

    /// Cluster membership per shard for every member of a multi-member cluster.
    pub fn annotations(&self, num_shards: u32) -> Vec<Vec<ClusterAnnotation>> {
        let mut out: Vec<Vec<ClusterAnnotation>> = vec![Vec::new(); num_shards as usize];
        for (id, doc) in self.docs.iter().enumerate() {
            let s = self.survivor[id] as usize;
            let size = self.size[s];
            if size < 2 {
                continue;
            }
            if let Some(shard) = out.get_mut(doc.shard as usize) {
                shard.push(ClusterAnnotation {
                    local_index: doc.index,
                    survivor: self.docs[s],
                    size,
                });
            }
        }
        out
    }
}

/// Union every edge and pick the smallest reference of each component as its survivor.
///
/// Edges are sorted first, and dense ids follow reference order, so the result
/// does not depend on the order the edges arrived in.
pub fn resolve_clusters(mut edges: Vec<DuplicateEdge>) -> Result<Clustering> {
    edges.sort_unstable();
    edges.dedup();

    let mut docs: Vec<DocRef> = Vec::with_capacity(edges.len() * 2);
    for e in &edges {
        docs.push(e.a);
        docs.push(e.b);
    }
    docs.sort_unstable();
    docs.dedup();
    check_dense_capacity(docs.len())?;

    let id_of = |doc: &DocRef| docs.binary_search(doc).unwrap_or_else(|_| unreachable!()) as u32;
    let mut uf = UnionFind::new(docs.len());
    for e in &edges {
        uf.union(id_of(&e.a), id_of(&e.b));
    }

    // Ids ascend in reference order, so the first id seen per root is the minimum
    let n = docs.len();
    let mut root_survivor = vec![u32::MAX; n];
    let mut survivor = vec![0u32; n];
    let mut size = vec![0u64; n];
    for id in 0..n as u32 {
        let root = uf.find(id) as usize;
        if root_survivor[root] == u32::MAX {
            root_survivor[root] = id;
        }
        survivor[id as usize] = root_survivor[root];
        size[root_survivor[root] as usize] += 1;
    }
    debug!(documents = n, components = uf.components(), "resolved clusters");

    Ok(Clustering { docs, survivor, size })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub partitions: u32,
    pub edges: u64,
    pub referenced_documents: u64,
    pub clusters: u64,
    pub largest_cluster: u64,
    pub removed: u64,
}

/// Runs the single cluster unit over every partition's edges.
pub fn run_cluster_stage(config: &DedupConfig, work: &WorkDir, num_shards: u32) -> Result<ClusterSummary> {
    let start = Instant::now();
    let partitions = u32::try_from(config.partition_count)
        .map_err(|_| DedupError::Config("partition_count too large".into()))?;
    work.require_complete(Stage::Bucket, partitions)?;
    work.clear_marker(Stage::Cluster, CLUSTER_UNIT)?;

    let fingerprint = config.fingerprint();
    let mut edges: Vec<DuplicateEdge> = Vec::new();
    for partition in 0..partitions {
        let path = work.edge_file(partition);
        let partition_edges = read_all::<DuplicateEdge>(&path, fingerprint)?;
        // An edge into a shard with no removal list would be flagged but never removed
        if let Some(bad) = partition_edges
            .iter()
            .find(|e| e.a.shard >= num_shards || e.b.shard >= num_shards)
        {
            return Err(DedupError::corrupt(
                &path,
                format!("edge {}-{} references a shard outside 0..{}", bad.a, bad.b, num_shards),
            ));
        }
        edges.extend(partition_edges);
    }
    let edge_count = edges.len() as u64;

    let clustering = resolve_clusters(edges)?;
    let removals = clustering.removal_lists(num_shards);
    let annotations = clustering.annotations(num_shards);

    let mut removed = 0u64;
    for (list, shard_annotations) in removals.iter().zip(annotations.iter()) {
        removed += list.indices.len() as u64;
        write_records(&work.removal_file(list.shard_id), fingerprint, std::iter::once(list))?;
        write_records(&work.cluster_file(list.shard_id), fingerprint, shard_annotations.iter())?;
    }

    let summary = ClusterSummary {
        partitions,
        edges: edge_count,
        referenced_documents: clustering.num_documents() as u64,
        clusters: clustering.num_clusters() as u64,
        largest_cluster: clustering.largest_cluster(),
        removed,
    };
    work.mark_complete(Stage::Cluster, CLUSTER_UNIT, &summary)?;

    info!(
        edges = summary.edges,
        referenced = summary.referenced_documents,
        clusters = summary.clusters,
        largest = summary.largest_cluster,
        removed = summary.removed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "cluster stage done"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(shard: u32, index: u64) -> DocRef {
        DocRef::new(shard, index)
    }

    fn e(a: DocRef, b: DocRef) -> DuplicateEdge {
        DuplicateEdge::new(a, b)
    }

    #[test]
    fn test_union_find_basics() {
        let mut uf = UnionFind::new(5);
        assert!(uf.union(0, 1));
        assert!(uf.union(3, 4));
        assert!(!uf.union(1, 0));
        assert_eq!(uf.components(), 3);
        assert_eq!(uf.find(0), uf.find(1));
        assert_ne!(uf.find(0), uf.find(3));
        assert!(uf.union(1, 4));
        assert_eq!(uf.find(0), uf.find(3));
        assert_eq!(uf.components(), 2);
    }

    #[test]
    fn test_two_triangles_and_isolated_reference() {
        let (a, b, c) = (r(0, 2), r(1, 0), r(0, 7));
        let (x, y, z) = (r(2, 1), r(1, 5), r(2, 0));
        let lone = r(3, 3);
        let edges = vec![e(a, b), e(b, c), e(c, a), e(x, y), e(y, z), e(z, x), e(lone, lone)];

        let clustering = resolve_clusters(edges).unwrap();
        let clusters = clustering.clusters();
        assert_eq!(clusters.len(), 3);
        let multi: Vec<&Vec<DocRef>> = clusters.iter().filter(|c| c.len() > 1).collect();
        assert_eq!(multi.len(), 2);
        assert_eq!(clusters.iter().filter(|c| c.len() == 1).count(), 1);

        assert_eq!(clustering.survivor_of(b), Some(a));
        assert_eq!(clustering.survivor_of(c), Some(a));
        assert_eq!(clustering.survivor_of(x), Some(y));
        assert_eq!(clustering.survivor_of(z), Some(y));
        assert_eq!(clustering.survivor_of(lone), Some(lone));
        assert!(!clustering.is_duplicate(lone));

        let removals = clustering.removal_lists(4);
        assert_eq!(removals[0].indices, vec![7]);
        assert_eq!(removals[1].indices, vec![0]);
        assert_eq!(removals[2].indices, vec![0, 1]);
        assert!(removals[3].indices.is_empty());
    }

    #[test]
    fn test_chain_merges_across_shards() {
        let edges = vec![e(r(3, 0), r(2, 0)), e(r(2, 0), r(1, 0)), e(r(1, 0), r(0, 9))];
        let clustering = resolve_clusters(edges).unwrap();
        assert_eq!(clustering.num_clusters(), 1);
        assert_eq!(clustering.largest_cluster(), 4);
        for doc in [r(1, 0), r(2, 0), r(3, 0)] {
            assert_eq!(clustering.survivor_of(doc), Some(r(0, 9)));
        }
        let annotations = clustering.annotations(4);
        assert_eq!(annotations[0], vec![ClusterAnnotation { local_index: 9, survivor: r(0, 9), size: 4 }]);
    }

    #[test]
    fn test_edge_order_does_not_change_result() {
        let edges = vec![e(r(0, 1), r(0, 5)), e(r(1, 2), r(0, 5)), e(r(1, 9), r(1, 8))];
        let mut reversed = edges.clone();
        reversed.reverse();
        assert_eq!(
            resolve_clusters(edges).unwrap().removal_lists(2),
            resolve_clusters(reversed).unwrap().removal_lists(2)
        );
    }

    #[test]
    fn test_no_edges() {
        let clustering = resolve_clusters(Vec::new()).unwrap();
        assert_eq!(clustering.num_documents(), 0);
        assert_eq!(clustering.num_clusters(), 0);
        let lists = clustering.removal_lists(3);
        assert_eq!(lists.len(), 3);
        assert!(lists.iter().all(|l| l.indices.is_empty()));
    }

    #[test]
    fn test_large_star_is_one_cluster() {
        let hub = r(0, 0);
        let edges: Vec<DuplicateEdge> = (1..10_000u64).map(|i| e(hub, r((i % 5) as u32, i))).collect();
        let clustering = resolve_clusters(edges).unwrap();
        assert_eq!(clustering.num_clusters(), 1);
        let removed: usize = clustering.removal_lists(5).iter().map(|l| l.indices.len()).sum();
        assert_eq!(removed, 9_999);
    }

    #[test]
    fn test_dense_id_capacity() {
        assert!(check_dense_capacity(MAX_REFERENCED_DOCUMENTS).is_ok());
        assert!(matches!(
            check_dense_capacity(MAX_REFERENCED_DOCUMENTS + 1),
            Err(DedupError::Config(_))
        ));
    }

    #[test]
    fn test_edge_into_unknown_shard_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let work = WorkDir::new(dir.path());
        let config = DedupConfig {
            partition_count: 1,
            ..Default::default()
        };
        let edges = [e(r(0, 0), r(5, 3))];
        write_records(&work.edge_file(0), config.fingerprint(), edges.iter()).unwrap();
        work.mark_complete(Stage::Bucket, 0, &serde_json::json!({})).unwrap();

        assert!(matches!(
            run_cluster_stage(&config, &work, 2),
            Err(DedupError::CorruptRecord { .. })
        ));
        assert!(!work.is_complete(Stage::Cluster, CLUSTER_UNIT));
        assert!(!work.removal_file(0).exists());
    }
}
