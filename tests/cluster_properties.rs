use proptest::prelude::*;
use std::collections::BTreeSet;

use neardup::cluster::resolve_clusters;
use neardup::documents::Document;
use neardup::filter::RemovalFilter;
use neardup::records::{DocRef, DuplicateEdge};

fn edge_strategy() -> impl Strategy<Value = DuplicateEdge> {
    (0u32..4, 0u64..12, 0u32..4, 0u64..12)
        .prop_map(|(sa, ia, sb, ib)| DuplicateEdge::new(DocRef::new(sa, ia), DocRef::new(sb, ib)))
}

proptest! {
    #[test]
    fn removals_do_not_depend_on_edge_order(
        (edges, shuffled) in prop::collection::vec(edge_strategy(), 0..60)
            .prop_flat_map(|edges| (Just(edges.clone()), Just(edges).prop_shuffle()))
    ) {
        prop_assert_eq!(
            resolve_clusters(edges).unwrap().removal_lists(4),
            resolve_clusters(shuffled).unwrap().removal_lists(4)
        );
    }

    #[test]
    fn one_survivor_per_cluster(edges in prop::collection::vec(edge_strategy(), 0..60)) {
        let clustering = resolve_clusters(edges).unwrap();
        let removed: usize = clustering.removal_lists(4).iter().map(|l| l.indices.len()).sum();
        prop_assert_eq!(removed, clustering.num_documents() - clustering.num_clusters());

        for cluster in clustering.clusters() {
            let min = *cluster.iter().min().unwrap();
            for doc in &cluster {
                prop_assert_eq!(clustering.survivor_of(*doc), Some(min));
            }
        }
    }

    #[test]
    fn removal_lists_are_sorted_and_exclude_survivors(edges in prop::collection::vec(edge_strategy(), 0..60)) {
        let clustering = resolve_clusters(edges).unwrap();
        for list in clustering.removal_lists(4) {
            prop_assert!(list.indices.windows(2).all(|w| w[0] < w[1]));
            for &index in &list.indices {
                prop_assert!(clustering.is_duplicate(DocRef::new(list.shard_id, index)));
            }
        }
    }

    #[test]
    fn filter_keeps_exactly_the_unlisted(
        n in 20u64..60,
        removals in prop::collection::btree_set(0u64..20, 0..15)
    ) {
        let docs: Vec<neardup::Result<Document>> =
            (0..n).map(|i| Ok(Document::new(i.to_string(), format!("doc {}", i)))).collect();
        let sorted: Vec<u64> = removals.iter().copied().collect();
        let kept: Vec<u64> = RemovalFilter::new(docs.into_iter(), 0, sorted, Some(n))
            .map(|d| d.unwrap().id.parse::<u64>().unwrap())
            .collect();

        prop_assert_eq!(kept.len() as u64 + removals.len() as u64, n);
        let kept_set: BTreeSet<u64> = kept.iter().copied().collect();
        prop_assert!(kept_set.is_disjoint(&removals));
        prop_assert!(kept.windows(2).all(|w| w[0] < w[1]));
    }
}
