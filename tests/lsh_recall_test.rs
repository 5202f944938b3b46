// Empirical checks of the banding S-curve: pairs at Jaccard similarity t must
// share a band with probability close to 1 - (1 - t^r)^b.

use neardup::minhash::{collision_probability, estimate_jaccard, ShingleHasher};
use neardup::DedupConfig;

const DOC_TOKENS: usize = 100;
const TRIALS: u64 = 200;

/// Two unigram documents of `DOC_TOKENS` distinct tokens sharing `shared` of them.
fn pair(trial: u64, shared: usize) -> (String, String) {
    let a: Vec<String> = (0..DOC_TOKENS).map(|i| format!("t{}x{}", trial, i)).collect();
    let mut b: Vec<String> = a[..shared].to_vec();
    b.extend((shared..DOC_TOKENS).map(|i| format!("u{}x{}", trial, i)));
    (a.join(" "), b.join(" "))
}

fn jaccard(shared: usize) -> f64 {
    shared as f64 / (2 * DOC_TOKENS - shared) as f64
}

fn hasher(seed: u64, bands: usize, rows: usize) -> ShingleHasher {
    ShingleHasher::new(&DedupConfig {
        shingle_size: 1,
        num_bands: bands,
        rows_per_band: rows,
        hash_seed: seed,
        ..Default::default()
    })
}

fn shares_band(h: &ShingleHasher, a: &str, b: &str, rows: usize) -> bool {
    let (sa, sb) = (h.signature(a).unwrap(), h.signature(b).unwrap());
    let hit = sa.bands(rows).zip(sb.bands(rows)).any(|(x, y)| x == y);
    hit
}

fn empirical_rate(shared: usize, bands: usize, rows: usize) -> f64 {
    let hits = (0..TRIALS)
        .filter(|&trial| {
            let h = hasher(1000 + trial, bands, rows);
            let (a, b) = pair(trial, shared);
            shares_band(&h, &a, &b, rows)
        })
        .count();
    hits as f64 / TRIALS as f64
}

#[test]
fn test_recall_follows_s_curve() {
    let (bands, rows) = (8, 4);
    for shared in [50usize, 67, 82, 90] {
        let t = jaccard(shared);
        let expected = collision_probability(t, rows, bands);
        let observed = empirical_rate(shared, bands, rows);
        assert!(
            observed >= expected - 0.12,
            "t={:.3}: observed {:.3}, expected {:.3}",
            t,
            observed,
            expected
        );
    }
}

#[test]
fn test_dissimilar_pairs_rarely_collide() {
    // t ~= 0.05: expected rate is well under 1%
    let observed = empirical_rate(10, 8, 4);
    assert!(observed <= 0.05, "observed {:.3}", observed);
}

#[test]
fn test_signature_agreement_estimates_jaccard() {
    let h = hasher(3, 32, 8);
    let (a, b) = pair(0, 67);
    let estimate = estimate_jaccard(&h.signature(&a).unwrap(), &h.signature(&b).unwrap());
    assert!((estimate - jaccard(67)).abs() < 0.12, "estimate {:.3}", estimate);
}

#[test]
fn test_signatures_are_deterministic_per_seed() {
    let text = "the same text signed by two independent tasks";
    let (h1, h2) = (hasher(42, 4, 4), hasher(42, 4, 4));
    assert_eq!(h1.signature(text), h2.signature(text));
    assert_ne!(hasher(43, 4, 4).signature(text), h1.signature(text));
}
