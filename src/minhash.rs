// MinHash signatures and LSH banding

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::{DedupConfig, Tokenizer};
use crate::text::{clean_text, shingle_hashes, tokenize};

/// Mersenne prime 2^61 - 1, modulus of the universal hash families.
const MERSENNE_PRIME: u64 = (1u64 << 61) - 1;
const MAX_HASH: u64 = u32::MAX as u64;

/// One MinHash signature: H values, `num_bands` bands of `rows_per_band` rows each.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(pub Vec<u32>);

impl Signature {
    pub fn bands(&self, rows_per_band: usize) -> impl Iterator<Item = &[u32]> {
        self.0.chunks_exact(rows_per_band)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Converts document text into a fixed-length MinHash signature.
///
/// Hash family `i` is `h_i(x) = (a_i * x + b_i) mod p`, with `(a_i, b_i)`
/// drawn from a ChaCha20 stream seeded by `hash_seed`, so every task of a run
/// derives the same families from the same config.
#[derive(Debug, Clone)]
pub struct ShingleHasher {
    permutations: Vec<(u64, u64)>,
    shingle_size: usize,
    tokenizer: Tokenizer,
    punctuation_chars: String,
}

impl ShingleHasher {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            permutations: init_permutations(config.hash_seed, config.signature_len()),
            shingle_size: config.shingle_size,
            tokenizer: config.tokenizer,
            punctuation_chars: config.punctuation_chars.clone(),
        }
    }

    pub fn num_hashes(&self) -> usize {
        self.permutations.len()
    }

    /// Signature of `text`, or `None` when the normalized text has no tokens.
    /// Empty documents are never signed, so they cannot be flagged as duplicates.
    pub fn signature(&self, text: &str) -> Option<Signature> {
        let cleaned = clean_text(text, &self.punctuation_chars);
        let tokens = tokenize(&cleaned, self.tokenizer);
        let shingles = shingle_hashes(&tokens, self.shingle_size);
        if shingles.is_empty() {
            return None;
        }
        Some(self.signature_from_shingles(&shingles))
    }

    pub fn signature_from_shingles(&self, shingles: &[u64]) -> Signature {
        let mut hash_vals = vec![MAX_HASH; self.permutations.len()];
        for &shingle in shingles {
            let x = shingle as u128;
            for (slot, &(a, b)) in hash_vals.iter_mut().zip(self.permutations.iter()) {
                let phv = ((a as u128 * x + b as u128) % MERSENNE_PRIME as u128) as u64 & MAX_HASH;
                if phv < *slot {
                    *slot = phv;
                }
            }
        }
        Signature(hash_vals.into_iter().map(|v| v as u32).collect())
    }
}

fn init_permutations(seed: u64, n: usize) -> Vec<(u64, u64)> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let a = rng.gen_range(1..MERSENNE_PRIME);
            let b = rng.gen_range(0..MERSENNE_PRIME);
            (a, b)
        })
        .collect()
}

/// Grouping key for band `band_idx`. Used only to route and group; equality of
/// the raw values is always re-checked.
pub fn bucket_key(band_idx: usize, band_values: &[u32]) -> u64 {
    let mut bytes = Vec::with_capacity(band_values.len() * 4);
    for v in band_values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    xxh3_64_with_seed(&bytes, band_idx as u64)
}

pub fn partition_for(bucket_key: u64, partition_count: usize) -> u32 {
    (bucket_key % partition_count as u64) as u32
}

/// Fraction of positions where two signatures agree; estimates Jaccard similarity.
pub fn estimate_jaccard(a: &Signature, b: &Signature) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let matches = a.0.iter().zip(b.0.iter()).filter(|(x, y)| x == y).count();
    matches as f64 / a.len() as f64
}

/// Probability that two documents with Jaccard similarity `t` share at least one band.
pub fn collision_probability(t: f64, rows_per_band: usize, num_bands: usize) -> f64 {
    1.0 - (1.0 - t.powi(rows_per_band as i32)).powi(num_bands as i32)
}

/// Similarity where the S-curve is steepest, roughly (1/b)^(1/r).
pub fn threshold_estimate(rows_per_band: usize, num_bands: usize) -> f64 {
    (1.0 / num_bands as f64).powf(1.0 / rows_per_band as f64)
}
