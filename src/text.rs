// Text normalization and shingling shared by every signature computation.

use regex::Regex;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::Tokenizer;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

pub fn clean_text(text: &str, punctuation_chars: &str) -> String {
    // Lowercase, drop punctuation, collapse whitespace runs, trim
    let mut text = text.to_lowercase();
    text.retain(|c| !punctuation_chars.contains(c));
    let text = whitespace_re().replace_all(&text, " ");
    text.trim().to_string()
}

pub fn tokenize<'a>(cleaned: &'a str, tokenizer: Tokenizer) -> Vec<&'a str> {
    match tokenizer {
        Tokenizer::Word => cleaned.unicode_words().collect(),
        Tokenizer::Char => cleaned
            .grapheme_indices(true)
            .map(|(_, g)| g)
            .filter(|g| !g.trim().is_empty())
            .collect(),
    }
}

/// Hashes of the distinct k-token shingles, sorted.
///
/// Fewer than `shingle_size` tokens still yields one shingle (all tokens);
/// zero tokens yields none.
pub fn shingle_hashes(tokens: &[&str], shingle_size: usize) -> Vec<u64> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let window = shingle_size.max(1).min(tokens.len());
    let mut buf: Vec<u8> = Vec::new();
    let mut hashes: Vec<u64> = tokens
        .windows(window)
        .map(|gram| {
            buf.clear();
            for token in gram {
                // Unit separator keeps ("ab","c") distinct from ("a","bc")
                buf.extend_from_slice(token.as_bytes());
                buf.push(0x1f);
            }
            xxh3_64(&buf)
        })
        .collect();
    hashes.sort_unstable();
    hashes.dedup();
    hashes
}
