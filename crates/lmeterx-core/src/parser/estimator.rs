//! A small, self-contained, deterministic stand-in for a real model
//! tokenizer. Used only when an endpoint's response carries no usage block,
//! so the aggregator still has a token count to report (marked `estimated`).

/// Seed merge table of common English byte-pairs, ordered by frequency rank.
/// Each pass merges every non-overlapping occurrence of the highest-ranked
/// pair still present in the buffer, approximating one round of BPE without
/// needing a trained vocabulary.
const MERGE_PAIRS: &[(u8, u8)] = &[
    (b't', b'h'),
    (b'h', b'e'),
    (b'i', b'n'),
    (b'e', b'r'),
    (b'a', b'n'),
    (b'r', b'e'),
    (b'o', b'n'),
    (b'a', b't'),
    (b'e', b'n'),
    (b'n', b'd'),
    (b't', b'i'),
    (b'e', b's'),
    (b' ', b't'),
    (b' ', b'a'),
    (b'o', b'u'),
];

fn merge_pass(tokens: &[u8], pair: (u8, u8)) -> Vec<u8> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if i + 1 < tokens.len() && tokens[i] == pair.0 && tokens[i + 1] == pair.1 {
            // Represent a merged pair as a single sentinel byte so the next
            // pass's length reflects one fewer token; the actual byte value
            // doesn't matter since we only ever count remaining tokens.
            out.push(0);
            i += 2;
        } else {
            out.push(tokens[i]);
            i += 1;
        }
    }
    out
}

/// Deterministic best-effort token estimate for text with no usage block in
/// the response. Same input always yields the same output.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let mut buf = text.as_bytes().to_vec();
    for &pair in MERGE_PAIRS {
        buf = merge_pass(&buf, pair);
    }
    let bpe_estimate = buf.len() as u64;

    // Floor so very short, whitespace-light strings (e.g. single tokens
    // like "OK") don't round down to an implausibly low count.
    let word_floor = (text.split_whitespace().count() as f64 * 1.3).ceil() as u64;

    bpe_estimate.max(word_floor).max(1)
}
