//! The indexed-secret position matcher. The server challenges the user for
//! the characters at a random set of 1-based positions of a shared secret
//! string; the expected answer is those characters concatenated in the order
//! requested.

use openssl::memcmp;
use rand::prelude::*;

/// The characters of `secret` at the requested 1-based positions, in request
/// order. None when any position falls outside the secret.
pub fn derive_expected(secret: &str, positions: &[usize]) -> Option<String> {
    let chars: Vec<char> = secret.chars().collect();
    positions
        .iter()
        .map(|p| {
            p.checked_sub(1)
                .and_then(|idx| chars.get(idx))
                .copied()
        })
        .collect()
}

/// Compare the presented answer against the expected characters. A length
/// mismatch rejects immediately without touching the secret; equal lengths
/// are compared in constant time so the comparison can not leak which
/// position failed.
pub fn check_response(secret: &str, positions: &[usize], answer: &str) -> bool {
    let Some(expected) = derive_expected(secret, positions) else {
        return false;
    };
    if answer.len() != expected.len() {
        return false;
    }
    if expected.is_empty() {
        // Zero requested positions can never authenticate anything.
        return false;
    }
    memcmp::eq(answer.as_bytes(), expected.as_bytes())
}

/// Pick `count` distinct random 1-based positions of a secret of
/// `secret_len` characters, capped at the secret length.
pub fn random_positions(count: usize, secret_len: usize) -> Vec<usize> {
    let count = count.min(secret_len);
    let mut rng = rand::thread_rng();
    rand::seq::index::sample(&mut rng, secret_len, count)
        .into_iter()
        .map(|idx| idx + 1)
        .collect()
}

/// Comma separated challenge data encoding of a position set.
pub fn encode_positions(positions: &[usize]) -> String {
    positions
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_positions(raw: &str) -> Option<Vec<usize>> {
    raw.split(',').map(|p| p.parse().ok()).collect()
}
