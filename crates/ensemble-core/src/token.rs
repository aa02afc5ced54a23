//! Short admission codes.
//!
//! Codes are lowercase base-36 so they survive being read aloud, typed on a
//! phone, or encoded in a QR code. Lookups normalize case and whitespace.

use rand::Rng;

/// Default admission code length.
pub const DEFAULT_CODE_LEN: usize = 6;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a random base-36 code of `len` characters.
pub fn generate_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Canonical form of a human-entered code.
pub fn normalize_code(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

/// Whether `code` looks like a code this module could have produced.
pub fn is_well_formed(code: &str) -> bool {
    !code.is_empty() && code.bytes().all(|b| ALPHABET.contains(&b))
}
