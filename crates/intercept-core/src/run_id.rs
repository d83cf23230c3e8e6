//! Sortable run identifiers.
//!
//! 20 raw bytes (4-byte big-endian timestamp + 16 random bytes) encoded as a
//! fixed-width, 27-character base62 string. Lexical order follows creation
//! second.

use std::fmt;

use chrono::Utc;
use rand::RngCore;

/// Offset subtracted from Unix seconds (2014-05-13T16:53:20Z).
const EPOCH_OFFSET: i64 = 1_400_000_000;
const ENCODED_LEN: usize = 27;
const RAW_LEN: usize = 20;
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        let mut payload = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut payload);
        Self::from_parts(Utc::now().timestamp(), payload)
    }

    fn from_parts(unix_seconds: i64, payload: [u8; 16]) -> Self {
        let ts = (unix_seconds - EPOCH_OFFSET).clamp(0, u32::MAX as i64) as u32;
        let mut raw = [0u8; RAW_LEN];
        raw[..4].copy_from_slice(&ts.to_be_bytes());
        raw[4..].copy_from_slice(&payload);
        Self(encode_base62(&raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six characters, used in artifact names.
    pub fn short(&self) -> &str {
        &self.0[..6]
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn encode_base62(raw: &[u8; RAW_LEN]) -> String {
    // Repeated division of the big-endian number by 62.
    let mut digits = raw.to_vec();
    let mut out = [b'0'; ENCODED_LEN];
    let mut pos = ENCODED_LEN;

    while digits.iter().any(|&d| d != 0) && pos > 0 {
        let mut remainder: u32 = 0;
        for d in digits.iter_mut() {
            let acc = (remainder << 8) | u32::from(*d);
            *d = (acc / 62) as u8;
            remainder = acc % 62;
        }
        pos -= 1;
        out[pos] = ALPHABET[remainder as usize];
    }

    out.iter().map(|&b| b as char).collect()
}
