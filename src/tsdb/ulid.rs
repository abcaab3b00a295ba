//! Lexically sortable 128-bit block identifiers: 48-bit millisecond
//! timestamp followed by 80 bits of entropy, rendered as 26 characters of
//! Crockford base32. Block directories are named by these, so sorting
//! directory names sorts blocks by creation time.

use crate::error::{ForgeError, Result};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid(u128);

impl Ulid {
    /// Generates an id stamped with the current wall clock.
    pub fn generate() -> Self {
        Self::with_timestamp(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    /// Generates an id with an explicit millisecond timestamp.
    pub fn with_timestamp(timestamp_ms: u64) -> Self {
        let mut entropy = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut entropy);
        let mut low: u128 = 0;
        for b in entropy {
            low = (low << 8) | b as u128;
        }
        Ulid(((timestamp_ms as u128 & 0xFFFF_FFFF_FFFF) << 80) | low)
    }

    /// Millisecond timestamp embedded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> 80) as u64
    }

    /// Strict parse: exactly 26 Crockford base32 characters, first character
    /// within range so the value fits 128 bits.
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// True iff `s` names a block directory (parses as a ULID).
    pub fn is_block_dir_name(s: &str) -> bool {
        Self::parse(s).is_ok()
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; ENCODED_LEN];
        let mut v = self.0;
        for slot in buf.iter_mut().rev() {
            *slot = ALPHABET[(v & 0x1F) as usize];
            v >>= 5;
        }
        // 26 * 5 = 130 bits; the two top bits must have been zero.
        f.write_str(std::str::from_utf8(&buf).expect("base32 output is ASCII"))
    }
}

impl FromStr for Ulid {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != ENCODED_LEN {
            return Err(ForgeError::Parse(format!(
                "ULID must be {} characters, got {:?}",
                ENCODED_LEN, s
            )));
        }
        let mut v: u128 = 0;
        for (i, c) in s.bytes().enumerate() {
            let digit = decode_char(c)
                .ok_or_else(|| ForgeError::Parse(format!("invalid ULID character in {:?}", s)))?;
            if i == 0 && digit > 7 {
                return Err(ForgeError::Parse(format!("ULID {:?} overflows 128 bits", s)));
            }
            v = (v << 5) | digit as u128;
        }
        Ok(Ulid(v))
    }
}

fn decode_char(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'H' => Some(c - b'A' + 10),
        b'J' | b'K' => Some(c - b'J' + 18),
        b'M' | b'N' => Some(c - b'M' + 20),
        b'P'..=b'T' => Some(c - b'P' + 22),
        b'V'..=b'Z' => Some(c - b'V' + 27),
        _ => None,
    }
}
