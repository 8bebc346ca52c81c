//! 64-bit time-seeded identifiers.
//!
//! An [`Id64`] packs the creation time in whole seconds into its high 32
//! bits and a random value into its low 32 bits:
//!
//! ```text
//!  63                 32 31                  0
//! ┌─────────────────────┬─────────────────────┐
//! │  unix seconds (u32) │    random (u32)     │
//! └─────────────────────┴─────────────────────┘
//! ```
//!
//! No counter or lock is involved. Two IDs minted in different seconds
//! compare in creation order as unsigned integers; IDs minted within the same
//! second are unordered relative to each other. Collisions within one second
//! have probability 2^-32 per pair.
//!
//! The display form groups the big-endian bytes as lowercase hex:
//! `xxxx-xxxx-xxxx-xxxx`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdParseError;

/// Length of the formatted representation, including separators.
pub const FORMATTED_LEN: usize = 19;

/// Byte offsets of the `-` separators in the formatted representation.
const SEPARATOR_POSITIONS: [usize; 3] = [4, 9, 14];

/// A globally unique, time-sortable 64-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id64(u64);

impl Id64 {
    /// Mints a new identifier for the current wall-clock time.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Mints a new identifier whose time component is `time`.
    ///
    /// Times before the epoch clamp to zero and times past 2106 clamp to
    /// `u32::MAX` seconds.
    pub fn generate_at(time: DateTime<Utc>) -> Self {
        let random: u32 = rand::rng().random();
        Self::from_parts(time, random)
    }

    /// Builds an identifier from an explicit time and random component.
    pub fn from_parts(time: DateTime<Utc>, random: u32) -> Self {
        let secs = time.timestamp().clamp(0, i64::from(u32::MAX)) as u64;
        Self((secs << 32) | u64::from(random))
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Reinterprets the bits as a signed integer for storage in BIGINT columns.
    pub const fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub const fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// The creation second embedded in the high 32 bits.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = (self.0 >> 32) as i64;
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default()
    }

    /// The random component in the low 32 bits.
    pub const fn random_part(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Renders the identifier as `xxxx-xxxx-xxxx-xxxx`.
    pub fn to_formatted_string(&self) -> String {
        let digits = hex::encode(self.to_bytes());
        let mut out = String::with_capacity(FORMATTED_LEN);
        for (i, chunk) in digits.as_bytes().chunks(4).enumerate() {
            if i > 0 {
                out.push('-');
            }
            // chunks of an ASCII hex string are valid UTF-8
            out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        }
        out
    }

    /// Parses the `xxxx-xxxx-xxxx-xxxx` form produced by
    /// [`Id64::to_formatted_string`]. Only lowercase hex digits are accepted.
    pub fn from_formatted_string(s: &str) -> Result<Self, IdParseError> {
        if s.len() != FORMATTED_LEN {
            return Err(IdParseError::InvalidLength(s.len()));
        }

        let bytes = s.as_bytes();
        let mut digits = String::with_capacity(16);
        for (i, &b) in bytes.iter().enumerate() {
            if SEPARATOR_POSITIONS.contains(&i) {
                if b != b'-' {
                    return Err(IdParseError::InvalidSeparator(i));
                }
                continue;
            }
            if !matches!(b, b'0'..=b'9' | b'a'..=b'f') {
                return Err(IdParseError::InvalidHex(s.to_string()));
            }
            digits.push(b as char);
        }

        let decoded =
            hex::decode(&digits).map_err(|e| IdParseError::InvalidHex(e.to_string()))?;
        let raw: [u8; 8] = decoded
            .try_into()
            .map_err(|_| IdParseError::InvalidHex(s.to_string()))?;
        Ok(Self::from_bytes(raw))
    }
}

impl fmt::Display for Id64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_formatted_string())
    }
}

impl FromStr for Id64 {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_formatted_string(s)
    }
}

impl From<u64> for Id64 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Id64> for u64 {
    fn from(id: Id64) -> Self {
        id.0
    }
}

impl Serialize for Id64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_formatted_string())
    }
}

impl<'de> Deserialize<'de> for Id64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_formatted_string(&s).map_err(serde::de::Error::custom)
    }
}
