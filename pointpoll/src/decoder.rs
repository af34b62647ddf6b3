//! Register bytes to engineering values.

use thiserror::Error;

use crate::formula::{Formula, FormulaError};

/// Errors raised while turning register bytes into a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("register buffer too short: need 4 bytes, got {0}")]
    BufferTooShort(usize),
    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),
}

/// Byte order used to rebuild a 32-bit float from register bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    /// "ABCD": first register holds the high word, each word high byte first
    #[default]
    BigEndian,
    /// The same four bytes read little-endian ("DCBA")
    LittleEndian,
}

impl ByteOrder {
    /// Map a configured format name to a byte order.
    ///
    /// Only "ABCD" (case-insensitive) selects big-endian; every other name
    /// selects little-endian.
    pub fn from_format(format: &str) -> Self {
        if format.trim().eq_ignore_ascii_case("ABCD") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    /// Return the canonical format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ByteOrder::BigEndian => "ABCD",
            ByteOrder::LittleEndian => "DCBA",
        }
    }
}

/// Flatten register words into bytes, word 0 first, each word big-endian.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Interpret the first four bytes as an IEEE-754 `f32`.
pub fn read_f32(bytes: &[u8], order: ByteOrder) -> Result<f32, DecodeError> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::BufferTooShort(bytes.len()))?;

    Ok(match order {
        ByteOrder::BigEndian => f32::from_be_bytes(raw),
        ByteOrder::LittleEndian => f32::from_le_bytes(raw),
    })
}

/// Decode register bytes and apply the optional scaling formula.
///
/// Non-finite values (a NaN register pattern, a division by zero in the
/// formula) are passed through unchanged.
pub fn decode(bytes: &[u8], order: ByteOrder, formula: Option<&Formula>) -> Result<f64, DecodeError> {
    let raw = f64::from(read_f32(bytes, order)?);
    Ok(match formula {
        Some(formula) => formula.eval(raw),
        None => raw,
    })
}
