//! Types for reader protocol operations

use thiserror::Error;

/// One decoded response frame.
///
/// Only [`crate::protocol::parse_frames`] builds these, and only after the
/// checksum has been verified, so `raw.len() == length as usize + 1` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub length: u8,
    pub address: u8,
    pub command: u8,
    pub status: u8,
    pub data: Vec<u8>,
    pub raw: Vec<u8>,
}

impl Frame {
    /// Always true: unverified byte runs never become a `Frame`.
    pub fn crc_valid(&self) -> bool {
        true
    }
}

/// One tag decoded from a G2 inventory (0x01) response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryG2Tag {
    /// Antenna number 1..=8 (see [`crate::protocol::antenna_id_from_mask`])
    pub antenna: u16,
    pub epc: Vec<u8>,
    pub rssi: u8,
}

impl InventoryG2Tag {
    /// EPC as uppercase hex with no separators
    pub fn epc_hex(&self) -> String {
        bytes_to_hex(&self.epc)
    }
}

/// Decoded payload of a single-tag inventory (0x0F) response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleInventoryResult {
    pub antenna: u8,
    pub tag_count: u8,
    pub epc: Vec<u8>,
}

/// Module details returned by get-reader-info (0x21)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Firmware version, major then minor
    pub version: (u8, u8),
    pub reader_type: u8,
    /// Supported protocol bitmask
    pub protocols: u8,
    pub max_frequency: u8,
    pub min_frequency: u8,
    pub power: u8,
    /// Inventory scan time in 100 ms units
    pub scan_time: u8,
}

/// Errors that can occur while encoding, decoding or moving reader frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    /// Frame is not an inventory (0x01) response
    #[error("not inventory frame")]
    NotInventoryFrame,

    /// Frame is not a single-tag inventory (0x0F) response
    #[error("not single-inventory frame")]
    NotSingleInventoryFrame,

    /// Frame is not a reader-info (0x21) response
    #[error("not reader-info frame")]
    NotReaderInfoFrame,

    /// Tag payload ran out before the declared tag count
    #[error("inventory payload truncated at tag {tag}")]
    Truncated { tag: usize },

    /// EPC length byte is zero or runs past the payload
    #[error("inventory invalid epc len at tag {tag}")]
    InvalidEpcLength { tag: usize },

    /// EPC present but the trailing RSSI byte is missing
    #[error("inventory missing rssi at tag {tag}")]
    MissingRssi { tag: usize },

    /// Response status that the decoder does not accept
    #[error("unexpected status 0x{0:02X}")]
    UnexpectedStatus(u8),

    /// Payload shorter than the fixed header of the response
    #[error("payload too short: need {need} bytes, got {got}")]
    PayloadTooShort { need: usize, got: usize },

    /// Hex input could not be parsed
    #[error("invalid hex input: {0}")]
    InvalidHex(String),

    /// Transport layer error (TCP, in-memory, ...)
    #[error("transport error: {0}")]
    Transport(String),
}

/// Convert bytes to uppercase hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Space separated uppercase hex, cut to `max_bytes` with a trailing ` ...`
pub fn format_hex(data: &[u8], max_bytes: usize) -> String {
    let shown = &data[..data.len().min(max_bytes)];
    let mut out = shown
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > max_bytes {
        out.push_str(" ...");
    }
    out
}

/// Parse user supplied hex such as `"04 00 21 D9 6A"` or `"0x04,0x00"`.
///
/// Tokens may be separated by spaces, commas, colons, tabs or newlines.
/// Odd-length tokens get a leading zero.
pub fn parse_hex_input(input: &str) -> Result<Vec<u8>, ReaderError> {
    let text = input.trim();
    if text.is_empty() {
        return Err(ReaderError::InvalidHex("empty input".into()));
    }

    let mut out = Vec::new();
    for token in text.split(|c: char| c == ',' || c == ':' || c.is_whitespace()) {
        let lower = token.trim().to_ascii_lowercase();
        let norm = lower.strip_prefix("0x").unwrap_or(&lower);
        if norm.is_empty() {
            continue;
        }
        let padded = if norm.len() % 2 != 0 {
            format!("0{}", norm)
        } else {
            norm.to_string()
        };
        for pair in padded.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(pair)
                .map_err(|_| ReaderError::InvalidHex(format!("invalid token {:?}", token)))?;
            let byte = u8::from_str_radix(pair, 16)
                .map_err(|_| ReaderError::InvalidHex(format!("invalid token {:?}", token)))?;
            out.push(byte);
        }
    }

    if out.is_empty() {
        return Err(ReaderError::InvalidHex("no hex bytes parsed".into()));
    }
    Ok(out)
}

/// Serde adapter storing a `Duration` as whole milliseconds
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
