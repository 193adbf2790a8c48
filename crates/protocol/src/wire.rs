//! Fixed-width big-endian integer conversions.
//!
//! The WebSocket wire format carries extended payload lengths and close
//! codes as network-order integers; these helpers convert them without
//! depending on host byte order. Decoding rejects any slice whose length
//! is not exactly the target width.

use thiserror::Error;

/// Error produced when a slice does not match the expected integer width.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected {expected} bytes, got {actual}")]
pub struct WireError {
    pub expected: usize,
    pub actual: usize,
}

/// Decodes a big-endian `u16` from exactly 2 bytes.
pub fn u16_from_be(bytes: &[u8]) -> Result<u16, WireError> {
    let bytes: [u8; 2] = bytes.try_into().map_err(|_| WireError {
        expected: 2,
        actual: bytes.len(),
    })?;
    Ok(u16::from_be_bytes(bytes))
}

/// Decodes a big-endian `u64` from exactly 8 bytes.
pub fn u64_from_be(bytes: &[u8]) -> Result<u64, WireError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| WireError {
        expected: 8,
        actual: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Encodes a `u16` as 2 big-endian bytes.
pub fn u16_to_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Encodes a `u64` as 8 big-endian bytes.
pub fn u64_to_be(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}
