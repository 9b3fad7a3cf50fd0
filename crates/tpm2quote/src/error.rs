// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors surfaced by quote request construction and the device round-trip

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuoteError {
    /// PCR selection is empty, duplicated, out of range, or names a non-hash bank
    #[error("invalid PCR selection: {0}")]
    InvalidSelection(String),

    /// Nonce is empty or exceeds the TPM2B_DATA limit
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// The TPM device or its transport failed; nothing was decoded
    #[error("TPM device error: {0:#}")]
    Device(#[from] anyhow::Error),
}

/// Byte-level underflow while reading a big-endian TPM structure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("buffer underflow: need {wanted} bytes at offset {offset}, only {available} remaining")]
pub struct WireError {
    pub wanted: usize,
    pub offset: usize,
    pub available: usize,
}
