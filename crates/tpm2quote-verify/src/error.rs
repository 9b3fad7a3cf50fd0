// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed attestation: {0}")]
    MalformedAttestation(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("invalid AK public key: {0}")]
    InvalidPublicKey(String),

    /// extraData does not echo the expected nonce
    #[error("attestation is stale: nonce does not match")]
    AttestationStale,

    #[error("attestation is untrusted: {0}")]
    AttestationUntrusted(String),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}
