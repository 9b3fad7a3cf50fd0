// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPM 2.0 quote verification
//!
//! Pure functions over bytes: decode the TPMS_ATTEST and TPMT_SIGNATURE a
//! TPM2_Quote produced, then check them against an expected nonce, expected
//! PCR values, and the Attestation Key's public key. No TPM is needed.

pub mod attest;
pub mod error;
pub mod pubkey;
pub mod signature;
pub mod verify;
pub mod x509;

pub use attest::{decode_attestation, AttestationReport, AttestationStructure, ClockInfo, QuoteInfo};
pub use error::VerifyError;
pub use pubkey::AkPublicKey;
pub use signature::{decode_signature, Signature, SignatureData};
pub use verify::{
    expected_pcr_digest, hash_digest, verify, verify_quote, verify_quote_hex, verify_signature,
    VerificationResult,
};
