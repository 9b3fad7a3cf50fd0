// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quote verification: freshness, PCR digest, signature

use ecdsa::signature::hazmat::PrehashVerifier;
use log::{debug, warn};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256, Sha384, Sha512};
use sha1::Sha1;
use tpm2quote::{PcrValues, TpmAlg};

use crate::attest::{decode_attestation, AttestationStructure};
use crate::error::VerifyError;
use crate::pubkey::{left_pad, AkPublicKey};
use crate::signature::{decode_signature, Signature, SignatureData};

/// Run `$body` with `$d` bound to the digest type for a TPM hash algorithm
macro_rules! with_hash {
    ($alg:expr, $d:ident => $body:expr) => {
        match $alg {
            TpmAlg::Sha1 => { type $d = Sha1; Some($body) }
            TpmAlg::Sha256 => { type $d = Sha256; Some($body) }
            TpmAlg::Sha384 => { type $d = Sha384; Some($body) }
            TpmAlg::Sha512 => { type $d = Sha512; Some($body) }
            _ => None,
        }
    };
}

/// Outcome of checking one quote
///
/// `overall` is true only when every individual check passed. Callers
/// must treat `overall() == false` as a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    nonce_matches: bool,
    pcr_digest_matches: bool,
    signature_valid: bool,
    overall: bool,
}

impl VerificationResult {
    pub fn new(nonce_matches: bool, pcr_digest_matches: bool, signature_valid: bool) -> Self {
        Self {
            nonce_matches,
            pcr_digest_matches,
            signature_valid,
            overall: nonce_matches && pcr_digest_matches && signature_valid,
        }
    }

    pub fn nonce_matches(&self) -> bool {
        self.nonce_matches
    }

    pub fn pcr_digest_matches(&self) -> bool {
        self.pcr_digest_matches
    }

    pub fn signature_valid(&self) -> bool {
        self.signature_valid
    }

    pub fn overall(&self) -> bool {
        self.overall
    }

    /// Names of the checks that failed
    pub fn failed_checks(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.nonce_matches {
            failed.push("nonce");
        }
        if !self.pcr_digest_matches {
            failed.push("pcr digest");
        }
        if !self.signature_valid {
            failed.push("signature");
        }
        failed
    }

    /// Collapse into an error for callers that reject on any failure
    ///
    /// A nonce mismatch alone is reported as stale; anything touching the
    /// PCR digest or the signature is untrusted.
    pub fn into_result(self) -> Result<(), VerifyError> {
        if self.overall {
            return Ok(());
        }
        if self.pcr_digest_matches && self.signature_valid {
            return Err(VerifyError::AttestationStale);
        }
        Err(VerifyError::AttestationUntrusted(format!(
            "failed checks: {}", self.failed_checks().join(", ")
        )))
    }
}

/// Digest `data` with a TPM hash algorithm
pub fn hash_digest(alg: TpmAlg, data: &[u8]) -> Option<Vec<u8>> {
    with_hash!(alg, D => D::digest(data).to_vec())
}

/// Hash algorithm the TPM used for pcrDigest
///
/// TPM2_Quote digests the selected PCRs with the signing scheme's hash.
/// The first selected bank is the fallback when the sizes disagree.
fn pcr_digest_alg(attestation: &AttestationStructure, signature: &Signature) -> Option<TpmAlg> {
    let len = attestation.attested.pcr_digest.len();
    let bank_alg = attestation.attested.pcr_selections.first().map(|s| s.hash_alg());
    [Some(signature.hash_alg), bank_alg]
        .into_iter()
        .flatten()
        .find(|alg| alg.digest_size() == Some(len))
}

/// Recompute pcrDigest from the caller's expected values
///
/// Values are concatenated bank by bank in the attestation's order, lowest
/// index first within a bank. `None` if the quote selects no PCRs, leaves
/// out a PCR the caller expects, selects a PCR with no expected value, or
/// no usable hash algorithm exists.
pub fn expected_pcr_digest(
    attestation: &AttestationStructure,
    signature: &Signature,
    expected_pcrs: &PcrValues,
) -> Option<Vec<u8>> {
    let selections = &attestation.attested.pcr_selections;
    if selections.iter().all(|s| s.is_empty()) {
        warn!("Quote covers no PCRs");
        return None;
    }
    if let Some((bank, index, _)) = expected_pcrs
        .iter()
        .find(|(bank, index, _)| !selections.iter().any(|s| s.hash_alg() == *bank && s.contains(*index)))
    {
        warn!("Quote does not cover expected PCR {}:{}", bank.name(), index);
        return None;
    }

    let alg = match pcr_digest_alg(attestation, signature) {
        Some(alg) => alg,
        None => {
            warn!("pcrDigest is {} bytes, matching no quoted hash algorithm",
                  attestation.attested.pcr_digest.len());
            return None;
        }
    };

    let concat = match expected_pcrs.concat(selections) {
        Ok(concat) => concat,
        Err((bank, index)) => {
            warn!("No expected value for PCR {}:{}", bank.name(), index);
            return None;
        }
    };

    hash_digest(alg, &concat)
}

/// Check a TPM signature over `message` with the AK public key
///
/// Any mismatch between key type and signature algorithm, or any
/// malformed component, yields `false`.
pub fn verify_signature(ak: &AkPublicKey, signature: &Signature, message: &[u8]) -> bool {
    let digest = match hash_digest(signature.hash_alg, message) {
        Some(d) => d,
        None => return false,
    };

    let result = match (ak, &signature.data) {
        (AkPublicKey::EccP256(key), SignatureData::Ecdsa { r, s }) => {
            ecdsa_signature_bytes(r, s, 32)
                .and_then(|b| p256::ecdsa::Signature::from_slice(&b).map_err(|e| e.to_string()))
                .and_then(|sig| key.verify_prehash(&digest, &sig).map_err(|e| e.to_string()))
        }
        (AkPublicKey::EccP384(key), SignatureData::Ecdsa { r, s }) => {
            ecdsa_signature_bytes(r, s, 48)
                .and_then(|b| p384::ecdsa::Signature::from_slice(&b).map_err(|e| e.to_string()))
                .and_then(|sig| key.verify_prehash(&digest, &sig).map_err(|e| e.to_string()))
        }
        (AkPublicKey::Rsa(key), SignatureData::Rsa(sig)) => {
            verify_rsa(key, signature.algorithm, signature.hash_alg, &digest, sig)
        }
        _ => Err(format!(
            "{} signature cannot be checked with a {} key",
            signature.algorithm.name(),
            ak.algorithm_name()
        )),
    };

    match result {
        Ok(()) => {
            debug!("Quote signature verified ({} / {})", signature.algorithm.name(), ak.algorithm_name());
            true
        }
        Err(e) => {
            warn!("Quote signature verification failed: {}", e);
            false
        }
    }
}

/// Fixed-width `r || s` for the ecdsa crate
fn ecdsa_signature_bytes(r: &[u8], s: &[u8], width: usize) -> Result<Vec<u8>, String> {
    let mut out = left_pad(r, width).map_err(|e| e.to_string())?;
    out.extend(left_pad(s, width).map_err(|e| e.to_string())?);
    Ok(out)
}

fn verify_rsa(
    key: &RsaPublicKey,
    algorithm: TpmAlg,
    hash_alg: TpmAlg,
    digest: &[u8],
    sig: &[u8],
) -> Result<(), String> {
    let outcome = match algorithm {
        TpmAlg::RsaSsa => with_hash!(hash_alg, D => key.verify(Pkcs1v15Sign::new::<D>(), digest, sig)),
        TpmAlg::RsaPss => {
            // TPMs use the largest salt the modulus allows, except in FIPS
            // mode where salt length equals digest length
            let max_salt = key.size().saturating_sub(digest.len() + 2);
            with_hash!(hash_alg, D => key
                .verify(Pss::new_with_salt::<D>(max_salt), digest, sig)
                .or_else(|_| key.verify(Pss::new_with_salt::<D>(digest.len()), digest, sig)))
        }
        other => return Err(format!("{} is not an RSA signature scheme", other.name())),
    };

    match outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(e.to_string()),
        None => Err(format!("unsupported hash {}", hash_alg.name())),
    }
}

/// Cross-check a decoded quote against the caller's expectations
///
/// `raw_attestation` must be the exact bytes `attestation` was decoded
/// from; the signature is checked over them, never over a re-encoding.
/// Never fails: each check lands in the result.
pub fn verify_quote(
    raw_attestation: &[u8],
    attestation: &AttestationStructure,
    signature: &Signature,
    expected_nonce: &[u8],
    expected_pcrs: &PcrValues,
    ak: &AkPublicKey,
) -> VerificationResult {
    let nonce_matches = attestation.extra_data == expected_nonce;
    if !nonce_matches {
        warn!(
            "Quote nonce mismatch: extraData {}, expected {}",
            hex::encode(&attestation.extra_data),
            hex::encode(expected_nonce)
        );
    }

    let pcr_digest_matches = match expected_pcr_digest(attestation, signature, expected_pcrs) {
        Some(expected) if expected == attestation.attested.pcr_digest => true,
        Some(expected) => {
            warn!(
                "PCR digest mismatch: quote {}, expected {}",
                hex::encode(&attestation.attested.pcr_digest),
                hex::encode(expected)
            );
            false
        }
        None => false,
    };

    let signature_valid = verify_signature(ak, signature, raw_attestation);

    let result = VerificationResult::new(nonce_matches, pcr_digest_matches, signature_valid);
    debug!("Quote verification: {:?}", result);
    result
}

/// Decode and verify a quote in one step
///
/// Decoding errors abort before any check runs.
pub fn verify(
    raw_attestation: &[u8],
    raw_signature: &[u8],
    expected_nonce: &[u8],
    expected_pcrs: &PcrValues,
    ak: &AkPublicKey,
) -> Result<VerificationResult, VerifyError> {
    let attestation = decode_attestation(raw_attestation)?;
    let signature = decode_signature(raw_signature)?;
    Ok(verify_quote(raw_attestation, &attestation, &signature, expected_nonce, expected_pcrs, ak))
}

/// [`verify`] over hex-encoded attestation, signature, and nonce
pub fn verify_quote_hex(
    attest_hex: &str,
    signature_hex: &str,
    nonce_hex: &str,
    expected_pcrs: &PcrValues,
    ak: &AkPublicKey,
) -> Result<VerificationResult, VerifyError> {
    let attest = hex::decode(attest_hex)?;
    let signature = hex::decode(signature_hex)?;
    let nonce = hex::decode(nonce_hex)?;
    verify(&attest, &signature, &nonce, expected_pcrs, ak)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_is_and() {
        assert!(VerificationResult::new(true, true, true).overall());
        assert!(!VerificationResult::new(false, true, true).overall());
        assert!(!VerificationResult::new(true, false, true).overall());
        assert!(!VerificationResult::new(true, true, false).overall());
    }

    #[test]
    fn test_into_result_categories() {
        assert!(VerificationResult::new(true, true, true).into_result().is_ok());
        assert!(matches!(
            VerificationResult::new(false, true, true).into_result(),
            Err(VerifyError::AttestationStale)
        ));
        match VerificationResult::new(false, false, true).into_result() {
            Err(VerifyError::AttestationUntrusted(msg)) => {
                assert!(msg.contains("nonce"));
                assert!(msg.contains("pcr digest"));
            }
            other => panic!("expected untrusted, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_digest_sizes() {
        for alg in [TpmAlg::Sha1, TpmAlg::Sha256, TpmAlg::Sha384, TpmAlg::Sha512] {
            assert_eq!(hash_digest(alg, b"abc").map(|d| d.len()), alg.digest_size());
        }
        assert_eq!(hash_digest(TpmAlg::EcDsa, b"abc"), None);
        assert_eq!(
            hex::encode(hash_digest(TpmAlg::Sha256, b"abc").unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
