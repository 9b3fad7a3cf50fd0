// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attestation Key public keys

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use tpm2quote::{ResponseBuffer, TpmAlg, WireError};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::error::VerifyError;
use crate::x509::{parse_certificate_pem, parse_spki_pem, spki_key_bytes};

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";

/// TPM_ECC_CURVE identifiers
const TPM_ECC_NIST_P256: u16 = 0x0003;
const TPM_ECC_NIST_P384: u16 = 0x0004;

/// TPM_ALG_ECDAA carries an extra count in its scheme details
const TPM_ALG_ECDAA: u16 = 0x001A;

const RSA_DEFAULT_EXPONENT: u32 = 65537;

/// Public half of the key that signed a quote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AkPublicKey {
    EccP256(p256::ecdsa::VerifyingKey),
    EccP384(p384::ecdsa::VerifyingKey),
    Rsa(RsaPublicKey),
}

impl AkPublicKey {
    /// Uncompressed or compressed SEC1 point; the curve follows from the length
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, VerifyError> {
        match bytes.len() {
            33 | 65 => p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(AkPublicKey::EccP256)
                .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid P-256 key: {}", e))),
            49 | 97 => p384::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(AkPublicKey::EccP384)
                .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid P-384 key: {}", e))),
            n => Err(VerifyError::InvalidPublicKey(format!(
                "{} bytes is not a P-256 or P-384 SEC1 point", n
            ))),
        }
    }

    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, VerifyError> {
        let key_bytes = spki_key_bytes(spki)?;
        match spki.algorithm.oid.to_string().as_str() {
            OID_EC_PUBLIC_KEY => Self::from_sec1(key_bytes),
            OID_RSA_ENCRYPTION => RsaPublicKey::from_pkcs1_der(key_bytes)
                .map(AkPublicKey::Rsa)
                .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid RSA key: {}", e))),
            other => Err(VerifyError::InvalidPublicKey(format!(
                "Unsupported public key algorithm OID: {}", other
            ))),
        }
    }

    /// `-----BEGIN PUBLIC KEY-----` (SubjectPublicKeyInfo)
    pub fn from_public_key_pem(pem: &str) -> Result<Self, VerifyError> {
        Self::from_spki(&parse_spki_pem(pem)?)
    }

    /// Subject key of the first certificate in a PEM file
    ///
    /// The certificate chain is not validated; AK certification is the
    /// caller's concern.
    pub fn from_certificate_pem(pem: &str) -> Result<Self, VerifyError> {
        let cert = parse_certificate_pem(pem)?;
        Self::from_spki(&cert.tbs_certificate.subject_public_key_info)
    }

    /// TPM2B_PUBLIC, or a bare TPMT_PUBLIC, as produced by TPM2_ReadPublic
    pub fn from_tpm_public(bytes: &[u8]) -> Result<Self, VerifyError> {
        let tpmt = match bytes {
            [hi, lo, rest @ ..] if u16::from_be_bytes([*hi, *lo]) as usize == rest.len() => rest,
            _ => bytes,
        };
        parse_tpmt_public(tpmt)
    }

    /// Load a key file in whatever format it arrived in
    ///
    /// PEM certificates and public keys are recognized by their armor;
    /// anything else is tried as a SEC1 point, then as a TPM public area.
    pub fn parse(contents: &[u8]) -> Result<Self, VerifyError> {
        if let Ok(text) = std::str::from_utf8(contents) {
            if text.contains("-----BEGIN CERTIFICATE-----") {
                return Self::from_certificate_pem(text);
            }
            if text.contains("-----BEGIN PUBLIC KEY-----") {
                return Self::from_public_key_pem(text);
            }
        }
        if matches!(contents.first(), Some(0x02..=0x04)) {
            if let Ok(key) = Self::from_sec1(contents) {
                return Ok(key);
            }
        }
        Self::from_tpm_public(contents)
    }

    pub fn algorithm_name(&self) -> String {
        match self {
            AkPublicKey::EccP256(_) => "ecc-p256".to_string(),
            AkPublicKey::EccP384(_) => "ecc-p384".to_string(),
            AkPublicKey::Rsa(key) => format!("rsa-{}", key.size() * 8),
        }
    }
}

fn truncated(e: WireError) -> VerifyError {
    VerifyError::InvalidPublicKey(format!("TPMT_PUBLIC: {}", e))
}

/// Skip TPMT_SYM_DEF_OBJECT (only present details when not NULL)
fn skip_symmetric(buf: &mut ResponseBuffer<'_>) -> Result<(), VerifyError> {
    if buf.read_u16().map_err(truncated)? != TpmAlg::Null as u16 {
        buf.read_u16().map_err(truncated)?; // keyBits
        buf.read_u16().map_err(truncated)?; // mode
    }
    Ok(())
}

fn parse_tpmt_public(data: &[u8]) -> Result<AkPublicKey, VerifyError> {
    let mut buf = ResponseBuffer::new(data);

    let key_type = buf.read_u16().map_err(truncated)?;
    let _name_alg = buf.read_u16().map_err(truncated)?;
    let _object_attributes = buf.read_u32().map_err(truncated)?;
    let _auth_policy = buf.read_tpm2b().map_err(truncated)?;

    match TpmAlg::from_u16(key_type) {
        Some(TpmAlg::Rsa) => {
            skip_symmetric(&mut buf)?;
            if buf.read_u16().map_err(truncated)? != TpmAlg::Null as u16 {
                buf.read_u16().map_err(truncated)?; // scheme hash
            }
            let _key_bits = buf.read_u16().map_err(truncated)?;
            let exponent = match buf.read_u32().map_err(truncated)? {
                0 => RSA_DEFAULT_EXPONENT,
                e => e,
            };
            let modulus = buf.read_tpm2b().map_err(truncated)?;

            RsaPublicKey::new(BigUint::from_bytes_be(&modulus), BigUint::from(exponent))
                .map(AkPublicKey::Rsa)
                .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid RSA key: {}", e)))
        }
        Some(TpmAlg::Ecc) => {
            skip_symmetric(&mut buf)?;
            let scheme = buf.read_u16().map_err(truncated)?;
            if scheme != TpmAlg::Null as u16 {
                buf.read_u16().map_err(truncated)?; // scheme hash
                if scheme == TPM_ALG_ECDAA {
                    buf.read_u16().map_err(truncated)?; // count
                }
            }
            let curve_id = buf.read_u16().map_err(truncated)?;
            if buf.read_u16().map_err(truncated)? != TpmAlg::Null as u16 {
                buf.read_u16().map_err(truncated)?; // kdf hash
            }
            let x = buf.read_tpm2b().map_err(truncated)?;
            let y = buf.read_tpm2b().map_err(truncated)?;

            let field_size = match curve_id {
                TPM_ECC_NIST_P256 => 32,
                TPM_ECC_NIST_P384 => 48,
                other => {
                    return Err(VerifyError::InvalidPublicKey(format!(
                        "Unsupported ECC curve 0x{:04X}", other
                    )))
                }
            };

            let mut point = vec![0x04];
            point.extend(left_pad(&x, field_size)?);
            point.extend(left_pad(&y, field_size)?);
            AkPublicKey::from_sec1(&point)
        }
        _ => Err(VerifyError::InvalidPublicKey(format!(
            "Unsupported TPM key type 0x{:04X}", key_type
        ))),
    }
}

/// Left-pad a big-endian integer to `width` bytes
pub(crate) fn left_pad(value: &[u8], width: usize) -> Result<Vec<u8>, VerifyError> {
    let trimmed: &[u8] = {
        let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
        &value[start..]
    };
    if trimmed.len() > width {
        return Err(VerifyError::InvalidPublicKey(format!(
            "{}-byte integer does not fit in {} bytes", trimmed.len(), width
        )));
    }
    let mut out = vec![0u8; width - trimmed.len()];
    out.extend_from_slice(trimmed);
    Ok(out)
}
