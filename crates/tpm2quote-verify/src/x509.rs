// SPDX-License-Identifier: MIT OR Apache-2.0

//! PEM and X.509 handling for AK public keys

use base64::{engine::general_purpose::STANDARD, Engine as _};
use der::Decode;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;

use crate::error::VerifyError;

/// Decode every PEM block with the given label, in file order
pub fn parse_pem_blocks(pem: &str, label: &str) -> Result<Vec<Vec<u8>>, VerifyError> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_block = false;

    for line in pem.lines() {
        if line.contains(&begin) {
            in_block = true;
            current.clear();
        } else if line.contains(&end) {
            if !in_block {
                return Err(VerifyError::InvalidPublicKey(format!("{} without {}", end, begin)));
            }
            in_block = false;
            blocks.push(base64_decode(&current)?);
        } else if in_block {
            current.push_str(line.trim());
        }
    }

    if in_block {
        return Err(VerifyError::InvalidPublicKey(format!("unterminated {} block", label)));
    }
    Ok(blocks)
}

fn base64_decode(input: &str) -> Result<Vec<u8>, VerifyError> {
    STANDARD
        .decode(input)
        .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid base64: {}", e)))
}

/// Parse the first certificate in a PEM file (the leaf, by convention)
pub fn parse_certificate_pem(pem: &str) -> Result<Certificate, VerifyError> {
    let der_bytes = parse_pem_blocks(pem, "CERTIFICATE")?
        .into_iter()
        .next()
        .ok_or_else(|| VerifyError::InvalidPublicKey("No certificates found in PEM".into()))?;
    Certificate::from_der(&der_bytes)
        .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid certificate: {}", e)))
}

/// Parse a `PUBLIC KEY` PEM into its SubjectPublicKeyInfo
pub fn parse_spki_pem(pem: &str) -> Result<SubjectPublicKeyInfoOwned, VerifyError> {
    let der_bytes = parse_pem_blocks(pem, "PUBLIC KEY")?
        .into_iter()
        .next()
        .ok_or_else(|| VerifyError::InvalidPublicKey("No public key found in PEM".into()))?;
    SubjectPublicKeyInfoOwned::from_der(&der_bytes)
        .map_err(|e| VerifyError::InvalidPublicKey(format!("Invalid SubjectPublicKeyInfo: {}", e)))
}

/// Raw public key bytes of a SubjectPublicKeyInfo
///
/// SEC1 point for EC keys, PKCS#1 RSAPublicKey DER for RSA keys.
pub fn spki_key_bytes(spki: &SubjectPublicKeyInfoOwned) -> Result<&[u8], VerifyError> {
    spki.subject_public_key
        .as_bytes()
        .ok_or_else(|| VerifyError::InvalidPublicKey("Public key has unused bits".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pem_blocks() {
        let pem = "junk\n-----BEGIN PUBLIC KEY-----\nSGVsbG8g\nV29ybGQ=\n-----END PUBLIC KEY-----\n";
        let blocks = parse_pem_blocks(pem, "PUBLIC KEY").unwrap();
        assert_eq!(blocks, vec![b"Hello World".to_vec()]);
        assert!(parse_pem_blocks(pem, "CERTIFICATE").unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_block() {
        let pem = "-----BEGIN CERTIFICATE-----\nSGVsbG8=\n";
        assert!(matches!(parse_pem_blocks(pem, "CERTIFICATE"), Err(VerifyError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_no_certificate() {
        assert!(parse_certificate_pem("").is_err());
    }
}
