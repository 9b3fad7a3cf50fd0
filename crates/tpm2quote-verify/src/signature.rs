// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPMT_SIGNATURE decoding
//!
//! Structural only; whether the signature verifies is decided in `verify`.

use tpm2quote::{ResponseBuffer, TpmAlg, WireError};

use crate::error::VerifyError;

/// Algorithm-specific signature payload (TPMU_SIGNATURE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureData {
    /// RSASSA or RSAPSS: the RSA signature block
    Rsa(Vec<u8>),
    /// ECDSA: signatureR and signatureS as the TPM sent them
    Ecdsa { r: Vec<u8>, s: Vec<u8> },
}

/// Decoded quote signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: TpmAlg,
    pub hash_alg: TpmAlg,
    pub data: SignatureData,
}

impl Signature {
    /// Raw signature bytes: the RSA block, or `r || s` for ECDSA
    pub fn signature_bytes(&self) -> Vec<u8> {
        match &self.data {
            SignatureData::Rsa(sig) => sig.clone(),
            SignatureData::Ecdsa { r, s } => {
                let mut out = Vec::with_capacity(r.len() + s.len());
                out.extend_from_slice(r);
                out.extend_from_slice(s);
                out
            }
        }
    }
}

fn truncated(e: WireError) -> VerifyError {
    VerifyError::MalformedSignature(e.to_string())
}

/// Decode a marshaled TPMT_SIGNATURE
pub fn decode_signature(raw: &[u8]) -> Result<Signature, VerifyError> {
    let mut buf = ResponseBuffer::new(raw);

    let raw_alg = buf.read_u16().map_err(truncated)?;
    let algorithm = match TpmAlg::from_u16(raw_alg) {
        Some(alg @ (TpmAlg::RsaSsa | TpmAlg::RsaPss | TpmAlg::EcDsa)) => alg,
        Some(TpmAlg::Null) => {
            return Err(VerifyError::MalformedSignature(
                "signature algorithm is TPM_ALG_NULL; the quote is unsigned".into(),
            ))
        }
        _ => {
            return Err(VerifyError::MalformedSignature(format!(
                "unsupported signature algorithm 0x{:04X}", raw_alg
            )))
        }
    };

    let raw_hash = buf.read_u16().map_err(truncated)?;
    let hash_alg = TpmAlg::from_u16(raw_hash)
        .filter(TpmAlg::is_hash)
        .ok_or_else(|| VerifyError::MalformedSignature(format!(
            "unknown signature hash algorithm 0x{:04X}", raw_hash
        )))?;

    let data = match algorithm {
        TpmAlg::EcDsa => {
            let r = buf.read_tpm2b().map_err(truncated)?;
            let s = buf.read_tpm2b().map_err(truncated)?;
            SignatureData::Ecdsa { r, s }
        }
        _ => SignatureData::Rsa(buf.read_tpm2b().map_err(truncated)?),
    };

    if buf.remaining() != 0 {
        return Err(VerifyError::MalformedSignature(format!(
            "{} trailing bytes after signature", buf.remaining()
        )));
    }

    Ok(Signature { algorithm, hash_alg, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2quote::CommandBuffer;

    #[test]
    fn test_decode_ecdsa() {
        let raw = CommandBuffer::new()
            .write_u16(0x0018)
            .write_u16(0x000B)
            .write_tpm2b(&[0x01; 32])
            .write_tpm2b(&[0x02; 32])
            .into_bytes();
        let sig = decode_signature(&raw).unwrap();
        assert_eq!(sig.algorithm, TpmAlg::EcDsa);
        assert_eq!(sig.hash_alg, TpmAlg::Sha256);
        let bytes = sig.signature_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..32], &[0x01; 32]);
    }

    #[test]
    fn test_decode_rsa() {
        for alg in [0x0014u16, 0x0016] {
            let raw = CommandBuffer::new()
                .write_u16(alg)
                .write_u16(0x000C)
                .write_tpm2b(&[0xAA; 256])
                .into_bytes();
            let sig = decode_signature(&raw).unwrap();
            assert_eq!(sig.algorithm as u16, alg);
            assert_eq!(sig.hash_alg, TpmAlg::Sha384);
            assert_eq!(sig.data, SignatureData::Rsa(vec![0xAA; 256]));
        }
    }

    #[test]
    fn test_rejects_unknown_and_null() {
        let raw = CommandBuffer::new().write_u16(0x0099).write_u16(0x000B).into_bytes();
        assert!(matches!(decode_signature(&raw), Err(VerifyError::MalformedSignature(_))));

        let raw = CommandBuffer::new().write_u16(0x0010).into_bytes();
        assert!(matches!(decode_signature(&raw), Err(VerifyError::MalformedSignature(_))));

        // ECDSA with a non-hash "hash" algorithm
        let raw = CommandBuffer::new().write_u16(0x0018).write_u16(0x0023).into_bytes();
        assert!(matches!(decode_signature(&raw), Err(VerifyError::MalformedSignature(_))));
    }

    #[test]
    fn test_rejects_truncation() {
        let raw = CommandBuffer::new()
            .write_u16(0x0018)
            .write_u16(0x000B)
            .write_tpm2b(&[0x01; 32])
            .write_tpm2b(&[0x02; 32])
            .into_bytes();
        for cut in 1..raw.len() {
            assert!(
                matches!(decode_signature(&raw[..raw.len() - cut]), Err(VerifyError::MalformedSignature(_))),
                "truncation by {} bytes was accepted", cut
            );
        }
    }
}
