// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quote request construction and TPM2_Quote

use anyhow::{bail, Context, Result};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;

use crate::pcr::write_pcr_selection_list;
use crate::{CommandBuffer, PcrSelection, QuoteError, ResponseBuffer, Tpm, TpmAlg, TpmCc, TpmSt, TpmTransport};

/// Largest qualifyingData a TPM accepts (sizeof(TPMU_HA), SHA-512)
pub const MAX_NONCE_SIZE: usize = 64;

/// Signing scheme requested for the quote (TPMT_SIG_SCHEME)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigScheme {
    /// Use the scheme bound to the signing key
    Null,
    RsaSsa(TpmAlg),
    RsaPss(TpmAlg),
    EcDsa(TpmAlg),
}

impl SigScheme {
    /// Parse `null`, or `<scheme>` / `<scheme>:<hash>` with sha256 as the default hash
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, hash) = match s.split_once(':') {
            Some((scheme, hash)) => (scheme, hash.parse::<TpmAlg>()?),
            None => (s, TpmAlg::Sha256),
        };
        if !hash.is_hash() {
            bail!("{} is not a hash algorithm", hash.name());
        }
        match scheme.parse::<TpmAlg>()? {
            TpmAlg::Null => Ok(SigScheme::Null),
            TpmAlg::RsaSsa => Ok(SigScheme::RsaSsa(hash)),
            TpmAlg::RsaPss => Ok(SigScheme::RsaPss(hash)),
            TpmAlg::EcDsa => Ok(SigScheme::EcDsa(hash)),
            other => bail!("{} is not a signing scheme", other.name()),
        }
    }

    fn write(&self, buf: CommandBuffer) -> CommandBuffer {
        match *self {
            SigScheme::Null => buf.write_u16(TpmAlg::Null as u16),
            SigScheme::RsaSsa(hash) => buf.write_u16(TpmAlg::RsaSsa as u16).write_u16(hash as u16),
            SigScheme::RsaPss(hash) => buf.write_u16(TpmAlg::RsaPss as u16).write_u16(hash as u16),
            SigScheme::EcDsa(hash) => buf.write_u16(TpmAlg::EcDsa as u16).write_u16(hash as u16),
        }
    }
}

/// A single quote attempt
///
/// The nonce is the only replay defense: generate it fresh per request
/// (see [`generate_nonce`]) and keep it to compare against the
/// attestation's extraData.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    key_handle: u32,
    nonce: Vec<u8>,
    selections: Vec<PcrSelection>,
    scheme: SigScheme,
}

impl QuoteRequest {
    /// Validate and assemble a request
    pub fn build(
        key_handle: u32,
        nonce: &[u8],
        selections: Vec<PcrSelection>,
        scheme: SigScheme,
    ) -> Result<Self, QuoteError> {
        validate_nonce_len(nonce.len())?;

        if selections.is_empty() {
            return Err(QuoteError::InvalidSelection("no PCR banks selected".into()));
        }
        let mut banks = HashSet::new();
        for selection in &selections {
            if selection.is_empty() {
                return Err(QuoteError::InvalidSelection(format!(
                    "no PCRs selected in {} bank", selection.hash_alg().name()
                )));
            }
            if !banks.insert(selection.hash_alg()) {
                return Err(QuoteError::InvalidSelection(format!(
                    "{} bank selected twice", selection.hash_alg().name()
                )));
            }
        }

        Ok(Self {
            key_handle,
            nonce: nonce.to_vec(),
            selections,
            scheme,
        })
    }

    pub fn key_handle(&self) -> u32 {
        self.key_handle
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn selections(&self) -> &[PcrSelection] {
        &self.selections
    }

    pub fn scheme(&self) -> SigScheme {
        self.scheme
    }

    /// Marshal TPM2_Quote
    pub fn to_command(&self) -> Vec<u8> {
        let buf = CommandBuffer::new()
            .write_u32(self.key_handle) // signHandle
            .write_auth_empty_pw()
            // qualifyingData (TPM2B_DATA)
            .write_tpm2b(&self.nonce);
        // inScheme (TPMT_SIG_SCHEME)
        let buf = self.scheme.write(buf);
        // PCRselect (TPML_PCR_SELECTION)
        write_pcr_selection_list(buf, &self.selections)
            .finalize(TpmSt::Sessions, TpmCc::Quote)
    }
}

fn validate_nonce_len(len: usize) -> Result<(), QuoteError> {
    if len == 0 {
        return Err(QuoteError::InvalidNonce("nonce is empty".into()));
    }
    if len > MAX_NONCE_SIZE {
        return Err(QuoteError::InvalidNonce(format!(
            "nonce is {} bytes, maximum is {}", len, MAX_NONCE_SIZE
        )));
    }
    Ok(())
}

/// Fresh random nonce from the OS CSPRNG
pub fn generate_nonce(len: usize) -> Result<Vec<u8>, QuoteError> {
    validate_nonce_len(len)?;
    let mut nonce = vec![0u8; len];
    OsRng.fill_bytes(&mut nonce);
    Ok(nonce)
}

/// Raw TPM2_Quote output
///
/// `attest` is the TPMS_ATTEST the TPM signed, exactly as returned.
/// `signature` is the marshaled TPMT_SIGNATURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteResponse {
    pub attest: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Quote operations
pub trait QuoteOps {
    /// Ask the TPM to sign the selected PCRs and the request nonce
    fn quote(&mut self, request: &QuoteRequest) -> Result<QuoteResponse, QuoteError>;
}

impl<T: TpmTransport> QuoteOps for Tpm<T> {
    fn quote(&mut self, request: &QuoteRequest) -> Result<QuoteResponse, QuoteError> {
        debug!(
            "TPM2_Quote: handle 0x{:08X}, {} bank(s), scheme {:?}, nonce {}",
            request.key_handle,
            request.selections.len(),
            request.scheme,
            hex::encode(&request.nonce)
        );
        let response = self.quote_inner(request)
            .context(format!("TPM2_Quote with key 0x{:08X} failed", request.key_handle))?;
        Ok(response)
    }
}

impl<T: TpmTransport> Tpm<T> {
    fn quote_inner(&mut self, request: &QuoteRequest) -> Result<QuoteResponse> {
        let body = self.transmit(&request.to_command())?;
        let mut resp = ResponseBuffer::new(&body);

        // When using sessions, response includes parameterSize before the actual data
        let parameter_size = resp.read_u32()? as usize;
        let param_start = resp.offset();
        if parameter_size > resp.remaining() {
            bail!("Quote parameterSize {} exceeds response body ({} bytes left)",
                  parameter_size, resp.remaining());
        }

        // quoted (TPM2B_ATTEST)
        let attest = resp.read_tpm2b()?;

        // signature (TPMT_SIGNATURE) runs to the end of the parameter area
        let consumed = resp.offset() - param_start;
        if consumed > parameter_size {
            bail!("Parameter size mismatch in Quote: TPM said {} bytes, attestation alone is {}",
                  parameter_size, consumed);
        }
        let signature = resp.read_bytes(parameter_size - consumed)?.to_vec();
        if signature.len() < 2 {
            bail!("Quote response carries no signature");
        }

        debug!("TPM2_Quote returned {} attestation bytes, {} signature bytes",
               attest.len(), signature.len());

        Ok(QuoteResponse { attest, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{response, MockTransport};

    fn sha256_pcr0() -> Vec<PcrSelection> {
        vec![PcrSelection::new(TpmAlg::Sha256, &[0]).unwrap()]
    }

    #[test]
    fn test_build_rejects_bad_nonce() {
        assert!(matches!(
            QuoteRequest::build(0x81010006, &[], sha256_pcr0(), SigScheme::Null),
            Err(QuoteError::InvalidNonce(_))
        ));
        assert!(matches!(
            QuoteRequest::build(0x81010006, &[0u8; 65], sha256_pcr0(), SigScheme::Null),
            Err(QuoteError::InvalidNonce(_))
        ));
    }

    #[test]
    fn test_build_rejects_bad_selections() {
        assert!(matches!(
            QuoteRequest::build(0x81010006, &[1], vec![], SigScheme::Null),
            Err(QuoteError::InvalidSelection(_))
        ));
        let twice = vec![
            PcrSelection::new(TpmAlg::Sha256, &[0]).unwrap(),
            PcrSelection::new(TpmAlg::Sha256, &[1]).unwrap(),
        ];
        assert!(matches!(
            QuoteRequest::build(0x81010006, &[1], twice, SigScheme::Null),
            Err(QuoteError::InvalidSelection(_))
        ));
        let empty = vec![PcrSelection::from_bitmap(TpmAlg::Sha256, &[0, 0, 0])];
        assert!(matches!(
            QuoteRequest::build(0x81010006, &[1], empty, SigScheme::Null),
            Err(QuoteError::InvalidSelection(_))
        ));
    }

    #[test]
    fn test_generate_nonce() {
        let a = generate_nonce(32).unwrap();
        let b = generate_nonce(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(generate_nonce(0).is_err());
        assert!(generate_nonce(MAX_NONCE_SIZE + 1).is_err());
    }

    #[test]
    fn test_scheme_parse() {
        assert_eq!(SigScheme::parse("null").unwrap(), SigScheme::Null);
        assert_eq!(SigScheme::parse("ecdsa").unwrap(), SigScheme::EcDsa(TpmAlg::Sha256));
        assert_eq!(SigScheme::parse("rsapss:sha384").unwrap(), SigScheme::RsaPss(TpmAlg::Sha384));
        assert!(SigScheme::parse("ecdsa:ecc").is_err());
        assert!(SigScheme::parse("sha256").is_err());
    }

    #[test]
    fn test_command_layout() {
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        let req = QuoteRequest::build(0x81010006, &nonce, sha256_pcr0(), SigScheme::EcDsa(TpmAlg::Sha256)).unwrap();
        let cmd = req.to_command();

        let expected = CommandBuffer::new()
            .write_u16(0x8002) // TPM_ST_SESSIONS
            .write_u32(cmd.len() as u32)
            .write_u32(0x158) // TPM_CC_Quote
            .write_u32(0x81010006)
            .write_u32(9)
            .write_u32(0x40000009)
            .write_u16(0)
            .write_u8(0)
            .write_u16(0)
            .write_tpm2b(&nonce)
            .write_u16(0x0018)
            .write_u16(0x000B)
            .write_u32(1)
            .write_u16(0x000B)
            .write_u8(3)
            .write_bytes(&[0x01, 0x00, 0x00])
            .into_bytes();
        assert_eq!(cmd, expected);
    }

    #[test]
    fn test_quote_parses_response() {
        let attest = vec![0xFF, 0x54, 0x43, 0x47, 0x80, 0x18];
        let signature = CommandBuffer::new()
            .write_u16(0x0018)
            .write_u16(0x000B)
            .write_tpm2b(&[0x11; 32])
            .write_tpm2b(&[0x22; 32])
            .into_bytes();
        let params = CommandBuffer::new().write_tpm2b(&attest).write_bytes(&signature).into_bytes();
        let body = CommandBuffer::new()
            .write_u32(params.len() as u32)
            .write_bytes(&params)
            // response auth area: nonce, attributes, hmac
            .write_u16(0)
            .write_u8(1)
            .write_u16(0)
            .into_bytes();

        let mock = MockTransport::default().reply(response(TpmSt::Sessions, 0, &body));
        let mut tpm = Tpm::with_transport(mock);
        let req = QuoteRequest::build(0x81010006, &[9; 16], sha256_pcr0(), SigScheme::Null).unwrap();
        let out = tpm.quote(&req).unwrap();

        assert_eq!(out.attest, attest);
        assert_eq!(out.signature, signature);
        assert_eq!(tpm.into_transport().sent, vec![req.to_command()]);
    }

    #[test]
    fn test_quote_propagates_device_error() {
        let mock = MockTransport::default().fail("device unplugged");
        let mut tpm = Tpm::with_transport(mock);
        let req = QuoteRequest::build(0x81010006, &[9; 16], sha256_pcr0(), SigScheme::Null).unwrap();
        match tpm.quote(&req) {
            Err(QuoteError::Device(e)) => assert!(format!("{:#}", e).contains("device unplugged")),
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[test]
    fn test_quote_rejects_tpm_error_code() {
        // TPM_RC_HANDLE for parameter 1
        let mock = MockTransport::default().reply(response(TpmSt::NoSessions, 0x0000_018B, &[]));
        let mut tpm = Tpm::with_transport(mock);
        let req = QuoteRequest::build(0x81010006, &[9; 16], sha256_pcr0(), SigScheme::Null).unwrap();
        let err = tpm.quote(&req).unwrap_err();
        assert!(matches!(err, QuoteError::Device(_)));
        assert!(err.to_string().contains("0x0000018B"));
    }

    #[test]
    fn test_quote_rejects_oversized_parameter_area() {
        let body = CommandBuffer::new().write_u32(100).write_tpm2b(&[0; 4]).into_bytes();
        let mock = MockTransport::default().reply(response(TpmSt::Sessions, 0, &body));
        let mut tpm = Tpm::with_transport(mock);
        let req = QuoteRequest::build(0x81010006, &[9; 16], sha256_pcr0(), SigScheme::Null).unwrap();
        assert!(matches!(tpm.quote(&req), Err(QuoteError::Device(_))));
    }
}
