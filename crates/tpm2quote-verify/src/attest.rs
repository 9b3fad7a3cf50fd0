// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPMS_ATTEST decoding for quote attestations

use log::debug;
use serde::Serialize;
use tpm2quote::pcr::{read_pcr_selection_list, SelectionListError};
use tpm2quote::{PcrSelection, ResponseBuffer, TpmSt, WireError, TPM_GENERATED_VALUE};

use crate::error::VerifyError;

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// TPMS_QUOTE_INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInfo {
    /// Banks in the order the TPM listed them
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

/// Decoded TPMS_ATTEST whose attested union holds a quote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationStructure {
    pub magic: u32,
    pub attest_type: u16,
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub attested: QuoteInfo,
}

fn truncated(e: WireError) -> VerifyError {
    VerifyError::MalformedAttestation(e.to_string())
}

/// Decode the attestation bytes returned by TPM2_Quote
///
/// Every field is big-endian. The whole buffer must be consumed: a
/// truncated or padded blob is rejected rather than partially decoded.
pub fn decode_attestation(raw: &[u8]) -> Result<AttestationStructure, VerifyError> {
    let mut buf = ResponseBuffer::new(raw);

    let magic = buf.read_u32().map_err(truncated)?;
    if magic != TPM_GENERATED_VALUE {
        return Err(VerifyError::MalformedAttestation(format!(
            "magic 0x{:08X} is not TPM_GENERATED_VALUE", magic
        )));
    }

    let attest_type = buf.read_u16().map_err(truncated)?;
    if attest_type != TpmSt::AttestQuote as u16 {
        return Err(VerifyError::MalformedAttestation(format!(
            "type 0x{:04X} is not TPM_ST_ATTEST_QUOTE", attest_type
        )));
    }

    let qualified_signer = read_sized(&mut buf, "qualifiedSigner")?;
    let extra_data = read_sized(&mut buf, "extraData")?;

    let clock_info = ClockInfo {
        clock: buf.read_u64().map_err(truncated)?,
        reset_count: buf.read_u32().map_err(truncated)?,
        restart_count: buf.read_u32().map_err(truncated)?,
        safe: match buf.read_u8().map_err(truncated)? {
            0 => false,
            1 => true,
            other => {
                return Err(VerifyError::MalformedAttestation(format!(
                    "clockInfo.safe is {}, expected YES or NO", other
                )))
            }
        },
    };

    let firmware_version = buf.read_u64().map_err(truncated)?;

    let pcr_selections = read_pcr_selection_list(&mut buf).map_err(|e| match e {
        SelectionListError::Wire(w) => VerifyError::MalformedAttestation(format!("pcrSelect: {}", w)),
        SelectionListError::Invalid(msg) => VerifyError::MalformedAttestation(format!("pcrSelect: {}", msg)),
    })?;
    let pcr_digest = read_sized(&mut buf, "pcrDigest")?;

    if buf.remaining() != 0 {
        return Err(VerifyError::MalformedAttestation(format!(
            "{} trailing bytes after pcrDigest", buf.remaining()
        )));
    }

    debug!(
        "Decoded quote: {} bank(s), digest {}, extraData {}, reset {} restart {}",
        pcr_selections.len(),
        hex::encode(&pcr_digest),
        hex::encode(&extra_data),
        clock_info.reset_count,
        clock_info.restart_count
    );

    Ok(AttestationStructure {
        magic,
        attest_type,
        qualified_signer,
        extra_data,
        clock_info,
        firmware_version,
        attested: QuoteInfo {
            pcr_selections,
            pcr_digest,
        },
    })
}

fn read_sized(buf: &mut ResponseBuffer<'_>, field: &str) -> Result<Vec<u8>, VerifyError> {
    buf.read_tpm2b()
        .map_err(|e| VerifyError::MalformedAttestation(format!("{}: {}", field, e)))
}

/// JSON view of a decoded quote, byte fields hex-encoded
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationReport {
    pub magic: String,
    #[serde(rename = "type")]
    pub attest_type: String,
    pub qualified_signer: String,
    pub extra_data: String,
    pub clock_info: ClockInfoReport,
    pub firmware_version: String,
    pub attested: AttestedReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockInfoReport {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

#[derive(Debug, Serialize)]
pub struct AttestedReport {
    pub quote: QuoteReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteReport {
    pub pcr_select: Vec<PcrSelectReport>,
    pub pcr_digest: String,
}

#[derive(Debug, Serialize)]
pub struct PcrSelectReport {
    pub hash: &'static str,
    pub pcrs: Vec<u8>,
}

impl AttestationStructure {
    pub fn report(&self) -> AttestationReport {
        AttestationReport {
            magic: format!("{:08x}", self.magic),
            attest_type: format!("{:04x}", self.attest_type),
            qualified_signer: hex::encode(&self.qualified_signer),
            extra_data: hex::encode(&self.extra_data),
            clock_info: ClockInfoReport {
                clock: self.clock_info.clock,
                reset_count: self.clock_info.reset_count,
                restart_count: self.clock_info.restart_count,
                safe: self.clock_info.safe,
            },
            firmware_version: format!("{:016x}", self.firmware_version),
            attested: AttestedReport {
                quote: QuoteReport {
                    pcr_select: self.attested.pcr_selections.iter()
                        .map(|s| PcrSelectReport {
                            hash: s.hash_alg().name(),
                            pcrs: s.indices().collect(),
                        })
                        .collect(),
                    pcr_digest: hex::encode(&self.attested.pcr_digest),
                },
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.report())
    }
}
