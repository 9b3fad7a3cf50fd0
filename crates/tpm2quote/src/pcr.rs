// SPDX-License-Identifier: MIT OR Apache-2.0

//! PCR selection model and TPM2_PCR_Read

use anyhow::{bail, Result};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::{CommandBuffer, QuoteError, ResponseBuffer, TpmAlg, TpmCc, TpmSt, Tpm, TpmTransport, WireError};

/// Number of PCRs in a bank (TPM PC Client profile)
pub const PCR_COUNT: u8 = 24;

/// Size of the pcrSelect bitmap this crate emits
pub const PCR_SELECT_MIN: usize = (PCR_COUNT as usize).div_ceil(8);

/// Largest pcrSelect bitmap accepted when decoding
pub const PCR_SELECT_MAX: usize = 4;

/// Upper bound on banks in a TPML_PCR_SELECTION
pub const HASH_COUNT: u32 = 16;

/// Selected PCRs of one bank (TPMS_PCR_SELECTION)
///
/// Indices are held in ascending order. The TPM encodes a selection as a
/// bitmap and concatenates PCR values lowest index first, so ascending order
/// is both the wire order and the digest order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PcrSelection {
    hash_alg: TpmAlg,
    indices: BTreeSet<u8>,
}

impl PcrSelection {
    /// Build a validated selection
    ///
    /// Fails if `indices` is empty, repeats an index, names a PCR outside the
    /// bank, or `hash_alg` is not a hash algorithm.
    pub fn new(hash_alg: TpmAlg, indices: &[u8]) -> Result<Self, QuoteError> {
        if !hash_alg.is_hash() {
            return Err(QuoteError::InvalidSelection(format!(
                "{} is not a PCR bank algorithm", hash_alg.name()
            )));
        }
        if indices.is_empty() {
            return Err(QuoteError::InvalidSelection(format!(
                "no PCRs selected in {} bank", hash_alg.name()
            )));
        }

        let mut set = BTreeSet::new();
        for &index in indices {
            if index >= PCR_COUNT {
                return Err(QuoteError::InvalidSelection(format!(
                    "PCR {} out of range for {} bank (0..{})", index, hash_alg.name(), PCR_COUNT
                )));
            }
            if !set.insert(index) {
                return Err(QuoteError::InvalidSelection(format!(
                    "PCR {} selected twice in {} bank", index, hash_alg.name()
                )));
            }
        }

        Ok(Self { hash_alg, indices: set })
    }

    /// Build a selection from a decoded pcrSelect bitmap
    ///
    /// Bit `n` of byte `b` selects PCR `8*b + n`. The result may be empty;
    /// TPMs echo empty banks in quote structures. Bits at or above
    /// `PCR_COUNT` are kept here; [`read_pcr_selection_list`] rejects them.
    pub fn from_bitmap(hash_alg: TpmAlg, bitmap: &[u8]) -> Self {
        let mut indices = BTreeSet::new();
        for (byte_idx, &byte) in bitmap.iter().enumerate() {
            for bit_idx in 0..8 {
                if byte & (1 << bit_idx) != 0 {
                    indices.insert((byte_idx * 8 + bit_idx) as u8);
                }
            }
        }
        Self { hash_alg, indices }
    }

    /// pcrSelect bitmap, at least `PCR_SELECT_MIN` bytes
    pub fn to_bitmap(&self) -> Vec<u8> {
        let highest = self.indices.iter().next_back().copied().unwrap_or(0) as usize;
        let mut bitmap = vec![0u8; PCR_SELECT_MIN.max(highest / 8 + 1)];
        for &index in &self.indices {
            bitmap[index as usize / 8] |= 1 << (index % 8);
        }
        bitmap
    }

    pub fn hash_alg(&self) -> TpmAlg {
        self.hash_alg
    }

    /// Selected indices, ascending
    pub fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        self.indices.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, index: u8) -> bool {
        self.indices.contains(&index)
    }
}

/// Append a TPML_PCR_SELECTION
pub fn write_pcr_selection_list(mut buf: CommandBuffer, selections: &[PcrSelection]) -> CommandBuffer {
    buf = buf.write_u32(selections.len() as u32);
    for selection in selections {
        let bitmap = selection.to_bitmap();
        buf = buf
            .write_u16(selection.hash_alg as u16)
            .write_u8(bitmap.len() as u8)
            .write_bytes(&bitmap);
    }
    buf
}

/// Error reading a TPML_PCR_SELECTION
#[derive(Debug, thiserror::Error)]
pub enum SelectionListError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("{0}")]
    Invalid(String),
}

/// Read a TPML_PCR_SELECTION, preserving bank order
///
/// Indices must be below `PCR_COUNT`.
pub fn read_pcr_selection_list(buf: &mut ResponseBuffer<'_>) -> Result<Vec<PcrSelection>, SelectionListError> {
    let count = buf.read_u32()?;
    if count > HASH_COUNT {
        return Err(SelectionListError::Invalid(format!(
            "PCR selection count {} exceeds {}", count, HASH_COUNT
        )));
    }

    let mut selections = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw_alg = buf.read_u16()?;
        let hash_alg = TpmAlg::from_u16(raw_alg)
            .filter(TpmAlg::is_hash)
            .ok_or_else(|| SelectionListError::Invalid(format!(
                "unknown PCR bank algorithm 0x{:04X}", raw_alg
            )))?;

        let size_of_select = buf.read_u8()? as usize;
        if size_of_select > PCR_SELECT_MAX {
            return Err(SelectionListError::Invalid(format!(
                "sizeofSelect {} exceeds {}", size_of_select, PCR_SELECT_MAX
            )));
        }
        let bitmap = buf.read_bytes(size_of_select)?;
        if let Some(index) = PcrSelection::from_bitmap(hash_alg, bitmap)
            .indices()
            .find(|&index| index >= PCR_COUNT)
        {
            return Err(SelectionListError::Invalid(format!(
                "PCR {} out of range for {} bank (0..{})", index, hash_alg.name(), PCR_COUNT
            )));
        }
        selections.push(PcrSelection::from_bitmap(hash_alg, bitmap));
    }

    Ok(selections)
}

/// Caller-held PCR values, keyed by bank and index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrValues {
    values: BTreeMap<(TpmAlg, u8), Vec<u8>>,
}

impl PcrValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value, returning the one it replaces
    pub fn insert(&mut self, alg: TpmAlg, index: u8, value: Vec<u8>) -> Option<Vec<u8>> {
        self.values.insert((alg, index), value)
    }

    pub fn get(&self, alg: TpmAlg, index: u8) -> Option<&[u8]> {
        self.values.get(&(alg, index)).map(Vec::as_slice)
    }

    /// Values ordered by bank, then index
    pub fn iter(&self) -> impl Iterator<Item = (TpmAlg, u8, &[u8])> + '_ {
        self.values.iter().map(|((alg, idx), v)| (*alg, *idx, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Concatenate the values a selection list covers, in digest order
    ///
    /// Returns the first (bank, index) with no recorded value on failure.
    pub fn concat(&self, selections: &[PcrSelection]) -> Result<Vec<u8>, (TpmAlg, u8)> {
        let mut out = Vec::new();
        for selection in selections {
            for index in selection.indices() {
                let value = self.get(selection.hash_alg, index)
                    .ok_or((selection.hash_alg, index))?;
                out.extend_from_slice(value);
            }
        }
        Ok(out)
    }
}

/// PCR operations
pub trait PcrOps {
    /// Read every PCR a selection names
    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<PcrValues>;
}

impl<T: TpmTransport> PcrOps for Tpm<T> {
    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<PcrValues> {
        let mut values = PcrValues::new();
        let mut pending: Vec<u8> = selection.indices().collect();

        // The TPM returns at most eight digests per call
        while !pending.is_empty() {
            let request = PcrSelection {
                hash_alg: selection.hash_alg,
                indices: pending.iter().copied().collect(),
            };
            let command = write_pcr_selection_list(CommandBuffer::new(), std::slice::from_ref(&request))
                .finalize(TpmSt::NoSessions, TpmCc::PcrRead);
            let body = self.transmit(&command)?;
            let mut resp = ResponseBuffer::new(&body);

            let _update_counter = resp.read_u32()?;
            let returned = read_pcr_selection_list(&mut resp)?;
            let digest_count = resp.read_u32()? as usize;

            let returned_indices: Vec<u8> = returned.iter()
                .filter(|s| s.hash_alg == selection.hash_alg)
                .flat_map(|s| s.indices().collect::<Vec<_>>())
                .collect();
            if returned_indices.is_empty() {
                bail!("TPM returned no {} PCR values for {:?}", selection.hash_alg.name(), pending);
            }
            if returned_indices.len() != digest_count {
                bail!("PCR_Read returned {} digests for {} selected PCRs",
                      digest_count, returned_indices.len());
            }

            let before = pending.len();
            for index in returned_indices {
                let digest = resp.read_tpm2b()?;
                debug!("PCR {}:{} = {}", selection.hash_alg.name(), index, hex::encode(&digest));
                values.insert(selection.hash_alg, index, digest);
                pending.retain(|&i| i != index);
            }
            if pending.len() == before {
                bail!("PCR_Read made no progress, still missing {:?}", pending);
            }
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{response, MockTransport};

    #[test]
    fn test_new_rejects_invalid() {
        assert!(matches!(PcrSelection::new(TpmAlg::Sha256, &[]), Err(QuoteError::InvalidSelection(_))));
        assert!(matches!(PcrSelection::new(TpmAlg::Sha256, &[1, 1]), Err(QuoteError::InvalidSelection(_))));
        assert!(matches!(PcrSelection::new(TpmAlg::Sha256, &[24]), Err(QuoteError::InvalidSelection(_))));
        assert!(matches!(PcrSelection::new(TpmAlg::EcDsa, &[0]), Err(QuoteError::InvalidSelection(_))));
        assert!(PcrSelection::new(TpmAlg::Sha1, &[0, 23]).is_ok());
    }

    #[test]
    fn test_equality_ignores_input_order() {
        let a = PcrSelection::new(TpmAlg::Sha256, &[7, 0, 4]).unwrap();
        let b = PcrSelection::new(TpmAlg::Sha256, &[0, 4, 7]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.indices().collect::<Vec<_>>(), vec![0, 4, 7]);
        assert_ne!(a, PcrSelection::new(TpmAlg::Sha1, &[0, 4, 7]).unwrap());
    }

    #[test]
    fn test_bitmap() {
        let sel = PcrSelection::new(TpmAlg::Sha256, &[0, 1, 9, 23]).unwrap();
        assert_eq!(sel.to_bitmap(), vec![0b0000_0011, 0b0000_0010, 0b1000_0000]);
        assert_eq!(PcrSelection::from_bitmap(TpmAlg::Sha256, &sel.to_bitmap()), sel);
    }

    #[test]
    fn test_selection_list_round_trip_keeps_order() {
        let selections = vec![
            PcrSelection::new(TpmAlg::Sha384, &[23, 2]).unwrap(),
            PcrSelection::new(TpmAlg::Sha1, &[0]).unwrap(),
            PcrSelection::new(TpmAlg::Sha256, &[16, 3, 10]).unwrap(),
        ];
        let bytes = write_pcr_selection_list(CommandBuffer::new(), &selections).into_bytes();
        let mut buf = ResponseBuffer::new(&bytes);
        let decoded = read_pcr_selection_list(&mut buf).unwrap();
        assert_eq!(decoded, selections);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_selection_list_rejects_garbage() {
        let bytes = CommandBuffer::new().write_u32(1).write_u16(0x0018).write_u8(3).write_bytes(&[1, 0, 0]).into_bytes();
        assert!(matches!(
            read_pcr_selection_list(&mut ResponseBuffer::new(&bytes)),
            Err(SelectionListError::Invalid(_))
        ));

        let bytes = CommandBuffer::new().write_u32(1).write_u16(0x000B).write_u8(3).write_bytes(&[1]).into_bytes();
        assert!(matches!(
            read_pcr_selection_list(&mut ResponseBuffer::new(&bytes)),
            Err(SelectionListError::Wire(_))
        ));
    }

    #[test]
    fn test_selection_list_rejects_index_past_pcr_count() {
        // Four bitmap bytes fit in PCR_SELECT_MAX but bit 24 names no PCR
        let bytes = CommandBuffer::new().write_u32(1).write_u16(0x000B).write_u8(4).write_bytes(&[0, 0, 0, 1]).into_bytes();
        assert!(matches!(
            read_pcr_selection_list(&mut ResponseBuffer::new(&bytes)),
            Err(SelectionListError::Invalid(_))
        ));

        let bytes = CommandBuffer::new().write_u32(1).write_u16(0x000B).write_u8(4).write_bytes(&[0x80, 0, 0x80, 0]).into_bytes();
        let decoded = read_pcr_selection_list(&mut ResponseBuffer::new(&bytes)).unwrap();
        assert_eq!(decoded[0].indices().collect::<Vec<_>>(), vec![7, 23]);
    }

    #[test]
    fn test_concat_reports_missing_value() {
        let sel = PcrSelection::new(TpmAlg::Sha256, &[0, 1]).unwrap();
        let mut values = PcrValues::new();
        values.insert(TpmAlg::Sha256, 1, vec![0x11; 32]);
        values.insert(TpmAlg::Sha256, 0, vec![0x00; 32]);
        let concat = values.concat(std::slice::from_ref(&sel)).unwrap();
        assert_eq!(&concat[..32], &[0x00; 32]);
        assert_eq!(&concat[32..], &[0x11; 32]);

        let sel = PcrSelection::new(TpmAlg::Sha256, &[0, 2]).unwrap();
        assert_eq!(values.concat(&[sel]), Err((TpmAlg::Sha256, 2)));
    }

    #[test]
    fn test_pcr_read_loops_until_complete() {
        let sel = PcrSelection::new(TpmAlg::Sha256, &[0, 1, 2]).unwrap();

        let first = write_pcr_selection_list(
            CommandBuffer::new().write_u32(7),
            &[PcrSelection::new(TpmAlg::Sha256, &[0, 1]).unwrap()],
        )
        .write_u32(2)
        .write_tpm2b(&[0xA0; 32])
        .write_tpm2b(&[0xA1; 32])
        .into_bytes();
        let second = write_pcr_selection_list(
            CommandBuffer::new().write_u32(7),
            &[PcrSelection::new(TpmAlg::Sha256, &[2]).unwrap()],
        )
        .write_u32(1)
        .write_tpm2b(&[0xA2; 32])
        .into_bytes();

        let mock = MockTransport::default()
            .reply(response(TpmSt::NoSessions, 0, &first))
            .reply(response(TpmSt::NoSessions, 0, &second));
        let mut tpm = Tpm::with_transport(mock);
        let values = tpm.pcr_read(&sel).unwrap();

        assert_eq!(values.len(), 3);
        assert_eq!(values.get(TpmAlg::Sha256, 2), Some(&[0xA2; 32][..]));
        assert_eq!(tpm.into_transport().sent.len(), 2);
    }
}
