// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal TPM 2.0 quote implementation
//!
//! Talks to the TPM via /dev/tpmrm0 (or any transport) without C dependencies.
//! Only the commands an attestation quote needs are implemented: TPM2_Quote
//! and TPM2_PCR_Read. Everything is marshaled by hand in the big-endian
//! TPM wire format.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::str::FromStr;

pub mod error;
pub mod pcr;
pub mod quote;

pub use error::{QuoteError, WireError};
pub use pcr::{PcrOps, PcrSelection, PcrValues, PCR_COUNT};
pub use quote::{generate_nonce, QuoteOps, QuoteRequest, QuoteResponse, SigScheme, MAX_NONCE_SIZE};

/// Default resource-managed TPM device
pub const DEFAULT_DEVICE: &str = "/dev/tpmrm0";

/// TPM 2.0 command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum TpmCc {
    Quote = 0x00000158,
    PcrRead = 0x0000017E,
}

/// TPM 2.0 structure tags
#[repr(u16)]
#[derive(Debug, Clone, Copy)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    AttestQuote = 0x8018,
}

/// TPM 2.0 return codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TpmRc {
    Success = 0x000,
}

/// TPM_GENERATED_VALUE, prefixed to every structure the TPM signs
pub const TPM_GENERATED_VALUE: u32 = 0xFF544347;

/// Password authorization session handle
pub const TPM_RS_PW: u32 = 0x40000009;

/// TPM 2.0 algorithm identifiers
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TpmAlg {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    EcDsa = 0x0018,
    Ecc = 0x0023,
}

impl TpmAlg {
    /// Get the digest size in bytes for hash algorithms
    pub fn digest_size(&self) -> Option<usize> {
        match self {
            TpmAlg::Sha1 => Some(20),
            TpmAlg::Sha256 => Some(32),
            TpmAlg::Sha384 => Some(48),
            TpmAlg::Sha512 => Some(64),
            _ => None,
        }
    }

    pub fn is_hash(&self) -> bool {
        self.digest_size().is_some()
    }

    /// Get the algorithm name as a string
    pub fn name(&self) -> &'static str {
        match self {
            TpmAlg::Rsa => "rsa",
            TpmAlg::Sha1 => "sha1",
            TpmAlg::Hmac => "hmac",
            TpmAlg::Sha256 => "sha256",
            TpmAlg::Sha384 => "sha384",
            TpmAlg::Sha512 => "sha512",
            TpmAlg::Null => "null",
            TpmAlg::RsaSsa => "rsassa",
            TpmAlg::RsaPss => "rsapss",
            TpmAlg::EcDsa => "ecdsa",
            TpmAlg::Ecc => "ecc",
        }
    }

    /// Try to convert a u16 to a TpmAlg
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0001 => Some(TpmAlg::Rsa),
            0x0004 => Some(TpmAlg::Sha1),
            0x0005 => Some(TpmAlg::Hmac),
            0x000B => Some(TpmAlg::Sha256),
            0x000C => Some(TpmAlg::Sha384),
            0x000D => Some(TpmAlg::Sha512),
            0x0010 => Some(TpmAlg::Null),
            0x0014 => Some(TpmAlg::RsaSsa),
            0x0016 => Some(TpmAlg::RsaPss),
            0x0018 => Some(TpmAlg::EcDsa),
            0x0023 => Some(TpmAlg::Ecc),
            _ => None,
        }
    }
}

impl FromStr for TpmAlg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let alg = match s.to_ascii_lowercase().replace('-', "").as_str() {
            "rsa" => TpmAlg::Rsa,
            "sha1" => TpmAlg::Sha1,
            "hmac" => TpmAlg::Hmac,
            "sha256" => TpmAlg::Sha256,
            "sha384" => TpmAlg::Sha384,
            "sha512" => TpmAlg::Sha512,
            "null" => TpmAlg::Null,
            "rsassa" => TpmAlg::RsaSsa,
            "rsapss" => TpmAlg::RsaPss,
            "ecdsa" => TpmAlg::EcDsa,
            "ecc" => TpmAlg::Ecc,
            other => bail!("Unknown TPM algorithm: {}", other),
        };
        Ok(alg)
    }
}

/// TPM 2.0 command header
#[derive(Debug)]
struct TpmCommandHeader {
    tag: TpmSt,
    size: u32,
    code: TpmCc,
}

impl TpmCommandHeader {
    fn new(tag: TpmSt, size: u32, code: TpmCc) -> Self {
        Self { tag, size, code }
    }

    fn to_bytes(&self) -> [u8; 10] {
        let mut bytes = [0u8; 10];
        bytes[0..2].copy_from_slice(&(self.tag as u16).to_be_bytes());
        bytes[2..6].copy_from_slice(&self.size.to_be_bytes());
        bytes[6..10].copy_from_slice(&(self.code as u32).to_be_bytes());
        bytes
    }
}

/// TPM 2.0 response header
#[derive(Debug)]
pub struct TpmResponseHeader {
    pub tag: u16,
    pub size: u32,
    pub code: u32,
}

impl TpmResponseHeader {
    /// Parse a response header from a 10-byte buffer
    fn from_bytes(bytes: &[u8; 10]) -> Self {
        let tag = u16::from_be_bytes([bytes[0], bytes[1]]);
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let code = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Self { tag, size, code }
    }
}

/// Builder for big-endian TPM structures
///
/// Used for command bodies, and by tests to craft the structures a TPM
/// would return.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn write_u8(mut self, val: u8) -> Self {
        self.data.push(val);
        self
    }

    pub fn write_u16(mut self, val: u16) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_u32(mut self, val: u32) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_u64(mut self, val: u64) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Write a TPM2B (size-prefixed buffer)
    pub fn write_tpm2b(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.data.extend_from_slice(bytes);
        self
    }

    fn write_auth_empty_pw(self) -> Self {
        // Authorization area (password session with empty password)
        // Size = 4 (sessionHandle) + 2 (nonce) + 1 (attributes) + 2 (password) = 9 bytes
        self.write_u32(9) // authorizationSize
            .write_u32(TPM_RS_PW) // sessionHandle - password session
            .write_u16(0) // nonce - empty
            .write_u8(0) // sessionAttributes
            .write_u16(0) // password/hmac - empty
    }

    /// Raw bytes written so far, with no command header
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn finalize(mut self, tag: TpmSt, code: TpmCc) -> Vec<u8> {
        let total_size = 10 + self.data.len(); // header is 10 bytes
        let header = TpmCommandHeader::new(tag, total_size as u32, code);
        let mut result = Vec::with_capacity(total_size);
        result.extend_from_slice(&header.to_bytes());
        result.append(&mut self.data);
        result
    }
}

/// Cursor over a big-endian TPM structure
///
/// Borrows the bytes it reads; nothing is copied until a caller asks for
/// an owned TPM2B.
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError {
                wanted: len,
                offset: self.offset,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    /// Read a TPM2B (size-prefixed buffer)
    pub fn read_tpm2b(&mut self) -> Result<Vec<u8>, WireError> {
        let size = self.read_u16()? as usize;
        Ok(self.take(size)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Command channel to a TPM
///
/// Implementations send one marshaled command and return the complete
/// response, header included. Access to a single device must be serialized
/// by the caller; `&mut self` does that for in-process users.
pub trait TpmTransport {
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// TPM character device (/dev/tpm0, /dev/tpmrm0)
#[derive(Debug)]
pub struct DeviceFile {
    device: File,
}

impl DeviceFile {
    pub fn open(path: &str) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(format!("Failed to open TPM device at {}", path))?;

        Ok(Self { device })
    }
}

impl TpmTransport for DeviceFile {
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.device.write_all(command)
            .context("Failed to write TPM command")?;

        // Read response header first (10 bytes)
        let mut header_buf = [0u8; 10];
        self.device.read_exact(&mut header_buf)
            .context("Failed to read TPM response header")?;

        let header = TpmResponseHeader::from_bytes(&header_buf);
        if header.size < 10 {
            bail!("Invalid TPM response size: {}", header.size);
        }

        let mut response = vec![0u8; header.size as usize];
        response[..10].copy_from_slice(&header_buf);
        self.device.read_exact(&mut response[10..])
            .context("Failed to read TPM response body")?;

        Ok(response)
    }
}

/// TPM 2.0 device context
#[derive(Debug)]
pub struct Tpm<T = DeviceFile> {
    transport: T,
}

impl Tpm<DeviceFile> {
    /// Open the TPM device (defaults to /dev/tpmrm0)
    pub fn open() -> Result<Self> {
        Self::open_path(DEFAULT_DEVICE)
    }

    /// Open a specific TPM device path
    pub fn open_path(path: &str) -> Result<Self> {
        Ok(Self::with_transport(DeviceFile::open(path)?))
    }

    /// Open direct TPM device (/dev/tpm0), bypassing the resource manager
    pub fn open_direct() -> Result<Self> {
        Self::open_path("/dev/tpm0")
    }
}

impl<T: TpmTransport> Tpm<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send a command and receive response
    ///
    /// Returns the response body (without the header). A non-success
    /// response code is an error; its body is never handed to a parser.
    pub(crate) fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let response = self.transport.send_command(command)?;

        if response.len() < 10 {
            bail!("Truncated TPM response: {} bytes", response.len());
        }
        let mut header_buf = [0u8; 10];
        header_buf.copy_from_slice(&response[..10]);
        let header = TpmResponseHeader::from_bytes(&header_buf);

        if header.size as usize != response.len() {
            bail!("TPM response size mismatch: header says {} bytes, got {}",
                  header.size, response.len());
        }

        if header.code != TpmRc::Success as u32 {
            bail!("TPM command failed with code: 0x{:08X}", header.code);
        }

        Ok(response[10..].to_vec())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_alg_round_trip() {
        for alg in [TpmAlg::Sha1, TpmAlg::Sha256, TpmAlg::EcDsa, TpmAlg::RsaPss, TpmAlg::Null] {
            assert_eq!(TpmAlg::from_u16(alg as u16), Some(alg));
            assert_eq!(alg.name().parse::<TpmAlg>().unwrap(), alg);
        }
        assert_eq!(TpmAlg::from_u16(0x1234), None);
        assert_eq!("SHA-256".parse::<TpmAlg>().unwrap(), TpmAlg::Sha256);
        assert!("md5".parse::<TpmAlg>().is_err());
    }

    #[test]
    fn test_response_buffer_underflow() {
        let data = [0x00, 0x01, 0x02];
        let mut buf = ResponseBuffer::new(&data);
        assert_eq!(buf.read_u16().unwrap(), 0x0001);
        let err = buf.read_u16().unwrap_err();
        assert_eq!(err, WireError { wanted: 2, offset: 2, available: 1 });
        // A failed read does not advance the cursor
        assert_eq!(buf.read_u8().unwrap(), 0x02);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_tpm2b_claims_more_than_available() {
        let data = [0x00, 0x05, 0xAA, 0xBB];
        let mut buf = ResponseBuffer::new(&data);
        assert!(buf.read_tpm2b().is_err());
    }

    #[test]
    fn test_transmit_rejects_error_code() {
        let mock = MockTransport::default().reply(response(TpmSt::NoSessions, 0x0000_0184, &[]));
        let mut tpm = Tpm::with_transport(mock);
        let err = tpm.transmit(&[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("0x00000184"));
    }

    #[test]
    fn test_transmit_rejects_size_mismatch() {
        let mut resp = response(TpmSt::NoSessions, 0, &[1, 2, 3]);
        resp.push(0xFF);
        let mock = MockTransport::default().reply(resp);
        let mut tpm = Tpm::with_transport(mock);
        assert!(tpm.transmit(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_transmit_strips_header() {
        let mock = MockTransport::default().reply(response(TpmSt::NoSessions, 0, &[9, 8, 7]));
        let mut tpm = Tpm::with_transport(mock);
        assert_eq!(tpm.transmit(&[0u8; 10]).unwrap(), vec![9, 8, 7]);
    }
}
