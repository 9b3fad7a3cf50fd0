// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{anyhow, Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use tpm2quote::{PcrSelection, PcrValues, SigScheme, TpmAlg, DEFAULT_DEVICE};

const DEFAULT_KEY_HANDLE: u32 = 0x81010006;
const DEFAULT_NONCE_SIZE: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_key_handle", deserialize_with = "deserialize_handle")]
    pub key_handle: u32,
    #[serde(default = "default_pcrs")]
    pub pcrs: Vec<PcrBank>,
    #[serde(default = "default_scheme", deserialize_with = "deserialize_scheme")]
    pub scheme: SigScheme,
    #[serde(default = "default_nonce_size")]
    pub nonce_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcrBank {
    #[serde(deserialize_with = "deserialize_alg")]
    pub alg: TpmAlg,
    pub indices: Vec<u8>,
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_key_handle() -> u32 {
    DEFAULT_KEY_HANDLE
}

fn default_pcrs() -> Vec<PcrBank> {
    vec![PcrBank { alg: TpmAlg::Sha256, indices: vec![0] }]
}

fn default_scheme() -> SigScheme {
    SigScheme::Null
}

fn default_nonce_size() -> usize {
    DEFAULT_NONCE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            key_handle: default_key_handle(),
            pcrs: default_pcrs(),
            scheme: default_scheme(),
            nonce_size: default_nonce_size(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config {}", path))
    }

    /// Validated selections, one per configured bank
    pub fn selections(&self) -> Result<Vec<PcrSelection>> {
        self.pcrs
            .iter()
            .map(|bank| PcrSelection::new(bank.alg, &bank.indices).map_err(anyhow::Error::from))
            .collect()
    }
}

fn deserialize_handle<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_handle(&s).map_err(D::Error::custom)
}

fn deserialize_scheme<'de, D>(deserializer: D) -> Result<SigScheme, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    SigScheme::parse(&s).map_err(|e| D::Error::custom(format!("{:#}", e)))
}

fn deserialize_alg<'de, D>(deserializer: D) -> Result<TpmAlg, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|e: anyhow::Error| D::Error::custom(format!("{:#}", e)))
}

/// Persistent key handle, hex with or without `0x`
pub fn parse_handle(s: &str) -> Result<u32> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid key handle {:?}: {}", s, e))
}

/// `--pcrs sha256:0,1,7`
pub fn parse_pcr_bank(s: &str) -> Result<PcrBank> {
    let (alg, list) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("PCR selection {:?} must look like ALG:I,J,...", s))?;
    let indices = list
        .split(',')
        .map(|i| i.trim().parse::<u8>().with_context(|| format!("Invalid PCR index {:?}", i)))
        .collect::<Result<Vec<_>>>()?;
    Ok(PcrBank { alg: alg.parse()?, indices })
}

/// Expected PCR values: `{ "sha256": { "0": "<hex>", ... } }`
pub fn parse_pcr_values(json: &str) -> Result<PcrValues> {
    let banks: BTreeMap<String, BTreeMap<String, String>> =
        serde_json::from_str(json).context("Invalid PCR values JSON")?;

    let mut values = PcrValues::new();
    for (alg_name, pcrs) in &banks {
        let alg: TpmAlg = alg_name.parse()?;
        let size = alg
            .digest_size()
            .ok_or_else(|| anyhow!("{} is not a PCR bank", alg_name))?;
        for (index, value) in pcrs {
            let index: u8 = index
                .parse()
                .with_context(|| format!("Invalid PCR index {:?} in bank {}", index, alg_name))?;
            let value = hex::decode(value)
                .with_context(|| format!("PCR {}:{} is not hex", alg_name, index))?;
            if value.len() != size {
                return Err(anyhow!(
                    "PCR {}:{} is {} bytes, expected {}",
                    alg_name, index, value.len(), size
                ));
            }
            values.insert(alg, index, value);
        }
    }
    Ok(values)
}

/// Inverse of [`parse_pcr_values`]
pub fn pcr_values_map(values: &PcrValues) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut banks: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (alg, index, value) in values.iter() {
        banks
            .entry(alg.name().to_string())
            .or_default()
            .insert(index.to_string(), hex::encode(value));
    }
    banks
}

/// What `quote` prints and `verify` reads back
#[derive(Debug, Serialize, Deserialize)]
pub struct QuoteOutput<R> {
    pub nonce: String,
    pub attest: String,
    pub signature: String,
    #[serde(default)]
    pub quote: Option<R>,
}
