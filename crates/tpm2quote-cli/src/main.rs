// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use tpm2quote::{generate_nonce, PcrOps, PcrValues, QuoteOps, QuoteRequest, SigScheme, Tpm};
use tpm2quote_verify::{decode_attestation, verify, AkPublicKey};

mod config;

use config::{parse_handle, parse_pcr_bank, parse_pcr_values, pcr_values_map, Config, QuoteOutput};

const USAGE: &str = "\
Usage: tpm2quote <command> [options]

  quote   [--config FILE] [--device PATH] [--handle HEX] [--pcrs ALG:I,J,...]...
          [--scheme null|rsassa|rsapss|ecdsa[:HASH]] [--nonce HEX]
          Ask the TPM for a quote and print it as JSON

  verify  --quote FILE --ak FILE --pcr-values FILE --nonce HEX
          Check a quote printed by `quote`; exits non-zero unless every check passes.
          --nonce is the value the verifier issued, not the one in the quote file.

  pcrs    [--config FILE] [--device PATH] [--pcrs ALG:I,J,...]...
          Read PCR values from the TPM and print them in the --pcr-values format

  decode  --attest HEX
          Print a TPMS_ATTEST as JSON

Logging goes to stderr; set RUST_LOG=debug for decoded fields and per-check results.";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let result = main_inner();

    // stdout carries the JSON result, flush it before reporting failure
    let _ = io::stdout().flush();

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        let _ = io::stderr().flush();
        std::process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let rest = args.get(2..).unwrap_or(&[]);
    match args.get(1).map(String::as_str) {
        Some("quote") => quote(&Flags::parse(rest, &["--config", "--device", "--handle", "--pcrs", "--scheme", "--nonce"])?),
        Some("verify") => verify_quote_file(&Flags::parse(rest, &["--quote", "--ak", "--pcr-values", "--nonce"])?),
        Some("pcrs") => read_pcrs(&Flags::parse(rest, &["--config", "--device", "--pcrs"])?),
        Some("decode") => decode(&Flags::parse(rest, &["--attest"])?),
        _ => Err(anyhow!(USAGE)),
    }
}

/// `--flag value` pairs; a flag may repeat
struct Flags {
    values: HashMap<String, Vec<String>>,
}

impl Flags {
    fn parse(args: &[String], allowed: &[&str]) -> Result<Self> {
        let mut values: HashMap<String, Vec<String>> = HashMap::new();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            if !allowed.contains(&flag.as_str()) {
                return Err(anyhow!("Unknown argument {:?}\n\n{}", flag, USAGE));
            }
            let value = iter.next().ok_or_else(|| anyhow!("{} needs a value", flag))?;
            values.entry(flag.clone()).or_default().push(value.clone());
        }
        Ok(Self { values })
    }

    /// Last occurrence wins
    fn get(&self, flag: &str) -> Option<&str> {
        self.values.get(flag).and_then(|v| v.last()).map(String::as_str)
    }

    fn all(&self, flag: &str) -> &[String] {
        self.values.get(flag).map(Vec::as_slice).unwrap_or(&[])
    }

    fn require(&self, flag: &str) -> Result<&str> {
        self.get(flag).ok_or_else(|| anyhow!("Missing required {}\n\n{}", flag, USAGE))
    }
}

fn load_config(flags: &Flags) -> Result<Config> {
    let mut config = match flags.get("--config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(device) = flags.get("--device") {
        config.device = device.to_string();
    }
    if let Some(handle) = flags.get("--handle") {
        config.key_handle = parse_handle(handle)?;
    }
    let pcrs = flags.all("--pcrs");
    if !pcrs.is_empty() {
        config.pcrs = pcrs.iter().map(|s| parse_pcr_bank(s)).collect::<Result<_>>()?;
    }
    if let Some(scheme) = flags.get("--scheme") {
        config.scheme = SigScheme::parse(scheme)?;
    }

    debug!("Effective config: {:?}", config);
    Ok(config)
}

fn quote(flags: &Flags) -> Result<()> {
    let config = load_config(flags)?;

    let nonce = match flags.get("--nonce") {
        Some(hex_nonce) => hex::decode(hex_nonce).context("--nonce is not hex")?,
        None => generate_nonce(config.nonce_size)?,
    };
    let request = QuoteRequest::build(config.key_handle, &nonce, config.selections()?, config.scheme)?;

    let mut tpm = Tpm::open_path(&config.device)
        .with_context(|| format!("Failed to open TPM at {}", config.device))?;
    let response = tpm.quote(&request)?;
    info!("Quote: {} byte attestation, {} byte signature",
          response.attest.len(), response.signature.len());

    let decoded = decode_attestation(&response.attest)
        .context("TPM returned an undecodable attestation")?;

    let output = QuoteOutput {
        nonce: hex::encode(&nonce),
        attest: hex::encode(&response.attest),
        signature: hex::encode(&response.signature),
        quote: Some(decoded.report()),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn verify_quote_file(flags: &Flags) -> Result<()> {
    let quote_path = flags.require("--quote")?;
    let ak_path = flags.require("--ak")?;
    let pcr_path = flags.require("--pcr-values")?;
    let nonce_hex = flags.require("--nonce")?;

    let quote_json = fs::read_to_string(quote_path)
        .with_context(|| format!("Failed to read quote {}", quote_path))?;
    let quote: QuoteOutput<serde_json::Value> = serde_json::from_str(&quote_json)
        .with_context(|| format!("Invalid quote file {}", quote_path))?;

    let ak_bytes = fs::read(ak_path).with_context(|| format!("Failed to read AK {}", ak_path))?;
    let ak = AkPublicKey::parse(&ak_bytes).with_context(|| format!("Failed to load AK {}", ak_path))?;

    let pcr_json = fs::read_to_string(pcr_path)
        .with_context(|| format!("Failed to read PCR values {}", pcr_path))?;
    let expected_pcrs = parse_pcr_values(&pcr_json)?;

    let nonce = hex::decode(nonce_hex).context("--nonce is not hex")?;
    if quote.nonce != nonce_hex.to_ascii_lowercase() {
        debug!("Quote file records nonce {}, expecting {}", quote.nonce, nonce_hex);
    }
    let attest = hex::decode(&quote.attest).context("attest is not hex")?;
    let signature = hex::decode(&quote.signature).context("signature is not hex")?;

    info!("Verifying with {} AK, {} expected PCR value(s)", ak.algorithm_name(), expected_pcrs.len());
    let result = verify(&attest, &signature, &nonce, &expected_pcrs, &ak)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    result.into_result()?;
    Ok(())
}

fn read_pcrs(flags: &Flags) -> Result<()> {
    let config = load_config(flags)?;
    let selections = config.selections()?;

    let mut tpm = Tpm::open_path(&config.device)
        .with_context(|| format!("Failed to open TPM at {}", config.device))?;
    let mut values = PcrValues::new();
    for selection in &selections {
        let bank = tpm.pcr_read(selection)
            .with_context(|| format!("Failed to read {} PCRs", selection.hash_alg().name()))?;
        for (alg, index, value) in bank.iter() {
            values.insert(alg, index, value.to_vec());
        }
    }

    println!("{}", serde_json::to_string_pretty(&pcr_values_map(&values))?);
    Ok(())
}

fn decode(flags: &Flags) -> Result<()> {
    let raw = hex::decode(flags.require("--attest")?).context("--attest is not hex")?;
    println!("{}", decode_attestation(&raw)?.to_json()?);
    Ok(())
}
