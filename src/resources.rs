//! Translation of control-plane resource strings into container runtime
//! units. CPU limits become nanocpus, CPU requests become relative shares
//! (1 core = 1024), memory strings accept decimal (K/M/G/T) and binary
//! (Ki/Mi/Gi/Ti) suffixes.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// One full core expressed in the runtime's NanoCpus unit.
pub const NANO_CPUS_PER_CORE: i64 = 1_000_000_000;

/// Relative CPU weight of one full core.
pub const SHARES_PER_CORE: i64 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceParseError {
    #[error("invalid cpu value '{0}', expected cores ('2', '0.5') or millicores ('500m')")]
    InvalidCpu(String),
    #[error("invalid memory value '{0}', expected bytes with optional K/M/G/T or Ki/Mi/Gi/Ti suffix")]
    InvalidMemory(String),
}

fn memory_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*(K|M|G|T|Ki|Mi|Gi|Ti)?$").unwrap())
}

/// Parses a CPU quantity into fractional cores. `"500m"` is 0.5 cores,
/// `"2"` is 2 cores.
pub fn parse_cpu(value: &str) -> Result<f64, ResourceParseError> {
    let value = value.trim();
    let (number, millis) = match value.strip_suffix('m') {
        Some(rest) => (rest, true),
        None => (value, false),
    };
    let parsed: f64 = number
        .parse()
        .map_err(|_| ResourceParseError::InvalidCpu(value.to_string()))?;
    if parsed < 0.0 || !parsed.is_finite() {
        return Err(ResourceParseError::InvalidCpu(value.to_string()));
    }
    Ok(if millis { parsed / 1000.0 } else { parsed })
}

/// CPU limit in the runtime's NanoCpus unit.
pub fn cpu_limit_to_nano_cpus(value: &str) -> Result<i64, ResourceParseError> {
    Ok((parse_cpu(value)? * NANO_CPUS_PER_CORE as f64) as i64)
}

/// CPU request as a relative scheduling weight.
pub fn cpu_request_to_shares(value: &str) -> Result<i64, ResourceParseError> {
    Ok((parse_cpu(value)? * SHARES_PER_CORE as f64) as i64)
}

/// Parses a memory quantity into bytes. Decimal suffixes multiply by powers
/// of 1000, binary suffixes by powers of 1024, a bare number is raw bytes.
pub fn parse_memory(value: &str) -> Result<i64, ResourceParseError> {
    let value = value.trim();
    let captures = memory_regex()
        .captures(value)
        .ok_or_else(|| ResourceParseError::InvalidMemory(value.to_string()))?;
    let number: f64 = captures[1]
        .parse()
        .map_err(|_| ResourceParseError::InvalidMemory(value.to_string()))?;
    let multiplier: f64 = match captures.get(2).map(|m| m.as_str()) {
        None => 1.0,
        Some("K") => 1000f64,
        Some("M") => 1000f64.powi(2),
        Some("G") => 1000f64.powi(3),
        Some("T") => 1000f64.powi(4),
        Some("Ki") => 1024f64,
        Some("Mi") => 1024f64.powi(2),
        Some("Gi") => 1024f64.powi(3),
        Some("Ti") => 1024f64.powi(4),
        Some(other) => return Err(ResourceParseError::InvalidMemory(other.to_string())),
    };
    let bytes = number * multiplier;
    if bytes < 0.0 || !bytes.is_finite() {
        return Err(ResourceParseError::InvalidMemory(value.to_string()));
    }
    Ok(bytes as i64)
}
