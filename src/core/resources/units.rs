use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{Error, Result};

/// Gibibyte, the base unit for Kubernetes memory settings.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// One one-thousandth of a vCPU or hyperthread, Kubernetes' CPU unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Millicore(i64);

impl Millicore {
    pub fn from_millis(millis: i64) -> Self {
        Millicore(millis)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// The value as a fraction of a vCPU, the unit the optimizer speaks.
    pub fn to_vcpus(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Parse a JSON value holding either a quantity string or a vCPU number.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => s.parse(),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Millicore::from)
                .ok_or_else(|| Error::Configuration(format!("could not parse millicore value: {n}"))),
            other => Err(Error::Configuration(format!(
                "could not parse millicore value: {other}"
            ))),
        }
    }
}

impl From<f64> for Millicore {
    fn from(cores: f64) -> Self {
        Millicore((cores * 1000.0).round() as i64)
    }
}

impl FromStr for Millicore {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(millis) = s.strip_suffix('m') {
            let millis: i64 = millis
                .parse()
                .map_err(|_| Error::Configuration(format!("could not parse millicore value: {s}")))?;
            Ok(Millicore(millis))
        } else {
            let cores: f64 = s
                .parse()
                .map_err(|_| Error::Configuration(format!("could not parse millicore value: {s}")))?;
            Ok(Millicore::from(cores))
        }
    }
}

impl fmt::Display for Millicore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Serialize for Millicore {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Millicore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Millicore::from_value(&value).map_err(de::Error::custom)
    }
}

/// A byte count parsed from the short-suffix quantity notation Kubernetes
/// uses ("Ki", "Mi", "Gi", "Ti" and their decimal cousins, no trailing "B").
/// Bare numerics are interpreted as gibibytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShortByteSize(u64);

impl ShortByteSize {
    pub fn from_bytes(bytes: u64) -> Self {
        ShortByteSize(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn to_gib(&self) -> f64 {
        self.0 as f64 / GIB as f64
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => s.parse(),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(ShortByteSize::from)
                .ok_or_else(|| Error::Configuration(format!("could not parse byte size: {n}"))),
            other => Err(Error::Configuration(format!("could not parse byte size: {other}"))),
        }
    }

    /// Render as a Kubernetes quantity, preferring the largest binary unit
    /// that divides the value exactly.
    pub fn to_quantity(&self) -> String {
        const UNITS: [(&str, u64); 4] = [
            ("Ti", 1024 * 1024 * 1024 * 1024),
            ("Gi", GIB),
            ("Mi", 1024 * 1024),
            ("Ki", 1024),
        ];
        if self.0 > 0 {
            for (suffix, scale) in UNITS {
                if self.0 % scale == 0 {
                    return format!("{}{}", self.0 / scale, suffix);
                }
            }
        }
        format!("{}", self.0)
    }
}

impl From<f64> for ShortByteSize {
    fn from(gib: f64) -> Self {
        ShortByteSize((gib * GIB as f64).round() as u64)
    }
}

impl FromStr for ShortByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        const SUFFIXES: [(&str, u64); 8] = [
            ("ti", 1024 * 1024 * 1024 * 1024),
            ("gi", GIB),
            ("mi", 1024 * 1024),
            ("ki", 1024),
            ("t", 1_000_000_000_000),
            ("g", 1_000_000_000),
            ("m", 1_000_000),
            ("k", 1_000),
        ];

        let raw = s.trim().to_lowercase();
        let raw = raw.strip_suffix('b').unwrap_or(&raw);
        for (suffix, scale) in SUFFIXES {
            if let Some(number) = raw.strip_suffix(suffix) {
                let number: f64 = number.trim().parse().map_err(|_| {
                    Error::Configuration(format!("could not parse byte size: {s}"))
                })?;
                return Ok(ShortByteSize((number * scale as f64).round() as u64));
            }
        }

        // No recognized suffix: a bare string quantity is a raw byte count.
        let bytes: f64 = raw
            .parse()
            .map_err(|_| Error::Configuration(format!("could not parse byte size: {s}")))?;
        Ok(ShortByteSize(bytes.round() as u64))
    }
}

impl fmt::Display for ShortByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_quantity())
    }
}

impl Serialize for ShortByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_quantity())
    }
}

impl<'de> Deserialize<'de> for ShortByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        ShortByteSize::from_value(&value).map_err(de::Error::custom)
    }
}
