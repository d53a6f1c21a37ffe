//! CPU, memory and duration quantities as written in environment documents.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static CPU_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(m?)\s*$").unwrap());

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(-?\d+(?:\.\d+)?)\s*(b|k|kb|m|mb|g|gb|t|tb)?\s*$").unwrap()
});

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*(ms|s|m|h)\s*$").unwrap());

/// CPU amount in millicores (`1000` = one core).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuQuantity(pub u64);

/// Memory amount in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemoryQuantity(pub u64);

impl CpuQuantity {
    pub fn from_cores(cores: u64) -> Self {
        Self(cores * 1000)
    }

    pub fn millis(self) -> u64 {
        self.0
    }

    /// Decimal core count, as passed to `docker run --cpus`.
    pub fn as_cores(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl MemoryQuantity {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for CpuQuantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = CPU_RE
            .captures(s)
            .ok_or_else(|| format!("'{s}' is not a cpu quantity (e.g. 0.5, 2 or 500m)"))?;
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| format!("'{s}' is not a number"))?;
        let millis = if &caps[2] == "m" {
            value
        } else {
            value * 1000.0
        };
        if millis < 1.0 {
            return Err(format!("cpu quantity '{s}' must be positive"));
        }
        Ok(Self(millis.round() as u64))
    }
}

impl FromStr for MemoryQuantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MEMORY_RE
            .captures(s)
            .ok_or_else(|| format!("'{s}' is not a memory quantity (e.g. 512m or 2g)"))?;
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| format!("'{s}' is not a number"))?;
        let unit = caps
            .get(2)
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        let multiplier: f64 = match unit.as_str() {
            "" | "b" => 1.0,
            "k" | "kb" => 1024.0,
            "m" | "mb" => 1024.0 * 1024.0,
            "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
            _ => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        };
        let bytes = value * multiplier;
        if bytes < 1.0 {
            return Err(format!("memory quantity '{s}' must be positive"));
        }
        Ok(Self(bytes.round() as u64))
    }
}

impl fmt::Display for CpuQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl fmt::Display for MemoryQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u64); 4] = [
            ("t", 1 << 40),
            ("g", 1 << 30),
            ("m", 1 << 20),
            ("k", 1 << 10),
        ];
        for (suffix, size) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{suffix}", self.0 / size);
            }
        }
        write!(f, "{}b", self.0)
    }
}

macro_rules! serde_via_display {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = ScalarString::deserialize(deserializer)?;
                raw.0.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_display!(CpuQuantity);
serde_via_display!(MemoryQuantity);

/// Accepts a YAML string, number or bool and keeps its textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarString(pub String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Scalar {
            Str(String),
            Int(i64),
            Float(f64),
            Bool(bool),
        }
        Ok(match Scalar::deserialize(deserializer)? {
            Scalar::Str(s) => ScalarString(s),
            Scalar::Int(i) => ScalarString(i.to_string()),
            Scalar::Float(f) => ScalarString(f.to_string()),
            Scalar::Bool(b) => ScalarString(b.to_string()),
        })
    }
}

/// Parse `500ms`, `2s`, `1.5m` or `1h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let caps = DURATION_RE
        .captures(s)
        .ok_or_else(|| format!("'{s}' is not a duration (e.g. 500ms, 2s, 1m)"))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    let seconds = match &caps[2] {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        _ => value * 3600.0,
    };
    Ok(Duration::from_secs_f64(seconds))
}

pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 3_600_000 == 0 && millis > 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

/// `#[serde(with = "duration_str")]` for `Duration` fields.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cpu_cores_and_millis() {
        assert_eq!("2".parse::<CpuQuantity>().unwrap(), CpuQuantity(2000));
        assert_eq!("0.5".parse::<CpuQuantity>().unwrap(), CpuQuantity(500));
        assert_eq!("250m".parse::<CpuQuantity>().unwrap(), CpuQuantity(250));
    }

    #[test]
    fn cpu_rejects_zero_and_negative() {
        assert!("0".parse::<CpuQuantity>().is_err());
        assert!("-1".parse::<CpuQuantity>().is_err());
        assert!("lots".parse::<CpuQuantity>().is_err());
    }

    #[test]
    fn parse_memory_units() {
        assert_eq!("512m".parse::<MemoryQuantity>().unwrap(), MemoryQuantity(512 << 20));
        assert_eq!("2G".parse::<MemoryQuantity>().unwrap(), MemoryQuantity(2 << 30));
        assert_eq!("1.5gb".parse::<MemoryQuantity>().unwrap(), MemoryQuantity(3 << 29));
        assert_eq!("4096".parse::<MemoryQuantity>().unwrap(), MemoryQuantity(4096));
    }

    #[test]
    fn memory_rejects_negative() {
        let err = "-256m".parse::<MemoryQuantity>().unwrap_err();
        assert!(err.contains("positive"));
    }

    #[test]
    fn display_uses_largest_exact_unit() {
        assert_eq!(MemoryQuantity(256 << 20).to_string(), "256m");
        assert_eq!(MemoryQuantity(1500).to_string(), "1500b");
        assert_eq!(CpuQuantity(1500).to_string(), "1500m");
        assert_eq!(CpuQuantity(3000).to_string(), "3");
    }

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("soon").is_err());
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn quantities_deserialize_from_numbers() {
        let cpu: CpuQuantity = serde_yaml::from_str("2").unwrap();
        assert_eq!(cpu, CpuQuantity(2000));
        let mem: MemoryQuantity = serde_yaml::from_str("\"1g\"").unwrap();
        assert_eq!(mem, MemoryQuantity(1 << 30));
    }
}
