use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod addrdb;
pub mod config;
pub mod logging;
pub mod signal;
pub mod v6;

/// Lifetime sentinel meaning "never expires" (RFC 8415 infinity).
pub const INFINITY: u32 = 0xffff_ffff;

/// Seconds since the unix epoch. Lease timestamps and the snapshot header use
/// absolute wall-clock time so a restored database keeps aging correctly.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// DHCP Unique Identifier: an opaque byte string identifying a DHCP
/// participant across reboots and interface changes.
///
/// Rendered as colon-separated hex pairs in logs, config files and the lease
/// database snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Duid {
    pub bytes: Vec<u8>,
}

impl Duid {
    pub fn to_colon_string(&self) -> String {
        let mut s = String::with_capacity(self.bytes.len() * 3);
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                s.push(':');
            }
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Duid {
    fn from(bytes: Vec<u8>) -> Self {
        Duid { bytes }
    }
}

impl From<&[u8]> for Duid {
    fn from(bytes: &[u8]) -> Self {
        Duid {
            bytes: bytes.to_vec(),
        }
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

#[derive(Debug)]
pub struct ParseDuidError(String);

impl fmt::Display for ParseDuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid DUID `{}`: expected colon-separated hex pairs",
            self.0
        )
    }
}

impl std::error::Error for ParseDuidError {}

impl FromStr for Duid {
    type Err = ParseDuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseDuidError(s.into()));
        }
        let mut bytes = Vec::with_capacity(s.len() / 3 + 1);
        for pair in s.split(':') {
            if pair.len() != 2 {
                return Err(ParseDuidError(s.into()));
            }
            match u8::from_str_radix(pair, 16) {
                Ok(b) => bytes.push(b),
                Err(_) => return Err(ParseDuidError(s.into())),
            }
        }
        Ok(Duid { bytes })
    }
}

impl Serialize for Duid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_colon_string())
    }
}

impl<'de> Deserialize<'de> for Duid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duid_colon_string_round_trip() {
        let duid = Duid::from(vec![0x00, 0x01, 0x00, 0x01, 0xaa]);
        assert_eq!(duid.to_colon_string(), "00:01:00:01:aa");
        assert_eq!("00:01:00:01:aa".parse::<Duid>().unwrap(), duid);
    }

    #[test]
    fn duid_rejects_garbage() {
        assert!("".parse::<Duid>().is_err());
        assert!("0:1".parse::<Duid>().is_err());
        assert!("zz:aa".parse::<Duid>().is_err());
    }

    #[test]
    fn duid_json_is_colon_string() {
        let duid: Duid = serde_json::from_str(r#""00:11:22:33:44:55:66""#).unwrap();
        assert_eq!(duid.bytes, vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(
            serde_json::to_string(&duid).unwrap(),
            r#""00:11:22:33:44:55:66""#
        );
    }
}
