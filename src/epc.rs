use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Epc(Vec<u8>);

impl Epc {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn from_hex_str(s: &str) -> Result<Self, String> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() % 2 != 0 {
            return Err("EPCs must be an even, non-zero number of hex characters".to_string());
        }

        let bytes = trimmed
            .as_bytes()
            .chunks(2)
            .map(std::str::from_utf8)
            .map(|chunk| chunk.map_err(|err| err.to_string()))
            .map(|res| {
                res.and_then(|hex| u8::from_str_radix(hex, 16).map_err(|err| err.to_string()))
            })
            .collect::<Result<Vec<u8>, String>>()?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Epc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for Epc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Epc::from_hex_str(s)
    }
}

impl Serialize for Epc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Epc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Epc::from_hex_str(&s).map_err(serde::de::Error::custom)
    }
}
