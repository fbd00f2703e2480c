//! Codec registry.
//!
//! Codecs are looked up by name (`"json"`, `"yaml"`), the same names used in
//! configuration files and on the command line.

use std::str::FromStr;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{BrokerError, BrokerResult};

/// Payload codec used to marshal outbound and unmarshal inbound messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    Yaml,
}

/// All registered codecs, for iteration.
pub const ALL_CODECS: &[Codec] = &[Codec::Json, Codec::Yaml];

impl Codec {
    /// Registry name of the codec.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Yaml => "yaml",
        }
    }

    /// Serialize a value into a payload.
    pub fn marshal<T>(&self, value: &T) -> BrokerResult<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        let encoded = match self {
            Codec::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Codec::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
        };
        encoded.map_err(|message| BrokerError::Encode {
            codec: self.name(),
            message,
        })
    }

    /// Deserialize a payload into a value of type `T`.
    pub fn unmarshal<T>(&self, data: &[u8]) -> BrokerResult<T>
    where
        T: DeserializeOwned,
    {
        let decoded = match self {
            Codec::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            Codec::Yaml => serde_yaml::from_slice(data).map_err(|e| e.to_string()),
        };
        decoded.map_err(|message| BrokerError::Decode {
            codec: self.name(),
            message,
        })
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = BrokerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let wanted = name.trim();
        ALL_CODECS
            .iter()
            .copied()
            .find(|codec| codec.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| BrokerError::Config(format!("unknown codec '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Hygrothermograph {
        humidity: f64,
        temperature: f64,
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!("json".parse::<Codec>().unwrap(), Codec::Json);
        assert_eq!(" YAML ".parse::<Codec>().unwrap(), Codec::Yaml);

        let err = "proto".parse::<Codec>().unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
        assert!(err.to_string().contains("proto"));
    }

    #[test]
    fn test_json_payload() {
        let msg = Hygrothermograph {
            humidity: 40.0,
            temperature: 21.5,
        };
        let payload = Codec::Json.marshal(&msg).unwrap();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"humidity":40.0,"temperature":21.5}"#
        );
        let back: Hygrothermograph = Codec::Json.unmarshal(&payload).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_yaml_payload() {
        let back: Hygrothermograph = Codec::Yaml
            .unmarshal(b"humidity: 55.0\ntemperature: 19.0\n")
            .unwrap();
        assert_eq!(
            back,
            Hygrothermograph {
                humidity: 55.0,
                temperature: 19.0
            }
        );
    }

    #[test]
    fn test_decode_failure_is_classified() {
        let err = Codec::Json
            .unmarshal::<Hygrothermograph>(b"not json")
            .unwrap_err();
        assert!(err.is_decode());
        assert!(err.to_string().contains("json"));
    }

    #[test]
    fn test_serde_names() {
        let codec: Codec = serde_json::from_str(r#""yaml""#).unwrap();
        assert_eq!(codec, Codec::Yaml);
        assert_eq!(Codec::default().to_string(), "json");
    }
}
