use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ALGORITHM_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

/// A validated `sha256:<64 lowercase hex>` content digest.
///
/// Construction always goes through [`Digest::parse`], so a `Digest` held
/// anywhere in the program is known to be well formed before it reaches a
/// URL or a file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let hex = s
            .strip_prefix(ALGORITHM_PREFIX)
            .ok_or_else(|| SchemaError::InvalidDigest(s.to_owned()))?;
        Self::from_hex(hex).map_err(|_| SchemaError::InvalidDigest(s.to_owned()))
    }

    /// Build a digest from the bare hex part (e.g. a freshly computed hash).
    pub fn from_hex(hex: &str) -> Result<Self, SchemaError> {
        let valid = hex.len() == HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self {
                hex: hex.to_owned(),
            })
        } else {
            Err(SchemaError::InvalidDigest(format!("{ALGORITHM_PREFIX}{hex}")))
        }
    }

    /// Wrap a raw sha256 output.
    pub fn from_sha256(bytes: [u8; 32]) -> Self {
        Self {
            hex: hex::encode(bytes),
        }
    }

    #[inline]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First 12 hex characters, for log lines and progress output.
    #[inline]
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM_PREFIX}{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    #[test]
    fn parse_valid_digest() {
        let d = Digest::parse(GOOD).unwrap();
        assert_eq!(d.to_string(), GOOD);
        assert_eq!(d.short(), "a3ed95caeb02");
        assert_eq!(d.hex().len(), 64);
    }

    #[test]
    fn reject_wrong_algorithm() {
        assert!(Digest::parse(&GOOD.replace("sha256", "sha512")).is_err());
        assert!(Digest::parse(&GOOD["sha256:".len()..]).is_err());
    }

    #[test]
    fn reject_uppercase_and_short_hex() {
        assert!(Digest::parse(&GOOD.to_uppercase().replace("SHA256", "sha256")).is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse(&format!("{GOOD}0")).is_err());
        assert!(Digest::parse(&GOOD.replace('a', "g")).is_err());
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: Digest = serde_json::from_str(&format!("\"{GOOD}\"")).unwrap();
        assert_eq!(serde_json::to_string(&ok).unwrap(), format!("\"{GOOD}\""));
        let bad: Result<Digest, _> = serde_json::from_str("\"sha256:nothex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn from_sha256_is_lowercase_hex() {
        let d = Digest::from_sha256([0xAB; 32]);
        assert_eq!(d.hex(), "ab".repeat(32));
        assert_eq!(Digest::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn error_names_the_input() {
        let err = Digest::parse("md5:1234").unwrap_err();
        assert!(err.to_string().contains("md5:1234"));
    }
}
