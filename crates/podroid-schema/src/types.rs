//! Newtype wrappers for container identifiers.
//!
//! Both newtypes serialize/deserialize as plain strings so `containers.json`
//! stays a flat id → record mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

/// Number of hex characters shown to operators for a container id.
pub const SHORT_ID_LEN: usize = 12;

string_newtype!(
    /// Full 64-character hex container identifier.
    ContainerId
);

string_newtype!(
    /// Truncated prefix of a [`ContainerId`], used for display.
    ShortId
);

impl ContainerId {
    pub fn short(&self) -> ShortId {
        ShortId(self.0[..SHORT_ID_LEN.min(self.0.len())].to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_display_and_as_ref() {
        let id = ContainerId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&id), "abc123");
    }

    #[test]
    fn container_id_serde_is_a_plain_string() {
        let id = ContainerId::new("deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: ContainerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn short_id_truncates() {
        let id = ContainerId::new("0123456789abcdef0123");
        assert_eq!(id.short().as_str(), "0123456789ab");
        let tiny = ContainerId::new("abc");
        assert_eq!(tiny.short().as_str(), "abc");
    }
}
