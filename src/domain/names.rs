//! Validated entity names
//!
//! Names are 2 to 48 characters of ASCII letters, digits, `_` and `-`, and
//! start with a letter. Comparison, ordering and hashing use the upper-case
//! form; `Display` keeps the spelling the name was created with.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const NAME_MIN_LEN: usize = 2;
pub const NAME_MAX_LEN: usize = 48;

fn validate(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.len() < NAME_MIN_LEN || name.len() > NAME_MAX_LEN {
        return Err(invalid(&format!(
            "length must be between {} and {}",
            NAME_MIN_LEN, NAME_MAX_LEN
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(invalid("must start with a letter"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(&format!("invalid character '{}'", c)));
    }
    Ok(())
}

macro_rules! checked_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            display: String,
            upper: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self> {
                let display = name.into();
                validate(&display)?;
                let upper = display.to_ascii_uppercase();
                Ok(Self { display, upper })
            }

            /// Spelling the name was created with
            pub fn as_str(&self) -> &str {
                &self.display
            }

            /// Canonical upper-case form, used as database key
            pub fn upper(&self) -> &str {
                &self.upper
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.upper == other.upper
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.upper.cmp(&other.upper)
            }
        }

        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.upper.hash(state);
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.display)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.display)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

checked_name! {
    /// Name of a satellite node
    NodeName
}

checked_name! {
    /// Name of a resource definition (shared by its resources on every node)
    ResourceName
}

checked_name! {
    /// Name of a storage pool definition
    StorPoolName
}

checked_name! {
    /// Name of a snapshot definition
    SnapshotName
}

/// Volume number within a resource definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeNumber(pub u32);

impl std::fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
