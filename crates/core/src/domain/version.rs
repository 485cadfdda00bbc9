use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A `major.minor.rev` database server version.
///
/// Ordering is numeric per component, so `8.0.11 > 5.7.30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub rev: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, rev: u32) -> Self {
        Self { major, minor, rev }
    }

    /// Port number conventionally associated with the version:
    /// `5.7.21` maps to 5721 and `8.0.11` to 8011.
    pub fn to_port(&self) -> u32 {
        self.major * 1000 + self.minor * 100 + self.rev
    }

    /// Version rendered for use in directory names (`8.0.11` -> `8_0_11`).
    pub fn to_name(&self) -> String {
        format!("{}_{}_{}", self.major, self.minor, self.rev)
    }

    pub fn at_least(&self, other: &Version) -> bool {
        self >= other
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.rev).cmp(&(other.major, other.minor, other.rev))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(CoreError::InvalidVersion(s.to_string()));
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| CoreError::InvalidVersion(s.to_string()))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.rev)
    }
}
