//! Container id generation and validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated container id.
///
/// Ids must be 1-64 characters, contain only alphanumerics, hyphens, and
/// underscores, and start with an alphanumeric character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container id.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new container id, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerId`] if the format is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random container id (12 hex characters).
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidContainerId { id: id.to_string() });
        }

        let mut chars = id.chars();
        let first = chars.next().unwrap_or('-');
        if !first.is_ascii_alphanumeric() {
            return Err(Error::InvalidContainerId { id: id.to_string() });
        }

        if id
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(Error::InvalidContainerId { id: id.to_string() });
        }

        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(ContainerId::new("abc123").is_ok());
        assert!(ContainerId::new("my-container").is_ok());
        assert!(ContainerId::new("my_container").is_ok());
        assert!(ContainerId::new("0-starts-with-digit").is_ok());
    }

    #[test]
    fn invalid_ids() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("-leading-hyphen").is_err());
        assert!(ContainerId::new("_leading_underscore").is_err());
        assert!(ContainerId::new("has space").is_err());
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_ne!(a, b);
        assert!(ContainerId::new(a.as_str()).is_ok());
    }
}
