//! Participant identities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SignalError};

/// Opaque name of a participant for the lifetime of a relay session
///
/// Identities are generated locally by each agent and are never verified by
/// the relay. They only need to be unique enough to avoid accidental
/// collisions, so [`Identity::generate`] uses a random v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from a caller-supplied name
    ///
    /// Fails for empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SignalError::invalid_identity("identity must not be empty"));
        }
        Ok(Self(name))
    }

    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Consume the identity and return the inner string
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Wire values are trusted as-is except that blank strings mean "absent"
    pub(crate) fn from_wire(raw: Option<String>) -> Option<Self> {
        raw.filter(|s| !s.trim().is_empty()).map(Self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_are_unique() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(Identity::new("").is_err());
        assert!(Identity::new("   ").is_err());
        assert!("alice".parse::<Identity>().is_ok());
    }

    #[test]
    fn test_short_form() {
        let id = Identity::new("0123456789abcdef").unwrap();
        assert_eq!(id.short(), "01234567");
        let tiny = Identity::new("bob").unwrap();
        assert_eq!(tiny.short(), "bob");
    }
}
