//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for domain identifiers and values. Each newtype
//! ensures data validity at construction time so the rest of the codebase
//! never handles a malformed session id, hostname, or version string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// SessionId
// ============================================================================

/// Length of the short session token in hex characters.
const SESSION_ID_LEN: usize = 8;

/// Identifier for a replication session.
///
/// A short random token (8 lowercase hex characters, drawn from a v4 UUID)
/// rather than a full UUID: the id appears in snapshot directory names and
/// in the rollback command a user has to type, so brevity matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random SessionId
    #[must_use]
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(uuid[..SESSION_ID_LEN].to_string())
    }

    /// Get the token as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SESSION_ID_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidId(format!(
                "Session id must be {SESSION_ID_LEN} hex characters, got '{s}'"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

// ============================================================================
// Hostname
// ============================================================================

/// A validated machine hostname (source or target of a session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hostname(String);

impl Hostname {
    /// Create a Hostname, rejecting empty or whitespace-containing values
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidHostname(name));
        }
        Ok(Self(name))
    }

    /// Get the hostname as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Hostname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Hostname {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// SubvolumeName
// ============================================================================

/// A btrfs subvolume name as configured (e.g. `@` or `@home`).
///
/// Stored as the bare name; the slug form (with `/` replaced) is what ends
/// up in snapshot entry names, see [`slug`](SubvolumeName::slug).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubvolumeName(String);

impl SubvolumeName {
    /// Create a SubvolumeName, rejecting empty values and `..` components
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() || name.split('/').any(|c| c.is_empty() || c == "..") {
            return Err(DomainError::InvalidSubvolume(name));
        }
        Ok(Self(name))
    }

    /// Get the subvolume name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form used inside snapshot entry names.
    ///
    /// Nested subvolume names contain `/`, which cannot appear in a
    /// directory entry, so path separators become `_`.
    #[must_use]
    pub fn slug(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl Display for SubvolumeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubvolumeName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// ToolVersion
// ============================================================================

/// A dotted numeric tool version (`major.minor.patch`), ordered
/// componentwise.
///
/// Used by the target install operation to compare the source and target
/// binaries. Pre-release suffixes are not modeled; released builds are the
/// only thing ever installed on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl ToolVersion {
    /// Create a ToolVersion from its components
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The version this binary was built as
    #[must_use]
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is always a valid dotted triple for this package.
        env!("CARGO_PKG_VERSION")
            .parse()
            .unwrap_or(Self::new(0, 0, 0))
    }
}

impl Display for ToolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ToolVersion {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(DomainError::InvalidVersion(s.to_string()));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| DomainError::InvalidVersion(s.to_string()))
        };
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}
