//! # fleet-guid
//!
//! Device GUID value type for the fleetd platform.
//!
//! Every managed device is named by a canonical GUID: five hyphen-separated
//! groups of hexadecimal digits with lengths 8-4-4-4-12, for example
//! `63f32fee-238e-4f6a-a091-092270d22439`. GUIDs are assigned by the device
//! firmware and arrive over the wire embedded in request text, so this crate
//! deals in two operations:
//!
//! - [`DeviceGuid::parse`]: strict whole-string validation. Any deviation
//!   (wrong group count, wrong group length, non-hex character, braces,
//!   missing hyphens) is rejected.
//! - [`DeviceGuid::extract`]: scan arbitrary text for the first
//!   GUID-shaped substring and return it verbatim.
//!
//! The original casing is preserved (`as_str` returns the text exactly as it
//! appeared); [`DeviceGuid::uuid`] exposes the canonical lowercase form for
//! use as a lookup key, so two spellings of the same device compare equal
//! where it matters.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

/// The canonical GUID shape: hex groups of lengths 8-4-4-4-12.
///
/// Deliberately unanchored: `extract` scans request text for embedded
/// candidates, and `parse` enforces whole-string coverage on top.
static GUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("GUID pattern must compile")
});

/// Errors that can occur when parsing a device GUID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuidError {
    /// The input string is empty.
    #[error("GUID cannot be empty")]
    Empty,

    /// The input is not a canonical 8-4-4-4-12 hyphenated hex GUID.
    #[error("invalid GUID format: {0:?}")]
    InvalidFormat(String),
}

/// A validated device GUID.
///
/// Holds the verbatim text as it was parsed (case preserved) together with
/// the canonical [`Uuid`] form derived from it at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceGuid {
    text: String,
    uuid: Uuid,
}

impl DeviceGuid {
    /// Parses a GUID from a string.
    ///
    /// The entire input must be a canonical GUID; surrounding text, braces,
    /// URN prefixes, and the 32-hex-digit unhyphenated form are all
    /// rejected.
    pub fn parse(s: &str) -> Result<Self, GuidError> {
        if s.is_empty() {
            return Err(GuidError::Empty);
        }

        let covers_whole_input = GUID_PATTERN
            .find(s)
            .is_some_and(|m| m.start() == 0 && m.end() == s.len());
        if !covers_whole_input {
            return Err(GuidError::InvalidFormat(s.to_string()));
        }

        let uuid = Uuid::parse_str(s).map_err(|_| GuidError::InvalidFormat(s.to_string()))?;

        Ok(Self {
            text: s.to_string(),
            uuid,
        })
    }

    /// Returns the first GUID-shaped substring of `text`, verbatim.
    ///
    /// Scans left to right and returns the earliest match; the surrounding
    /// text is not required to delimit the candidate, so a GUID embedded in
    /// a URL path or query string is found as-is.
    #[must_use]
    pub fn extract(text: &str) -> Option<Self> {
        let candidate = GUID_PATTERN.find(text)?;
        Self::parse(candidate.as_str()).ok()
    }

    /// Returns the GUID text exactly as it was parsed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the canonical form of this GUID.
    ///
    /// Case-insensitive by construction: every spelling of the same device
    /// GUID yields the same `Uuid`, making this the right key for lookups.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for DeviceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for DeviceGuid {
    type Err = GuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for DeviceGuid {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl serde::Serialize for DeviceGuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceGuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
