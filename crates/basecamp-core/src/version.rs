//! Release version identifiers.
//!
//! A version is `MAJOR.MINOR[.PATCH]`; a missing patch component is zero.
//! Ordering is numeric tuple ordering, so `1.10.0 > 1.9.0`. Anything else
//! (`v1.0`, `1.0.0-rc1`, empty) is rejected at parse time.

use std::fmt;
use std::str::FromStr;

/// A parsed release version.
///
/// `Display` always prints all three components, so `"1.0".parse()` formats
/// back as `"1.0.0"`. Catalog directory names keep whatever string the
/// operator used; comparisons always go through the parsed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let major = parse_component(s, parts.next())?;
        let minor = parse_component(s, parts.next())?;
        let patch = match parts.next() {
            Some(p) => parse_component(s, Some(p))?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(VersionError::Invalid(s.to_string()));
        }
        Ok(Version { major, minor, patch })
    }
}

fn parse_component(full: &str, part: Option<&str>) -> Result<u32, VersionError> {
    let part = part.ok_or_else(|| VersionError::Invalid(full.to_string()))?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VersionError::Invalid(full.to_string()));
    }
    part.parse()
        .map_err(|_| VersionError::Invalid(full.to_string()))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Is `s` a well-formed version string?
pub fn is_valid(s: &str) -> bool {
    s.parse::<Version>().is_ok()
}

/// Compare two version strings numerically.
pub fn compare(a: &str, b: &str) -> Result<std::cmp::Ordering, VersionError> {
    let a: Version = a.parse()?;
    let b: Version = b.parse()?;
    Ok(a.cmp(&b))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version string: {0:?} (expected MAJOR.MINOR[.PATCH])")]
    Invalid(String),
}
