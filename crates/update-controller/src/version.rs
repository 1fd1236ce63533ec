// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Update Controller.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Version parsing and comparison module

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version {input:?}: {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// `MAJOR.MINOR.PATCH` with purely numeric ordering.
///
/// Field order matters: the derived `Ord` compares major, then minor, then patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `MAJOR.MINOR.PATCH`, with one optional leading `v`
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        let trimmed = version_from_tag(s);
        let parts: Vec<&str> = trimmed.split('.').collect();

        if parts.len() != 3 {
            return Err(VersionParseError {
                input: s.to_owned(),
                reason: "expected X.Y.Z".to_owned(),
            });
        }

        let component = |name: &str, part: &str| -> Result<u32, VersionParseError> {
            // u32::from_str accepts a leading '+', which is not a version
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionParseError {
                    input: s.to_owned(),
                    reason: format!("invalid {name} component {part:?}"),
                });
            }
            part.parse::<u32>().map_err(|e| VersionParseError {
                input: s.to_owned(),
                reason: format!("invalid {name} component {part:?}: {e}"),
            })
        };

        Ok(Self {
            major: component("major", parts[0])?,
            minor: component("minor", parts[1])?,
            patch: component("patch", parts[2])?,
        })
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SemVer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Returns true if `remote` is strictly newer than `local`
pub fn is_newer(local: SemVer, remote: SemVer) -> bool {
    remote > local
}

/// Extract version from a release tag (strips one leading "v")
pub fn version_from_tag(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(SemVer::parse("0.2.38").unwrap(), SemVer::new(0, 2, 38));
        assert_eq!(SemVer::parse("v0.2.38").unwrap(), SemVer::new(0, 2, 38));
        assert_eq!(SemVer::parse("1.0.0").unwrap(), SemVer::new(1, 0, 0));
        assert_eq!(SemVer::parse("10.20.30").unwrap(), SemVer::new(10, 20, 30));
    }

    #[test]
    fn test_parse_version_invalid() {
        assert!(SemVer::parse("invalid").is_err());
        assert!(SemVer::parse("").is_err());
        assert!(SemVer::parse("1.2").is_err());
        assert!(SemVer::parse("1.2.3.4").is_err());
        assert!(SemVer::parse("a.b.c").is_err());
        assert!(SemVer::parse("1.2.3-beta").is_err());
        assert!(SemVer::parse("+1.2.3").is_err());
        assert!(SemVer::parse("vv1.2.3").is_err());
        assert!(SemVer::parse("1..3").is_err());
    }

    #[test]
    fn test_format_is_canonical() {
        for input in ["1.2.3", "v1.2.3", "0.0.0", "v10.0.42"] {
            let parsed = SemVer::parse(input).unwrap();
            assert_eq!(parsed.to_string(), input.trim_start_matches('v'));
            assert_eq!(SemVer::parse(&parsed.to_string()).unwrap(), parsed);
        }
        assert_eq!(SemVer::parse("v01.002.3").unwrap().to_string(), "1.2.3");
    }

    #[test]
    fn test_is_newer() {
        let v = |s: &str| SemVer::parse(s).unwrap();
        // Newer patch
        assert!(is_newer(v("0.2.38"), v("0.2.39")));
        // Same version
        assert!(!is_newer(v("0.2.38"), v("0.2.38")));
        // Older
        assert!(!is_newer(v("0.2.39"), v("0.2.38")));
        // Newer minor beats older patch
        assert!(is_newer(v("1.1.9"), v("1.2.0")));
        // Newer major beats everything below it
        assert!(is_newer(v("1.9.9"), v("2.0.0")));
        assert!(!is_newer(v("1.0.0"), v("0.9.99")));
    }

    #[test]
    fn test_ordering_is_numeric_not_lexicographic() {
        assert!(SemVer::parse("1.10.0").unwrap() > SemVer::parse("1.9.0").unwrap());
        assert!(SemVer::parse("0.0.10").unwrap() > SemVer::parse("0.0.9").unwrap());
    }

    #[test]
    fn test_version_from_tag_strips_v() {
        assert_eq!(version_from_tag("v0.2.38"), "0.2.38");
        assert_eq!(version_from_tag("0.2.38"), "0.2.38");
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&SemVer::new(1, 3, 0)).unwrap();
        assert_eq!(json, "\"1.3.0\"");
        let back: SemVer = serde_json::from_str("\"v1.3.0\"").unwrap();
        assert_eq!(back, SemVer::new(1, 3, 0));
        assert!(serde_json::from_str::<SemVer>("\"nope\"").is_err());
    }
}
