//! Device version parsing and image resolution.
//!
//! Version strings follow the grammar
//! `MAJOR(1-3 digits).MINOR(1-2 digits)[.PATCH(1-2 digits)][-BUILD(1-10 digits)][-COMMIT]`
//! where only major and minor are mandatory. The empty string, `latest` and
//! `ga` denote an engineering build with major `0`, for which licensing is
//! skipped entirely.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::device::DeviceSpec;

/// Default container image repository for device workloads.
pub const DEFAULT_IMAGE: &str = "ghcr.io/netsim/netdev";

/// Version strings treated as engineering builds.
const ENGINEERING_VERSIONS: [&str; 3] = ["", "latest", "ga"];

// Anchored at the string start on purpose: unrelated prefix text
// ("release_21.6") must not yield a version.
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<major>\d{1,3})\.(?P<minor>\d{1,2})\.?(?P<patch>\d{1,2})?-?(?P<build>\d{1,10})?-?(?P<commit>\S+)?",
    )
    .expect("version grammar is a valid regex")
});

/// Raised when a version string does not match the version grammar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to parse version string {0:?}")]
pub struct VersionError(pub String);

/// A device version as a set of fields, kept as strings to preserve
/// formatting. Absent components are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVersion {
    pub major: String,
    pub minor: String,
    pub patch: String,
    pub build: String,
    pub commit: String,
}

impl DeviceVersion {
    /// The unknown/engineering build marker.
    pub fn engineering() -> Self {
        DeviceVersion {
            major: "0".to_string(),
            ..Default::default()
        }
    }

    /// True when the version is an unknown/engineering build.
    pub fn is_engineering(&self) -> bool {
        self.major == "0"
    }
}

/// Parse a version string.
///
/// Case-insensitive matches of `""`, `"latest"` and `"ga"` yield the
/// engineering build; anything else must match the version grammar from the
/// string start or an error is returned.
pub fn parse_version(s: &str) -> Result<DeviceVersion, VersionError> {
    if ENGINEERING_VERSIONS.contains(&s.to_ascii_lowercase().as_str()) {
        return Ok(DeviceVersion::engineering());
    }

    let caps = VERSION_RE
        .captures(s)
        .ok_or_else(|| VersionError(s.to_string()))?;

    let group = |name: &str| {
        caps.name(name)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };

    Ok(DeviceVersion {
        major: group("major"),
        minor: group("minor"),
        patch: group("patch"),
        build: group("build"),
        commit: group("commit"),
    })
}

/// Resolve the container image for a device.
///
/// An explicit image in the config block wins; otherwise the spec version is
/// used as a tag for the default image repository; with neither set the bare
/// default repository is returned.
pub fn resolve_image(spec: &DeviceSpec) -> String {
    let cfg = spec.config();

    if !cfg.image.is_empty() {
        return cfg.image;
    }

    if !spec.version.is_empty() {
        return format!("{DEFAULT_IMAGE}:{}", spec.version);
    }

    DEFAULT_IMAGE.to_string()
}

/// Resolve the effective image version for a device.
///
/// The explicit spec version wins; otherwise the tag substring of the
/// resolved image is parsed (no tag parses as an engineering build). A parse
/// failure is absorbed as an engineering build with a diagnostic so that it
/// never aborts reconciliation.
pub fn resolve_image_version(spec: &DeviceSpec) -> DeviceVersion {
    let raw = if !spec.version.is_empty() {
        spec.version.clone()
    } else {
        image_tag(&resolve_image(spec))
    };

    match parse_version(&raw) {
        Ok(version) => version,
        Err(err) => {
            warn!("{err}, treating device as an engineering build");
            DeviceVersion::engineering()
        }
    }
}

fn image_tag(image: &str) -> String {
    match image.rsplit_once(':') {
        Some((_, tag)) => tag.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;

    fn version(parts: [&str; 5]) -> DeviceVersion {
        DeviceVersion {
            major: parts[0].to_string(),
            minor: parts[1].to_string(),
            patch: parts[2].to_string(),
            build: parts[3].to_string(),
            commit: parts[4].to_string(),
        }
    }

    #[test]
    fn parse_version_grammar() {
        let cases = [
            ("21.6.4", ["21", "6", "4", "", ""]),
            ("21.6", ["21", "6", "", "", ""]),
            ("21.6-test", ["21", "6", "", "", "test"]),
            ("21.6.11-test", ["21", "6", "11", "", "test"]),
            ("21.6.11-235-test", ["21", "6", "11", "235", "test"]),
            ("21.6.11-235", ["21", "6", "11", "235", ""]),
            ("0.0", ["0", "0", "", "", ""]),
            ("0.0.0-34652", ["0", "0", "0", "34652", ""]),
        ];

        for (input, want) in cases {
            assert_eq!(parse_version(input).unwrap(), version(want), "{input}");
        }
    }

    #[test]
    fn parse_version_engineering_aliases() {
        for input in ["", "latest", "ga", "GA", "Latest"] {
            let v = parse_version(input).unwrap();
            assert_eq!(v, DeviceVersion::engineering(), "{input:?}");
            assert!(v.is_engineering());
        }
    }

    #[test]
    fn parse_version_rejects_garbage() {
        assert!(parse_version("abcd").is_err());
    }

    #[test]
    fn parse_version_is_anchored() {
        // Prefix text must not yield a version out of a numeric substring.
        assert!(parse_version("version_0.0.0-34652").is_err());
    }

    fn spec_with(image: &str, version: &str) -> DeviceSpec {
        DeviceSpec {
            config: Some(DeviceConfig {
                image: image.to_string(),
                ..Default::default()
            }),
            version: version.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_image_precedence() {
        // Explicit image always wins.
        assert_eq!(
            resolve_image(&spec_with("registry/custom:1.2.3", "21.6")),
            "registry/custom:1.2.3"
        );
        // No image, version becomes the tag of the default repo.
        assert_eq!(
            resolve_image(&spec_with("", "21.11.1")),
            format!("{DEFAULT_IMAGE}:21.11.1")
        );
        // Neither set: bare default repo.
        assert_eq!(resolve_image(&DeviceSpec::default()), DEFAULT_IMAGE);
    }

    #[test]
    fn resolve_image_version_prefers_explicit_version() {
        let v = resolve_image_version(&spec_with("registry/custom:99.9", "21.6.4"));
        assert_eq!(v, version(["21", "6", "4", "", ""]));
    }

    #[test]
    fn resolve_image_version_falls_back_to_image_tag() {
        let v = resolve_image_version(&spec_with("registry/custom:21.11.2", ""));
        assert_eq!(v, version(["21", "11", "2", "", ""]));
    }

    #[test]
    fn resolve_image_version_without_tag_is_engineering() {
        assert!(resolve_image_version(&DeviceSpec::default()).is_engineering());
        assert!(resolve_image_version(&spec_with("registry/custom:latest", "")).is_engineering());
    }

    #[test]
    fn resolve_image_version_absorbs_parse_failure() {
        let v = resolve_image_version(&spec_with("", "abcd"));
        assert!(v.is_engineering());
    }
}
