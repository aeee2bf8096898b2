//! Spec-version gate
//!
//! Runs carry the engine spec version they were created under. Runs older
//! than the event-sourced format boundary are legacy: the interface stays
//! identical, but operations the legacy format cannot express are rejected
//! with `UnsupportedLegacyOperation` by the engine.

use semver::Version;

/// The spec version stamped on newly created runs.
pub const CURRENT_SPEC_VERSION: &str = "4.1.0";

/// First version with the event-sourced run format.
pub const LEGACY_BOUNDARY: &str = "4.1.0-beta.0";

/// Errors from version parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid spec version {value:?}: {reason}")]
pub struct InvalidSpecVersion {
    /// The rejected input.
    pub value: String,
    /// Parser detail.
    pub reason: String,
}

/// True when a run with this spec version must take the legacy path.
pub fn is_legacy(spec_version: &str) -> Result<bool, InvalidSpecVersion> {
    let version = Version::parse(spec_version).map_err(|e| InvalidSpecVersion {
        value: spec_version.to_string(),
        reason: e.to_string(),
    })?;
    let boundary = Version::parse(LEGACY_BOUNDARY).expect("boundary is a valid version");
    Ok(version < boundary)
}
