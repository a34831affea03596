//! Trigger events and the per-run application version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::error::{FanoutError, Result};

/// Version published for pushes to the default branch.
pub const LATEST: &str = "latest";

/// Version used when source control yields nothing usable.
pub const FALLBACK_VERSION: &str = "untagged";

/// Maximum length of a registry tag.
const MAX_TAG_LEN: usize = 128;

/// What started the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Direct push to the default branch.
    Push,
    /// Operator-started run.
    ManualDispatch,
}

impl FromStr for TriggerEvent {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerEvent::Push),
            "workflow_dispatch" | "manual_dispatch" | "manual" | "dispatch" => {
                Ok(TriggerEvent::ManualDispatch)
            }
            other => Err(FanoutError::UnknownEvent(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerEvent::Push => f.write_str("push"),
            TriggerEvent::ManualDispatch => f.write_str("manual_dispatch"),
        }
    }
}

/// The tag a run publishes its manifest list under.
///
/// Always non-empty and a valid registry tag
/// (`[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppVersion(String);

impl AppVersion {
    pub fn new(version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        let invalid = |reason: &str| FanoutError::InvalidVersion {
            version: version.clone(),
            reason: reason.to_string(),
        };

        let mut chars = version.chars();
        match chars.next() {
            None => return Err(invalid("empty")),
            Some(c) if !(c.is_ascii_alphanumeric() || c == '_') => {
                return Err(invalid("must start with a letter, digit or underscore"))
            }
            _ => {}
        }
        if version.len() > MAX_TAG_LEN {
            return Err(invalid("longer than 128 characters"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            return Err(invalid("contains characters not allowed in a registry tag"));
        }
        Ok(Self(version))
    }

    pub fn latest() -> Self {
        Self(LATEST.to_string())
    }

    pub fn fallback() -> Self {
        Self(FALLBACK_VERSION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AppVersion {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for AppVersion {
    type Error = FanoutError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<AppVersion> for String {
    fn from(v: AppVersion) -> Self {
        v.0
    }
}

/// Source of "nearest tag, or a stable identifier" for the current tree.
pub trait TagDescriber {
    fn describe(&self) -> Result<String>;
}

/// Derive the run's version.
///
/// `Push` always yields `latest`. Otherwise the describer is consulted; any
/// failure, empty output or output that is not a valid tag falls back to
/// [`FALLBACK_VERSION`]. Never fails.
pub fn resolve_app_version(event: TriggerEvent, describer: &dyn TagDescriber) -> AppVersion {
    if event == TriggerEvent::Push {
        return AppVersion::latest();
    }

    match describer.describe() {
        Ok(described) => match AppVersion::new(described.trim()) {
            Ok(version) => {
                debug!(version = %version, "resolved version from source control");
                version
            }
            Err(e) => {
                warn!(error = %e, fallback = FALLBACK_VERSION, "describe output unusable as tag");
                AppVersion::fallback()
            }
        },
        Err(e) => {
            warn!(error = %e, fallback = FALLBACK_VERSION, "tag lookup failed");
            AppVersion::fallback()
        }
    }
}
