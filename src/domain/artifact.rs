//! Artifacts produced by pipeline stages.
//!
//! An artifact is an opaque reference (an image location, a resource set
//! handle, a rollout revision). The producing stage owns the value;
//! downstream stages look it up by stage name and never mutate it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference to something a stage produced
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Wrap a reference value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw reference value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ArtifactRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}
