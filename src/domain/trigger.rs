//! Trigger events that start a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The event that caused a run: which commit, which definition, and
/// free-form parameters handed to every stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// Commit reference being released
    #[serde(default)]
    pub commit: String,

    /// Where the pipeline definition was loaded from (path or name)
    #[serde(default)]
    pub definition_ref: String,

    /// Trigger parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl TriggerContext {
    /// Create a trigger for a commit and definition reference
    pub fn new(commit: impl Into<String>, definition_ref: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            definition_ref: definition_ref.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a trigger parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}
