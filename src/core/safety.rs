//! Execution limits and secret redaction.
//!
//! Limits bound a run (concurrency, wall-clock timeout). Redaction keeps
//! credentials out of logs and notifications: option values are wrapped
//! in [`Secret`], and stage parameters whose keys match a denylist glob
//! are masked before they are logged.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};

/// Run-wide execution limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionLimits {
    /// Maximum concurrently running stages (unlimited if unset)
    #[serde(default)]
    pub concurrency_limit: Option<usize>,

    /// Wall-clock limit for the whole run in seconds
    #[serde(default)]
    pub run_timeout_seconds: Option<u64>,
}

impl ExecutionLimits {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.concurrency_limit == Some(0) {
            return Err("limits.concurrency_limit must be at least 1".into());
        }
        if self.run_timeout_seconds == Some(0) {
            return Err("limits.run_timeout_seconds must be at least 1".into());
        }
        Ok(())
    }

    /// Combine two sets of limits, keeping the stricter of each
    pub fn stricter(&self, other: &ExecutionLimits) -> ExecutionLimits {
        ExecutionLimits {
            concurrency_limit: min_option(self.concurrency_limit, other.concurrency_limit),
            run_timeout_seconds: min_option(self.run_timeout_seconds, other.run_timeout_seconds),
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_seconds.map(Duration::from_secs)
    }

    /// Whether another stage may start with `running` already in flight
    pub fn has_capacity(&self, running: usize) -> bool {
        self.concurrency_limit.map_or(true, |limit| running < limit)
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Default denylist for parameter keys
pub fn default_redact_patterns() -> Vec<String> {
    vec![
        "*secret*".to_string(),
        "*token*".to_string(),
        "*password*".to_string(),
        "*credential*".to_string(),
        "*key*".to_string(),
    ]
}

/// Masks values of sensitive keys
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Pattern>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&default_redact_patterns())
    }
}

impl Redactor {
    /// Build from glob patterns; invalid patterns are ignored
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| Pattern::new(&p.to_ascii_lowercase()).ok())
                .collect(),
        }
    }

    /// Check if a key matches any denylist pattern
    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&key))
    }

    /// Copy of `params` with sensitive values masked
    pub fn redact_params(&self, params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        params
            .iter()
            .map(|(k, v)| {
                let value = if self.is_sensitive(k) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }
}

const REDACTED: &str = "***";

/// A secret value that never prints itself
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The actual value; only for handing to the external tool
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}
