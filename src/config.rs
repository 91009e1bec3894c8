//! Configuration for shipyard.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHIPYARD_HOME)
//! 2. Config file (.shipyard/config.yaml)
//! 3. Defaults (~/.shipyard)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shipyard/config.yaml
//! - `paths.home` is relative to the .shipyard/ directory
//!
//! Adapter credentials are given as references (`env:NAME` or a literal)
//! and resolved here, before any engine starts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::adapters::{AdapterSet, Capability, CommandAdapter};
use crate::core::engine::EngineOptions;
use crate::core::safety::{default_redact_patterns, ExecutionLimits, Redactor, Secret};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".shipyard";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Engine state directory (relative to .shipyard/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub concurrency_limit: Option<usize>,
    pub run_timeout_seconds: Option<u64>,
    /// Glob patterns for parameter keys that must never be logged
    pub redact_patterns: Option<Vec<String>>,
}

/// Adapter bindings by capability
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptersConfig {
    pub provisioner: Option<AdapterOptions>,
    pub builder: Option<AdapterOptions>,
    pub deployer: Option<AdapterOptions>,
    pub configurator: Option<AdapterOptions>,
}

/// Recognized options for one adapter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterOptions {
    /// Executable that implements the capability
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub endpoint: Option<String>,
    /// `env:NAME` or a literal value
    pub credential_ref: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub concurrency_limit: Option<usize>,
}

impl AdapterOptions {
    /// Build the command adapter, resolving the credential reference
    pub fn build(&self, capability: Capability) -> Result<CommandAdapter> {
        if self.command.trim().is_empty() {
            bail!("adapters.{}.command must not be empty", capability);
        }

        let mut adapter =
            CommandAdapter::new(capability, self.command.clone()).with_args(self.args.clone());

        if let Some(ref endpoint) = self.endpoint {
            adapter = adapter.with_endpoint(endpoint.clone());
        }
        if let Some(ref reference) = self.credential_ref {
            let secret = resolve_credential(reference)
                .with_context(|| format!("Failed to resolve credential for {}", capability))?;
            adapter = adapter.with_credential(secret);
        }
        if let Some(secs) = self.timeout_seconds {
            adapter = adapter.with_timeout(Duration::from_secs(secs));
        }
        if let Some(limit) = self.concurrency_limit {
            if limit == 0 {
                bail!("adapters.{}.concurrency_limit must be at least 1", capability);
            }
            adapter = adapter.with_concurrency_limit(limit);
        }

        Ok(adapter)
    }
}

/// Resolve a credential reference into its secret value
pub fn resolve_credential(reference: &str) -> Result<Secret> {
    match reference.strip_prefix("env:") {
        Some(name) => std::env::var(name)
            .map(Secret::new)
            .with_context(|| format!("Environment variable {} is not set", name)),
        None => Ok(Secret::new(reference)),
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to shipyard home (run state, audit log)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub engine: EngineConfig,
    pub adapters: AdaptersConfig,
}

impl ResolvedConfig {
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.home.join("audit.jsonl")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            concurrency_limit: self.engine.concurrency_limit,
            run_timeout: self.engine.run_timeout_seconds.map(Duration::from_secs),
        }
    }

    pub fn redactor(&self) -> Redactor {
        match self.engine.redact_patterns {
            Some(ref patterns) => Redactor::new(patterns),
            None => Redactor::new(&default_redact_patterns()),
        }
    }

    /// Command adapters for every configured capability
    pub fn build_adapters(&self) -> Result<AdapterSet> {
        let mut set = AdapterSet::new();
        if let Some(ref options) = self.adapters.provisioner {
            set = set.with_provisioner(Arc::new(options.build(Capability::Provisioner)?));
        }
        if let Some(ref options) = self.adapters.builder {
            set = set.with_builder(Arc::new(options.build(Capability::Builder)?));
        }
        if let Some(ref options) = self.adapters.deployer {
            set = set.with_deployer(Arc::new(options.build(Capability::Deployer)?));
        }
        if let Some(ref options) = self.adapters.configurator {
            set = set.with_configurator(Arc::new(options.build(Capability::Configurator)?));
        }
        Ok(set)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve_config(find_config_file(), std::env::var("SHIPYARD_HOME").ok())
}

fn resolve_config(config_file: Option<PathBuf>, env_home: Option<String>) -> Result<ResolvedConfig> {
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let (Some(ref home_path), Some(ref path)) = (&file.paths.home, &config_file) {
        let shipyard_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(shipyard_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR)
    };

    ExecutionLimits {
        concurrency_limit: file.engine.concurrency_limit,
        run_timeout_seconds: file.engine.run_timeout_seconds,
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("Invalid engine config: {}", e.replace("limits.", "engine.")))?;

    Ok(ResolvedConfig {
        home,
        config_file,
        engine: file.engine,
        adapters: file.adapters,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the shipyard home directory
pub fn shipyard_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($SHIPYARD_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

/// Get the lifecycle audit log ($SHIPYARD_HOME/audit.jsonl)
pub fn audit_path() -> Result<PathBuf> {
    Ok(config()?.audit_path())
}
