//! Orchestrator configuration stored under `.repairloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::output::DEFAULT_OUTPUT_LIMIT_BYTES;
use crate::io::atomic::write_atomic;
use crate::io::harness::{DEFAULT_ENV_ALLOWLIST, DEFAULT_SEARCH_PATH_VAR, EnvPolicy};

pub const DEFAULT_CONFIG_PATH: &str = ".repairloop/config.toml";
pub const MAX_RETRIES_CAP: u32 = 50;
pub const TEST_TIMEOUT_CAP_SECS: u64 = 3600;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub spec_path: PathBuf,
    /// Directory the generated project is written to and tested in.
    pub workspace_path: PathBuf,
    pub state_path: PathBuf,
    pub logs_path: PathBuf,

    /// Patch cycles allowed after the initial generation.
    pub max_retries: u32,

    /// Wipe the workspace when a run starts from scratch.
    pub clear_workspace_on_fresh: bool,

    /// Budget for captured verification output stored in the state document.
    pub output_limit_bytes: usize,

    pub verify: VerifyConfig,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command run in the workspace; exit 0 passes.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when tearing down a timed-out run.
    pub kill_grace_secs: u64,
    pub env_allowlist: Vec<String>,
    /// Variable that gets the workspace prepended. Empty disables injection.
    pub search_path_var: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Backend used when `--generator` is not given.
    pub default: String,
    pub backends: BTreeMap<String, GeneratorBackend>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorBackend {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            spec_path: PathBuf::from("spec.md"),
            workspace_path: PathBuf::from("workspace"),
            state_path: PathBuf::from(".repairloop/state.json"),
            logs_path: PathBuf::from(".repairloop/logs"),
            max_retries: 5,
            clear_workspace_on_fresh: true,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            verify: VerifyConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: ["python3", "-m", "pytest", "-q"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 60,
            kill_grace_secs: 5,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_string(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert("command".to_string(), GeneratorBackend::default());
        Self {
            default: "command".to_string(),
            backends,
        }
    }
}

impl Default for GeneratorBackend {
    fn default() -> Self {
        Self {
            command: vec!["repairloop-generate".to_string()],
            timeout_secs: 300,
        }
    }
}

impl VerifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn env_policy(&self) -> EnvPolicy {
        let search_path_var = self.search_path_var.trim();
        EnvPolicy {
            allowlist: self.env_allowlist.clone(),
            search_path_var: (!search_path_var.is_empty()).then(|| search_path_var.to_string()),
        }
    }
}

impl GeneratorConfig {
    pub fn backend(&self, name: &str) -> Result<&GeneratorBackend> {
        self.backends.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.backends.keys().map(String::as_str).collect();
            anyhow!("unknown generator {name:?} (configured: {})", known.join(", "))
        })
    }
}

impl GeneratorBackend {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries > MAX_RETRIES_CAP {
            return Err(anyhow!("max_retries must be <= {MAX_RETRIES_CAP}"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.verify.timeout_secs == 0 || self.verify.timeout_secs > TEST_TIMEOUT_CAP_SECS {
            return Err(anyhow!(
                "verify.timeout_secs must be between 1 and {TEST_TIMEOUT_CAP_SECS}"
            ));
        }
        if self.verify.command.is_empty() || self.verify.command[0].trim().is_empty() {
            return Err(anyhow!("verify.command must be a non-empty array"));
        }
        for (name, backend) in &self.generator.backends {
            if backend.command.is_empty() || backend.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "generator.backends.{name}.command must be a non-empty array"
                ));
            }
            if backend.timeout_secs == 0 {
                return Err(anyhow!("generator.backends.{name}.timeout_secs must be > 0"));
            }
        }
        self.generator.backend(&self.generator.default)?;
        self.check_state_outside_workspace()
    }

    fn check_state_outside_workspace(&self) -> Result<()> {
        let workspace = std::path::absolute(&self.workspace_path)
            .with_context(|| format!("resolve {}", self.workspace_path.display()))?;
        let state = std::path::absolute(&self.state_path)
            .with_context(|| format!("resolve {}", self.state_path.display()))?;
        if state.starts_with(&workspace) {
            return Err(anyhow!(
                "state_path {} must not be inside workspace_path {}",
                self.state_path.display(),
                self.workspace_path.display()
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`. Validation
/// is left to the caller so command-line overrides can be applied first.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
