//! Workspace configuration.
//!
//! Loaded from `bcasl.yml` (or `.bcasl.yml`) at the workspace root. Every
//! section is optional; missing keys take their defaults. Two operational
//! knobs can be overridden from the environment, and the environment wins.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Phase, PipelineError};
use crate::plugin::{PluginRegistry, ResourceLimits};

/// Configuration file names, in lookup order.
pub const CONFIG_FILES: [&str; 2] = ["bcasl.yml", ".bcasl.yml"];

/// Environment override for `options.plugin_timeout_s`.
pub const ENV_PLUGIN_TIMEOUT: &str = "BCASL_PLUGIN_TIMEOUT";

/// Environment override for `options.plugin_parallelism`.
pub const ENV_PLUGIN_PARALLELISM: &str = "BCASL_PLUGIN_PARALLELISM";

/// Default include pattern.
pub const DEFAULT_FILE_PATTERN: &str = "**/*.py";

/// Files looked for when generating a default configuration.
const DETECTED_REQUIRED_FILES: [&str; 4] = ["main.py", "app.py", "requirements.txt", "pyproject.toml"];

/// Parsed workspace configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Files that must exist, relative to the workspace root.
    pub required_files: BTreeSet<String>,

    /// Include globs for file iteration.
    pub file_patterns: Vec<String>,

    /// Exclude globs for file iteration.
    pub exclude_patterns: Vec<String>,

    /// Pipeline options.
    pub options: PipelineOptions,

    /// Per-plugin overrides.
    pub plugins: BTreeMap<String, PluginSettings>,

    /// Explicit (possibly partial) execution order.
    pub plugin_order: Vec<String>,
}

/// `options` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Run the pipeline at all.
    pub enabled: bool,

    /// Run every plugin in an isolated worker process.
    pub sandbox: bool,

    /// Per-plugin wall-clock budget in seconds; `<= 0` is unlimited.
    pub plugin_timeout_s: f64,

    /// Budget for the whole run in seconds; `<= 0` is unlimited.
    pub pipeline_timeout_s: f64,

    /// Concurrent plugins; 0 picks automatically.
    pub plugin_parallelism: usize,

    /// Cache `iter_files` results for the duration of a run.
    pub iter_files_cache: bool,

    /// Resource ceilings for sandboxed plugins.
    pub plugin_limits: ResourceLimits,

    /// Reject plugins that declare no version requirement.
    pub require_explicit_versions: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            sandbox: false,
            plugin_timeout_s: 0.0,
            pipeline_timeout_s: 0.0,
            plugin_parallelism: 0,
            iter_files_cache: true,
            plugin_limits: ResourceLimits::default(),
            require_explicit_versions: false,
        }
    }
}

impl PipelineOptions {
    /// Per-plugin timeout, `None` when unlimited.
    pub fn plugin_timeout(&self) -> Option<Duration> {
        seconds(self.plugin_timeout_s)
    }

    /// Whole-run budget, `None` when unlimited.
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        seconds(self.pipeline_timeout_s)
    }

    /// Effective number of concurrent plugins.
    ///
    /// An explicit value is used as is. Automatic mode keeps one core free
    /// for the host when plugins run in worker processes and stays
    /// sequential otherwise.
    pub fn parallelism(&self) -> usize {
        if self.plugin_parallelism > 0 {
            self.plugin_parallelism
        } else if self.sandbox {
            num_cpus::get().saturating_sub(1).max(1)
        } else {
            1
        }
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PLUGIN_TIMEOUT) {
            match raw.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => self.plugin_timeout_s = value,
                _ => tracing::warn!(var = ENV_PLUGIN_TIMEOUT, value = %raw, "Ignoring invalid override"),
            }
        }
        if let Some(raw) = lookup(ENV_PLUGIN_PARALLELISM) {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.plugin_parallelism = value,
                Err(_) => {
                    tracing::warn!(var = ENV_PLUGIN_PARALLELISM, value = %raw, "Ignoring invalid override");
                }
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }
}

/// Positive seconds as a duration. Values too large for a `Duration` are
/// unlimited.
fn seconds(value: f64) -> Option<Duration> {
    if value > 0.0 {
        Duration::try_from_secs_f64(value).ok()
    } else {
        None
    }
}

/// Per-plugin entry under `plugins`.
///
/// Either a bare boolean (`cleaner: false`) or a map with `enabled`,
/// `priority` and plugin-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSettings {
    Flag(bool),
    Detailed {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i32>,
        #[serde(flatten)]
        settings: BTreeMap<String, serde_yaml::Value>,
    },
}

fn default_true() -> bool {
    true
}

impl PluginSettings {
    pub fn enabled(&self) -> bool {
        match self {
            Self::Flag(enabled) | Self::Detailed { enabled, .. } => *enabled,
        }
    }

    pub fn priority(&self) -> Option<i32> {
        match self {
            Self::Flag(_) => None,
            Self::Detailed { priority, .. } => *priority,
        }
    }

    /// A plugin-specific setting.
    pub fn setting(&self, key: &str) -> Option<&serde_yaml::Value> {
        match self {
            Self::Flag(_) => None,
            Self::Detailed { settings, .. } => settings.get(key),
        }
    }
}

/// A configuration together with the file it came from.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: WorkspaceConfig,
    /// `None` when the workspace has no configuration file.
    pub source: Option<PathBuf>,
}

impl LoadedConfig {
    /// Whether a configuration file was found and parsed.
    pub fn found(&self) -> bool {
        self.source.is_some()
    }
}

impl WorkspaceConfig {
    /// Find the configuration file of a workspace.
    pub fn find(workspace: &Path) -> Option<PathBuf> {
        CONFIG_FILES.iter().map(|name| workspace.join(name)).find(|p| p.is_file())
    }

    /// Load the workspace configuration, applying environment overrides.
    ///
    /// A missing file yields defaults. A file that cannot be read or parsed
    /// is an error.
    pub fn load(workspace: &Path) -> Result<LoadedConfig, PipelineError> {
        let (mut config, source) = match Self::find(workspace) {
            Some(path) => (Self::load_from_file(&path)?, Some(path)),
            None => {
                tracing::debug!(path = ?workspace, "No configuration file, using defaults");
                (Self::default(), None)
            }
        };
        config.options.apply_env();
        Ok(LoadedConfig { config, source })
    }

    /// Load configuration from a specific file, without overrides.
    pub fn load_from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| PipelineError::ConfigRead { path: path.to_path_buf(), source })?;
        Self::from_yaml(&content)
            .map_err(|e| PipelineError::ConfigParse { path: path.to_path_buf(), message: e.to_string() })
    }

    /// Parse configuration from a YAML string. An empty document is the
    /// default configuration.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Write the configuration as `bcasl.yml` in the workspace.
    pub fn save(&self, workspace: &Path) -> Result<PathBuf, PipelineError> {
        let path = workspace.join(CONFIG_FILES[0]);
        let content = self
            .to_yaml()
            .map_err(|e| PipelineError::ConfigParse { path: path.clone(), message: e.to_string() })?;
        std::fs::write(&path, content)
            .map_err(|source| PipelineError::ConfigRead { path: path.clone(), source })?;
        Ok(path)
    }

    /// Build a starter configuration for a workspace.
    ///
    /// Every registered plugin is enabled, ordered by tag phase, and given
    /// its position in that order as priority.
    pub fn generate_default(workspace: &Path, registry: &PluginRegistry) -> Self {
        let required_files = DETECTED_REQUIRED_FILES
            .iter()
            .filter(|name| workspace.join(name).is_file())
            .map(|name| (*name).to_string())
            .collect();

        let mut by_phase: Vec<(u32, &str)> = registry
            .records()
            .map(|r| (Phase::for_tags(r.metadata().tags()).rank(), r.id()))
            .collect();
        by_phase.sort_unstable();

        let plugin_order: Vec<String> = by_phase.iter().map(|(_, id)| (*id).to_string()).collect();
        let plugins = plugin_order
            .iter()
            .enumerate()
            .map(|(idx, id)| {
                let settings = PluginSettings::Detailed {
                    enabled: true,
                    priority: Some(i32::try_from(idx).unwrap_or(i32::MAX)),
                    settings: BTreeMap::new(),
                };
                (id.clone(), settings)
            })
            .collect();

        Self {
            required_files,
            file_patterns: vec![DEFAULT_FILE_PATTERN.to_string()],
            exclude_patterns: default_excludes(),
            options: PipelineOptions::default(),
            plugins,
            plugin_order,
        }
    }
}

/// Exclude patterns written into generated configurations.
pub fn default_excludes() -> Vec<String> {
    ["**/__pycache__/**", "**/*.pyc", ".git/**", "venv/**", ".venv/**"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
