//! Plugin manifest parsing and validation.
//!
//! A plugin package is a directory holding a `plugin.toml` manifest. The
//! manifest describes the plugin and names exactly one entrypoint: an
//! external command, a built-in plugin factory or a registration callback.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{PluginError, PluginMetadata, PluginResult, VersionRequirements, DEFAULT_PRIORITY};

/// Plugin manifest containing metadata and the entrypoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin metadata. Required for command entrypoints.
    #[serde(default)]
    pub plugin: Option<ManifestPlugin>,
    /// How the plugin is registered.
    pub entry: ManifestEntry,
}

/// `[plugin]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPlugin {
    /// Unique identifier.
    pub id: String,
    /// Display name (defaults to the id).
    #[serde(default)]
    pub name: Option<String>,
    /// Plugin version.
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Phase tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ids of plugins that must run first.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub abort_on_timeout: bool,
    /// Minimum host component versions.
    #[serde(default)]
    pub requirements: VersionRequirements,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// `[entry]` section. Exactly one key must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// External program and arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Name of a built-in plugin factory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<String>,
    /// Name of a registration callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
}

/// Resolved entrypoint of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint<'a> {
    Command(&'a [String]),
    Builtin(&'a str),
    Register(&'a str),
}

impl PluginManifest {
    /// Parse a manifest from TOML string.
    pub fn from_toml(content: &str) -> PluginResult<Self> {
        toml::from_str(content).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Parse a manifest from a file.
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// The single entrypoint this manifest declares.
    pub fn entrypoint(&self) -> PluginResult<Entrypoint<'_>> {
        match (&self.entry.command, &self.entry.builtin, &self.entry.register) {
            (Some(cmd), None, None) => Ok(Entrypoint::Command(cmd)),
            (None, Some(name), None) => Ok(Entrypoint::Builtin(name)),
            (None, None, Some(name)) => Ok(Entrypoint::Register(name)),
            (None, None, None) => Err(PluginError::InvalidManifest(
                "[entry] must declare one of 'command', 'builtin' or 'register'".to_string(),
            )),
            _ => Err(PluginError::InvalidManifest(
                "[entry] must declare only one entrypoint".to_string(),
            )),
        }
    }

    /// Validate the manifest.
    pub fn validate(&self) -> PluginResult<()> {
        match self.entrypoint()? {
            Entrypoint::Command(cmd) => {
                if cmd.first().is_none_or(|program| program.trim().is_empty()) {
                    return Err(PluginError::InvalidManifest(
                        "Entry command must name a program".to_string(),
                    ));
                }
                if self.plugin.is_none() {
                    return Err(PluginError::InvalidManifest(
                        "Command plugins require a [plugin] section".to_string(),
                    ));
                }
            }
            Entrypoint::Builtin(name) | Entrypoint::Register(name) => {
                if name.trim().is_empty() {
                    return Err(PluginError::InvalidManifest(
                        "Entrypoint name is required".to_string(),
                    ));
                }
            }
        }

        let Some(plugin) = &self.plugin else {
            return Ok(());
        };

        // Validate plugin id
        if plugin.id.trim().is_empty() {
            return Err(PluginError::InvalidManifest("Plugin id is required".to_string()));
        }

        if !plugin.id.trim().chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(PluginError::InvalidManifest(
                "Plugin id must contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            ));
        }

        if super::Version::parse(&plugin.version).is_none() {
            return Err(PluginError::InvalidManifest(format!(
                "Invalid plugin version '{}' (expected e.g. 1.0.0)",
                plugin.version
            )));
        }

        Ok(())
    }

    /// Build plugin metadata from the `[plugin]` section, if present.
    pub fn metadata(&self) -> Option<PluginMetadata> {
        let plugin = self.plugin.as_ref()?;
        let mut meta = PluginMetadata::new(&plugin.id, &plugin.version)
            .with_description(&plugin.description)
            .with_author(&plugin.author)
            .with_tags(&plugin.tags)
            .with_requires(plugin.requires.iter().cloned())
            .with_priority(plugin.priority)
            .with_abort_on_timeout(plugin.abort_on_timeout)
            .with_requirements(plugin.requirements.clone());
        if let Some(name) = &plugin.name {
            meta = meta.with_name(name);
        }
        Some(meta)
    }
}
