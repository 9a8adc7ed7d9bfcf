//! Plugin system error types.

use std::path::PathBuf;
use thiserror::Error;

use super::UnmetRequirement;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur while loading or registering plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin package or file not found.
    #[error("Plugin not found: {0}")]
    NotFound(PathBuf),

    /// Invalid plugin manifest.
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// Plugin loading failed.
    #[error("Failed to load plugin: {0}")]
    LoadError(String),

    /// The manifest names an in-binary plugin the catalog does not know.
    #[error("Unknown {kind} entrypoint '{name}'")]
    UnknownEntrypoint { kind: &'static str, name: String },

    /// Another plugin is already registered under this id.
    #[error("Plugin id '{id}' is already registered by {existing}")]
    DuplicateId { id: String, existing: String },

    /// Plugin requirements not met by the host.
    #[error("Plugin '{id}' is incompatible: {}", format_unmet(.unmet))]
    Incompatible { id: String, unmet: Vec<UnmetRequirement> },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_unmet(unmet: &[UnmetRequirement]) -> String {
    if unmet.is_empty() {
        return "no explicit version requirements declared".to_string();
    }
    unmet.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Error returned by a plugin's pre-compile hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The hook failed; the pipeline carries on.
    #[error("{0}")]
    Failed(String),

    /// The build must not proceed.
    #[error("build vetoed: {0}")]
    Veto(String),
}

impl HookError {
    /// Shorthand for a failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Shorthand for a veto.
    pub fn veto(reason: impl Into<String>) -> Self {
        Self::Veto(reason.into())
    }

    /// Whether this error vetoes the build.
    pub fn is_veto(&self) -> bool {
        matches!(self, Self::Veto(_))
    }
}

impl From<std::io::Error> for HookError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<anyhow::Error> for HookError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Component;

    #[test]
    fn test_incompatible_message_lists_requirements() {
        let err = PluginError::Incompatible {
            id: "minify".to_string(),
            unmet: vec![UnmetRequirement {
                component: Component::Sdk,
                required: "3.0.0".to_string(),
                available: "1.0.0".to_string(),
            }],
        };
        assert_eq!(
            err.to_string(),
            "Plugin 'minify' is incompatible: sdk >= 3.0.0 (available: 1.0.0)"
        );
    }

    #[test]
    fn test_hook_error_conversions() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(HookError::from(io), HookError::Failed("gone".to_string()));

        let err: HookError = anyhow::anyhow!("boom").into();
        assert!(!err.is_veto());
        assert!(HookError::veto("license missing").is_veto());
    }
}
