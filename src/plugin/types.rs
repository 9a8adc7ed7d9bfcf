//! Core plugin types: metadata, origin and the hook interface.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{HookError, VersionRequirements, WorkerCommand, WorkerRequest};
use crate::core::HookContext;

/// Name of the manifest file that marks a plugin package.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Priority given to plugins that do not declare one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Exit code a worker process uses to veto the build.
pub const VETO_EXIT_CODE: i32 = 3;

/// Declared, immutable description of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    id: String,
    name: String,
    version: String,
    description: String,
    author: String,
    tags: Vec<String>,
    requirements: VersionRequirements,
    requires: BTreeSet<String>,
    priority: i32,
    abort_on_timeout: bool,
}

impl PluginMetadata {
    /// Create metadata with an id and a version. The id doubles as the name.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            version: version.into().trim().to_string(),
            description: String::new(),
            author: String::new(),
            tags: Vec::new(),
            requirements: VersionRequirements::default(),
            requires: BTreeSet::new(),
            priority: DEFAULT_PRIORITY,
            abort_on_timeout: false,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set the tags. Tags are lowercased, trimmed and deduplicated while
    /// keeping their first-seen order.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags.clear();
        for tag in tags {
            let tag = tag.as_ref().trim().to_lowercase();
            if !tag.is_empty() && !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    #[must_use]
    pub fn with_requirements(mut self, requirements: VersionRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Plugins that must run before this one.
    #[must_use]
    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires
            .into_iter()
            .map(|s| s.into().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Make a timeout of this plugin abort the whole build.
    #[must_use]
    pub fn with_abort_on_timeout(mut self, abort: bool) -> Self {
        self.abort_on_timeout = abort;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn requirements(&self) -> &VersionRequirements {
        &self.requirements
    }

    pub fn requires(&self) -> &BTreeSet<String> {
        &self.requires
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn abort_on_timeout(&self) -> bool {
        self.abort_on_timeout
    }
}

/// A pre-compilation plugin.
///
/// Plugins are expected to be idempotent: running the pipeline twice over an
/// unchanged workspace must be safe.
pub trait Plugin: Send + Sync {
    /// Declared metadata.
    fn metadata(&self) -> &PluginMetadata;

    /// Run the pre-compile hook.
    ///
    /// Return [`HookError::Veto`] to stop the build, [`HookError::Failed`]
    /// to report a failure while letting the pipeline continue.
    fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError>;

    /// The process that runs this plugin in isolation, if the plugin brings
    /// its own. In-binary plugins return `None` and are isolated through the
    /// host worker.
    fn worker_command(&self, _request: &WorkerRequest) -> Option<WorkerCommand> {
        None
    }
}

/// Where a registered plugin came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PluginOrigin {
    /// Loaded from a package manifest.
    Manifest(PathBuf),
    /// A built-in plugin from the catalog.
    Builtin(String),
    /// Registered directly through the API.
    Inline,
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manifest(path) => write!(f, "{}", path.display()),
            Self::Builtin(name) => write!(f, "builtin:{name}"),
            Self::Inline => f.write_str("inline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_normalized() {
        let meta = PluginMetadata::new(" lint ", "1.0.0").with_tags(["Lint", "STYLE", "lint", " "]);
        assert_eq!(meta.id(), "lint");
        assert_eq!(meta.tags(), ["lint", "style"]);
    }

    #[test]
    fn test_defaults() {
        let meta = PluginMetadata::new("p", "0.1.0");
        assert_eq!(meta.name(), "p");
        assert_eq!(meta.priority(), DEFAULT_PRIORITY);
        assert!(meta.requires().is_empty());
        assert!(!meta.abort_on_timeout());
    }

    #[test]
    fn test_requires_trimmed() {
        let meta = PluginMetadata::new("p", "0.1.0").with_requires([" a", "b ", ""]);
        assert_eq!(meta.requires().iter().collect::<Vec<_>>(), ["a", "b"]);
    }
}
