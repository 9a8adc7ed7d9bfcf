//! Registry of discovered plugins.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{Plugin, PluginError, PluginMetadata, PluginOrigin, PluginResult};
use crate::core::WorkspaceConfig;

/// A registered plugin with its derived, configuration-dependent state.
#[derive(Clone)]
pub struct PluginRecord {
    plugin: Arc<dyn Plugin>,
    origin: PluginOrigin,
    insert_idx: usize,
    /// Whether the plugin takes part in the run.
    pub enabled: bool,
    /// Effective priority; lower runs earlier.
    pub priority: i32,
    /// Effective dependencies.
    pub requires: BTreeSet<String>,
}

impl PluginRecord {
    fn new(plugin: Arc<dyn Plugin>, origin: PluginOrigin, insert_idx: usize) -> Self {
        let meta = plugin.metadata();
        let priority = meta.priority();
        let requires = meta.requires().clone();
        Self { plugin, origin, insert_idx, enabled: true, priority, requires }
    }

    pub fn id(&self) -> &str {
        self.plugin.metadata().id()
    }

    pub fn metadata(&self) -> &PluginMetadata {
        self.plugin.metadata()
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn origin(&self) -> &PluginOrigin {
        &self.origin
    }

    /// Registration sequence number.
    pub fn insert_idx(&self) -> usize {
        self.insert_idx
    }

    fn reset(&mut self) {
        let meta = self.plugin.metadata();
        self.enabled = true;
        self.priority = meta.priority();
        self.requires = meta.requires().clone();
    }
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id())
            .field("origin", &self.origin)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("requires", &self.requires)
            .finish()
    }
}

/// Holds plugin records keyed by id.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    records: BTreeMap<String, PluginRecord>,
    next_idx: usize,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin.
    ///
    /// Returns `Ok(true)` when the plugin was added and `Ok(false)` when the
    /// same plugin was already registered. A different plugin claiming a
    /// known id is rejected.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>, origin: PluginOrigin) -> PluginResult<bool> {
        let id = plugin.metadata().id().to_string();
        if id.is_empty() {
            return Err(PluginError::LoadError("plugin id must not be empty".to_string()));
        }

        if let Some(existing) = self.records.get(&id) {
            let same = match (&existing.origin, &origin) {
                (PluginOrigin::Inline, PluginOrigin::Inline) => {
                    Arc::ptr_eq(&existing.plugin, &plugin)
                }
                (a, b) => a == b,
            };
            if same {
                tracing::debug!(plugin = %id, "plugin already registered");
                return Ok(false);
            }
            return Err(PluginError::DuplicateId { id, existing: existing.origin.to_string() });
        }

        tracing::debug!(plugin = %id, origin = %origin, "registered plugin");
        let record = PluginRecord::new(plugin, origin, self.next_idx);
        self.next_idx += 1;
        self.records.insert(id, record);
        Ok(true)
    }

    /// Register a plugin through the API.
    pub fn register_inline(&mut self, plugin: Arc<dyn Plugin>) -> PluginResult<bool> {
        self.register(plugin, PluginOrigin::Inline)
    }

    /// Merge per-plugin configuration into the records.
    ///
    /// Every record is reset to its declared state first, so applying a
    /// configuration twice gives the same result.
    pub fn apply_config(&mut self, config: &WorkspaceConfig) {
        for (id, record) in &mut self.records {
            record.reset();
            if let Some(settings) = config.plugins.get(id) {
                record.enabled = settings.enabled();
                if let Some(priority) = settings.priority() {
                    record.priority = priority;
                }
            }
        }

        for id in config.plugins.keys() {
            if !self.records.contains_key(id) {
                tracing::debug!(plugin = %id, "configuration names an unknown plugin");
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// All records, sorted by id.
    pub fn records(&self) -> impl Iterator<Item = &PluginRecord> {
        self.records.values()
    }

    /// Enabled records, sorted by id.
    pub fn enabled(&self) -> impl Iterator<Item = &PluginRecord> {
        self.records.values().filter(|r| r.enabled)
    }

    /// All registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Staging area handed to registration callbacks.
///
/// Plugins collected here are checked for compatibility before they reach
/// the registry.
#[derive(Default)]
pub struct Registrar {
    staged: Vec<Arc<dyn Plugin>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a plugin for registration.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.staged.push(plugin);
    }

    /// Stage a plugin by value.
    pub fn add<P: Plugin + 'static>(&mut self, plugin: P) {
        self.staged.push(Arc::new(plugin));
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub(crate) fn into_staged(self) -> Vec<Arc<dyn Plugin>> {
        self.staged
    }
}
