//! Plugin discovery.
//!
//! Scans a plugin directory for packages (immediate subdirectories holding a
//! `plugin.toml`), registers what each package provides and checks every
//! plugin's version requirements against the host before it reaches the
//! registry. A broken package never stops discovery of the others.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::{
    CommandPlugin, Entrypoint, HostVersions, Plugin, PluginError, PluginManifest, PluginOrigin,
    PluginRegistry, PluginResult, Registrar, UnmetRequirement, MANIFEST_FILE,
};

/// Factory producing a self-describing plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Callback staging any number of plugins.
pub type RegisterFn = fn(&mut Registrar) -> PluginResult<()>;

/// The closed set of plugins compiled into the binary.
///
/// Factories back `builtin = "<name>"` entries, registration callbacks back
/// `register = "<name>"` entries.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, PluginFactory>,
    registrars: BTreeMap<String, RegisterFn>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin factory under a name.
    #[must_use]
    pub fn with_factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Add a registration callback under a name.
    #[must_use]
    pub fn with_registrar(mut self, name: impl Into<String>, register: RegisterFn) -> Self {
        self.registrars.insert(name.into(), register);
        self
    }

    /// Create a fresh instance of a built-in plugin.
    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn registrar(&self, name: &str) -> Option<RegisterFn> {
        self.registrars.get(name).copied()
    }

    /// Names of all factories.
    pub fn factory_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Register every factory directly, without a plugin directory.
    pub fn register_all(&self, registry: &mut PluginRegistry) -> PluginResult<usize> {
        let mut added = 0;
        for (name, factory) in &self.factories {
            if registry.register(factory(), PluginOrigin::Builtin(name.clone()))? {
                added += 1;
            }
        }
        Ok(added)
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("registrars", &self.registrars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outcome of discovering one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscoveryEntry {
    /// A plugin was registered (or was already registered).
    Loaded { unit: PathBuf, plugin_id: String },
    /// The unit could not be loaded or registered.
    Failed { unit: PathBuf, error: String },
    /// A plugin's version requirements are not met by the host.
    Incompatible { unit: PathBuf, plugin_id: String, unmet: Vec<UnmetRequirement> },
}

impl fmt::Display for DiscoveryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded { unit, plugin_id } => {
                write!(f, "loaded '{plugin_id}' from {}", unit.display())
            }
            Self::Failed { unit, error } => write!(f, "{}: {error}", unit.display()),
            Self::Incompatible { unit, plugin_id, unmet } => {
                let reasons: Vec<String> = unmet.iter().map(ToString::to_string).collect();
                let reasons = if reasons.is_empty() {
                    "no explicit version requirements declared".to_string()
                } else {
                    reasons.join(", ")
                };
                write!(f, "{}: plugin '{plugin_id}' is incompatible: {reasons}", unit.display())
            }
        }
    }
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub entries: Vec<DiscoveryEntry>,
}

impl DiscoveryReport {
    /// Ids of plugins that were loaded.
    pub fn loaded(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                DiscoveryEntry::Loaded { plugin_id, .. } => Some(plugin_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DiscoveryEntry> {
        self.entries.iter().filter(|e| matches!(e, DiscoveryEntry::Failed { .. }))
    }

    pub fn incompatible(&self) -> impl Iterator<Item = &DiscoveryEntry> {
        self.entries.iter().filter(|e| matches!(e, DiscoveryEntry::Incompatible { .. }))
    }

    /// Whether any unit failed or was incompatible.
    pub fn has_problems(&self) -> bool {
        self.entries.iter().any(|e| !matches!(e, DiscoveryEntry::Loaded { .. }))
    }

    /// Human-readable lines for everything that went wrong.
    pub fn problems(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !matches!(e, DiscoveryEntry::Loaded { .. }))
            .map(ToString::to_string)
            .collect()
    }
}

/// Discovers plugin packages and fills a registry.
#[derive(Debug, Clone)]
pub struct PluginDiscovery {
    catalog: PluginCatalog,
    host: HostVersions,
    strict: bool,
}

impl PluginDiscovery {
    pub fn new(catalog: PluginCatalog) -> Self {
        Self { catalog, host: HostVersions::current(), strict: false }
    }

    /// Host component versions to check requirements against.
    #[must_use]
    pub fn host_versions(mut self, host: HostVersions) -> Self {
        self.host = host;
        self
    }

    /// Reject plugins that declare no version requirement at all.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Discover every package under `dir`.
    ///
    /// Re-running over an unchanged directory registers nothing new.
    pub fn discover(&self, dir: &Path, registry: &mut PluginRegistry) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        let read_dir = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::warn!(path = ?dir, error = %e, "Cannot read plugin directory");
                report.entries.push(DiscoveryEntry::Failed {
                    unit: dir.to_path_buf(),
                    error: PluginError::NotFound(dir.to_path_buf()).to_string(),
                });
                return report;
            }
        };

        let mut units: Vec<PathBuf> = read_dir
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                !name.starts_with("__") && !name.starts_with('.')
            })
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_FILE).is_file())
            .collect();
        units.sort();

        for unit in units {
            match self.load_unit(&unit, registry) {
                Ok(entries) => report.entries.extend(entries),
                Err(e) => {
                    tracing::warn!(path = ?unit, error = %e, "Failed to load plugin package");
                    report.entries.push(DiscoveryEntry::Failed { unit, error: e.to_string() });
                }
            }
        }

        report
    }

    /// Load a single package and register the plugins it provides.
    ///
    /// Errors cover the package as a whole (bad manifest, unknown
    /// entrypoint, failing callback). Per-plugin problems are returned as
    /// entries.
    pub fn load_unit(
        &self,
        unit: &Path,
        registry: &mut PluginRegistry,
    ) -> PluginResult<Vec<DiscoveryEntry>> {
        let manifest_path = unit.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(PluginError::NotFound(manifest_path));
        }

        let manifest = PluginManifest::from_file(&manifest_path)?;
        manifest.validate()?;

        let origin = PluginOrigin::Manifest(manifest_path.clone());
        let staged: Vec<Arc<dyn Plugin>> = match manifest.entrypoint()? {
            Entrypoint::Command(command) => {
                let meta = manifest.metadata().ok_or_else(|| {
                    PluginError::InvalidManifest("missing [plugin] section".to_string())
                })?;
                vec![Arc::new(CommandPlugin::new(meta, command.to_vec(), unit))]
            }
            Entrypoint::Builtin(name) => {
                let plugin = self.catalog.instantiate(name).ok_or_else(|| {
                    PluginError::UnknownEntrypoint { kind: "builtin", name: name.to_string() }
                })?;
                vec![plugin]
            }
            Entrypoint::Register(name) => {
                let register = self.catalog.registrar(name).ok_or_else(|| {
                    PluginError::UnknownEntrypoint { kind: "register", name: name.to_string() }
                })?;
                let mut registrar = Registrar::new();
                panic::catch_unwind(AssertUnwindSafe(|| register(&mut registrar)))
                    .map_err(|_| {
                        PluginError::LoadError(format!("registration callback '{name}' panicked"))
                    })?
                    .map_err(|e| {
                        PluginError::LoadError(format!("registration callback '{name}' failed: {e}"))
                    })?;
                if registrar.is_empty() {
                    return Err(PluginError::LoadError(format!(
                        "registration callback '{name}' registered no plugin"
                    )));
                }
                registrar.into_staged()
            }
        };

        let mut entries = Vec::with_capacity(staged.len());
        for plugin in staged {
            let meta = plugin.metadata();
            let plugin_id = meta.id().to_string();

            let unmet = self.host.unmet(meta.requirements());
            if !unmet.is_empty() || (self.strict && meta.requirements().is_unconstrained()) {
                let err = PluginError::Incompatible { id: plugin_id.clone(), unmet: unmet.clone() };
                tracing::warn!(plugin = %plugin_id, error = %err, "Skipping incompatible plugin");
                entries.push(DiscoveryEntry::Incompatible {
                    unit: unit.to_path_buf(),
                    plugin_id,
                    unmet,
                });
                continue;
            }

            match registry.register(plugin, origin.clone()) {
                Ok(_) => {
                    entries.push(DiscoveryEntry::Loaded { unit: unit.to_path_buf(), plugin_id });
                }
                Err(e) => {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to register plugin");
                    entries.push(DiscoveryEntry::Failed {
                        unit: unit.to_path_buf(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HookContext;
    use crate::plugin::{Component, HookError, PluginMetadata, VersionRequirements};
    use tempfile::TempDir;

    struct Fixed(PluginMetadata);

    impl Plugin for Fixed {
        fn metadata(&self) -> &PluginMetadata {
            &self.0
        }

        fn on_pre_compile(&self, _ctx: &HookContext) -> Result<(), HookError> {
            Ok(())
        }
    }

    fn bundle(reg: &mut Registrar) -> PluginResult<()> {
        reg.add(Fixed(PluginMetadata::new("fmt", "1.0.0").with_tags(["format"])));
        reg.add(Fixed(
            PluginMetadata::new("future", "1.0.0")
                .with_requirements(VersionRequirements::default().with(Component::Core, "9.0.0")),
        ));
        Ok(())
    }

    fn broken(_reg: &mut Registrar) -> PluginResult<()> {
        Err(PluginError::LoadError("exploded".to_string()))
    }

    fn exploding(_reg: &mut Registrar) -> PluginResult<()> {
        panic!("registrar bug")
    }

    fn catalog() -> PluginCatalog {
        PluginCatalog::new()
            .with_factory("strip", || {
                Arc::new(Fixed(PluginMetadata::new("strip", "1.0.0").with_tags(["clean"])))
            })
            .with_registrar("bundle", bundle)
            .with_registrar("broken", broken)
            .with_registrar("exploding", exploding)
    }

    fn package(root: &Path, name: &str, manifest: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }

    fn plugin_dir() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        package(root, "a_strip", "[entry]\nbuiltin = \"strip\"\n");
        package(root, "b_bundle", "[entry]\nregister = \"bundle\"\n");
        package(root, "c_broken", "[entry]\nregister = \"broken\"\n");
        package(root, "d_unknown", "[entry]\nbuiltin = \"nope\"\n");
        package(root, "e_bad_toml", "this is not toml [");
        package(root, "__pycache__", "[entry]\nbuiltin = \"strip\"\n");
        std::fs::create_dir_all(root.join("no_marker")).unwrap();
        temp
    }

    #[test]
    fn test_discover_collects_failures_without_stopping() {
        let temp = plugin_dir();
        let mut registry = PluginRegistry::new();
        let report = PluginDiscovery::new(catalog()).discover(temp.path(), &mut registry);

        assert_eq!(registry.ids(), vec!["fmt", "strip"]);
        assert_eq!(report.loaded(), vec!["strip", "fmt"]);
        assert_eq!(report.failures().count(), 3);
        assert_eq!(report.incompatible().count(), 1);
        assert!(report.has_problems());
    }

    #[test]
    fn test_panicking_registrar_is_isolated() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), "a_exploding", "[entry]\nregister = \"exploding\"\n");
        package(temp.path(), "b_strip", "[entry]\nbuiltin = \"strip\"\n");

        let mut registry = PluginRegistry::new();
        let report = PluginDiscovery::new(catalog()).discover(temp.path(), &mut registry);

        assert_eq!(registry.ids(), vec!["strip"]);
        assert_eq!(report.failures().count(), 1);
        assert!(report.problems()[0].contains("panicked"));
    }

    #[test]
    fn test_incompatible_reports_requirement() {
        let temp = plugin_dir();
        let mut registry = PluginRegistry::new();
        let report = PluginDiscovery::new(catalog()).discover(temp.path(), &mut registry);

        let entry = report.incompatible().next().unwrap();
        match entry {
            DiscoveryEntry::Incompatible { plugin_id, unmet, .. } => {
                assert_eq!(plugin_id, "future");
                assert_eq!(unmet[0].component, Component::Core);
                assert_eq!(unmet[0].required, "9.0.0");
                assert_eq!(unmet[0].available, "1.0.0");
            }
            other => panic!("unexpected entry {other:?}"),
        }
        assert!(!registry.contains("future"));
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let temp = plugin_dir();
        let discovery = PluginDiscovery::new(catalog());
        let mut registry = PluginRegistry::new();

        let first = discovery.discover(temp.path(), &mut registry);
        let ids = registry.ids();
        let second = discovery.discover(temp.path(), &mut registry);

        assert_eq!(registry.ids(), ids);
        assert_eq!(first.loaded(), second.loaded());
        assert!(!second
            .failures()
            .any(|e| e.to_string().contains("already registered")));
    }

    #[test]
    fn test_strict_mode_rejects_unconstrained() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), "strip", "[entry]\nbuiltin = \"strip\"\n");

        let mut registry = PluginRegistry::new();
        let report =
            PluginDiscovery::new(catalog()).strict(true).discover(temp.path(), &mut registry);
        assert!(registry.is_empty());
        assert!(report.problems()[0].contains("no explicit version requirements"));
    }

    #[test]
    fn test_missing_directory() {
        let mut registry = PluginRegistry::new();
        let report = PluginDiscovery::new(catalog())
            .discover(Path::new("/nonexistent/bcasl/plugins"), &mut registry);
        assert_eq!(report.failures().count(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_command_package() {
        let temp = TempDir::new().unwrap();
        package(
            temp.path(),
            "hdr",
            "[plugin]\nid = \"hdr\"\nversion = \"1.0.0\"\ntags = [\"license\"]\n\n[entry]\ncommand = [\"true\"]\n",
        );
        let mut registry = PluginRegistry::new();
        PluginDiscovery::new(PluginCatalog::new()).discover(temp.path(), &mut registry);

        let record = registry.get("hdr").unwrap();
        assert_eq!(record.metadata().tags(), ["license"]);
        assert!(matches!(record.origin(), PluginOrigin::Manifest(_)));
    }

    #[test]
    fn test_catalog_register_all() {
        let mut registry = PluginRegistry::new();
        assert_eq!(catalog().register_all(&mut registry).unwrap(), 1);
        assert_eq!(catalog().register_all(&mut registry).unwrap(), 0);
    }
}
