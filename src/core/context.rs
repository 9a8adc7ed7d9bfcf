//! What plugins see of the workspace.
//!
//! An [`ExecutionContext`] is built once per pipeline run and shared by all
//! plugins. It is read-only apart from the `iter_files` cache, which is
//! safe for concurrent use and dies with the run.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use glob::Pattern;
use parking_lot::{Mutex, RwLock};
use walkdir::WalkDir;

use super::config::DEFAULT_FILE_PATTERN;
use super::{LoadedConfig, WorkspaceConfig};

type CacheKey = (Vec<String>, Vec<String>);

/// Read-only view of the workspace for one run.
#[derive(Debug)]
pub struct ExecutionContext {
    root: PathBuf,
    name: String,
    config: WorkspaceConfig,
    config_found: bool,
    file_patterns: Vec<String>,
    cache: RwLock<HashMap<CacheKey, Arc<[PathBuf]>>>,
    scans: AtomicUsize,
    pending_switch: Mutex<Option<PathBuf>>,
}

impl ExecutionContext {
    /// Create a context from a loaded configuration.
    pub fn new(root: &Path, loaded: LoadedConfig) -> Self {
        let found = loaded.found();
        Self::with_config(root, loaded.config, found)
    }

    /// Create a context from a configuration.
    pub fn with_config(root: &Path, config: WorkspaceConfig, config_found: bool) -> Self {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        let file_patterns = if config.file_patterns.is_empty() {
            vec![DEFAULT_FILE_PATTERN.to_string()]
        } else {
            config.file_patterns.clone()
        };

        Self {
            root: root.to_path_buf(),
            name,
            config,
            config_found,
            file_patterns,
            cache: RwLock::new(HashMap::new()),
            scans: AtomicUsize::new(0),
            pending_switch: Mutex::new(None),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    /// Display name (the root directory's name).
    pub fn workspace_name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Include patterns, `**/*.py` when none are configured.
    pub fn file_patterns(&self) -> &[String] {
        &self.file_patterns
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.config.exclude_patterns
    }

    pub fn required_files(&self) -> &std::collections::BTreeSet<String> {
        &self.config.required_files
    }

    /// Whether `name` is a required file and exists in the workspace.
    pub fn has_required_file(&self, name: &str) -> bool {
        self.config.required_files.contains(name) && self.root.join(name).is_file()
    }

    /// True iff the workspace configuration file was found and parsed.
    pub fn is_valid(&self) -> bool {
        self.config_found && self.root.is_dir()
    }

    /// A plugin-specific setting from the `plugins` section.
    pub fn plugin_setting(&self, plugin_id: &str, key: &str) -> Option<&serde_yaml::Value> {
        self.config.plugins.get(plugin_id)?.setting(key)
    }

    /// Files under the workspace matching any `include` glob and no
    /// `exclude` glob, relative paths matched with `/` separators.
    ///
    /// An empty `include` matches every file. Results are sorted and
    /// deduplicated. With `options.iter_files_cache` on, identical pattern
    /// sets are scanned once per run.
    pub fn iter_files(&self, include: &[String], exclude: &[String]) -> Arc<[PathBuf]> {
        if !self.config.options.iter_files_cache {
            return self.scan(include, exclude);
        }

        let key = cache_key(include, exclude);
        if let Some(hit) = self.cache.read().get(&key) {
            return Arc::clone(hit);
        }

        let mut cache = self.cache.write();
        if let Some(hit) = cache.get(&key) {
            return Arc::clone(hit);
        }
        let files = self.scan(include, exclude);
        cache.insert(key, Arc::clone(&files));
        files
    }

    /// `iter_files` over the configured include/exclude patterns.
    pub fn workspace_files(&self) -> Arc<[PathBuf]> {
        self.iter_files(&self.file_patterns, &self.config.exclude_patterns)
    }

    /// Number of filesystem scans performed so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    /// Ask the caller to switch to another workspace once the current
    /// plugin returns. Always accepted.
    ///
    /// The context keeps describing the old workspace; plugins must not rely
    /// on it after issuing the request.
    pub fn request_workspace_switch(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        tracing::info!(path = ?path, "workspace switch requested");
        *self.pending_switch.lock() = Some(path);
        true
    }

    /// Take the queued workspace switch, if any.
    pub fn take_workspace_switch(&self) -> Option<PathBuf> {
        self.pending_switch.lock().take()
    }

    fn scan(&self, include: &[String], exclude: &[String]) -> Arc<[PathBuf]> {
        self.scans.fetch_add(1, Ordering::Relaxed);

        let include = compile(include);
        let exclude = compile(exclude);

        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&self.root).ok()?;
                let rel = rel.to_string_lossy().replace('\\', "/");
                let included = include.is_empty() || include.iter().any(|p| p.matches(&rel));
                let excluded = exclude.iter().any(|p| p.matches(&rel));
                (included && !excluded).then(|| entry.into_path())
            })
            .collect();
        files.sort();
        files.dedup();
        files.into()
    }
}

fn cache_key(include: &[String], exclude: &[String]) -> CacheKey {
    let mut inc = include.to_vec();
    let mut exc = exclude.to_vec();
    inc.sort();
    inc.dedup();
    exc.sort();
    exc.dedup();
    (inc, exc)
}

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "Ignoring invalid glob pattern");
                None
            }
        })
        .collect()
}

/// Cooperative cancellation flag shared with a running plugin.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The context handed to one plugin invocation.
///
/// Dereferences to the shared [`ExecutionContext`] and adds the plugin's
/// log sink and cancellation token.
#[derive(Debug, Clone)]
pub struct HookContext {
    ctx: Arc<ExecutionContext>,
    plugin_id: String,
    cancel: CancelToken,
    logs: Arc<Mutex<Vec<String>>>,
}

impl HookContext {
    pub fn new(ctx: Arc<ExecutionContext>, plugin_id: &str, cancel: CancelToken) -> Self {
        Self { ctx, plugin_id: plugin_id.to_string(), cancel, logs: Arc::default() }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Record a log line for this plugin.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(plugin = %self.plugin_id, "{line}");
        self.logs.lock().push(line);
    }

    /// Whether the executor gave up on this invocation.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn shared(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Drain the recorded log lines.
    pub fn take_logs(&self) -> Vec<String> {
        std::mem::take(&mut *self.logs.lock())
    }
}

impl Deref for HookContext {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for file in ["main.py", "src/app/core.py", "src/app/__pycache__/core.pyc", "venv/lib/x.py", "README.md"] {
            let path = root.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "").unwrap();
        }
        temp
    }

    fn context(root: &Path, yaml: &str) -> ExecutionContext {
        ExecutionContext::with_config(root, WorkspaceConfig::from_yaml(yaml).unwrap(), true)
    }

    fn rel(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_iter_files_include_exclude() {
        let temp = workspace();
        let ctx = context(temp.path(), "");

        let files = ctx.iter_files(&["**/*.py".into()], &["venv/**".into()]);
        assert_eq!(rel(temp.path(), &files), vec!["main.py", "src/app/core.py"]);

        let all = ctx.iter_files(&[], &[]);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_iter_files_cached() {
        let temp = workspace();
        let ctx = context(temp.path(), "");

        let first = ctx.iter_files(&["**/*.py".into()], &["venv/**".into()]);
        let second = ctx.iter_files(&["**/*.py".into()], &["venv/**".into()]);
        assert_eq!(first, second);
        assert_eq!(ctx.scan_count(), 1);

        // Pattern order does not matter for the cache key
        ctx.iter_files(&["**/*.md".into(), "**/*.py".into()], &[]);
        ctx.iter_files(&["**/*.py".into(), "**/*.md".into()], &[]);
        assert_eq!(ctx.scan_count(), 2);
    }

    #[test]
    fn test_iter_files_cache_disabled() {
        let temp = workspace();
        let ctx = context(temp.path(), "options:\n  iter_files_cache: false\n");

        ctx.iter_files(&["**/*.py".into()], &[]);
        ctx.iter_files(&["**/*.py".into()], &[]);
        assert_eq!(ctx.scan_count(), 2);
    }

    #[test]
    fn test_default_patterns_and_name() {
        let temp = workspace();
        let ctx = context(temp.path(), "exclude_patterns: ['venv/**']");
        assert_eq!(ctx.file_patterns(), ["**/*.py"]);
        assert_eq!(ctx.workspace_files().len(), 2);
        assert_eq!(ctx.workspace_name(), temp.path().file_name().unwrap().to_string_lossy());
    }

    #[test]
    fn test_required_files() {
        let temp = workspace();
        let ctx = context(temp.path(), "required_files: [main.py, setup.py]");
        assert!(ctx.has_required_file("main.py"));
        assert!(!ctx.has_required_file("setup.py"));
        // Present but not required
        assert!(!ctx.has_required_file("README.md"));
    }

    #[test]
    fn test_validity_follows_config() {
        let temp = workspace();
        let ctx = ExecutionContext::with_config(temp.path(), WorkspaceConfig::default(), false);
        assert!(!ctx.is_valid());
        assert!(context(temp.path(), "").is_valid());
    }

    #[test]
    fn test_workspace_switch_is_queued() {
        let temp = workspace();
        let ctx = context(temp.path(), "");
        assert!(ctx.request_workspace_switch("/other/project"));
        assert_eq!(ctx.workspace_root(), temp.path());
        assert_eq!(ctx.take_workspace_switch(), Some(PathBuf::from("/other/project")));
        assert_eq!(ctx.take_workspace_switch(), None);
    }

    #[test]
    fn test_hook_context_logs() {
        let temp = workspace();
        let hook = HookContext::new(Arc::new(context(temp.path(), "")), "p", CancelToken::new());
        hook.log("one");
        hook.log(String::from("two"));
        assert_eq!(hook.take_logs(), vec!["one", "two"]);
        assert!(hook.take_logs().is_empty());
        assert!(!hook.is_cancelled());
        hook.cancel_token().cancel();
        assert!(hook.is_cancelled());
    }
}
