//! Pipeline Integration Tests
//!
//! Drives `PipelineRunner` through the public API with real workspaces and
//! plugin packages.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bcasl::core::{HookContext, PipelineRunner, PluginStatus, Verdict};
use bcasl::plugin::{HookError, Plugin, PluginMetadata, PluginRegistry};
use parking_lot::Mutex;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

fn write_config(workspace: &Path, yaml: &str) {
    fs::write(workspace.join("bcasl.yml"), yaml).unwrap();
}

/// Write a plugin package with the given `[plugin]` and `[entry]` bodies.
fn write_package(plugins_dir: &Path, name: &str, manifest: &str) {
    let dir = plugins_dir.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("plugin.toml"), manifest).unwrap();
}

fn command_manifest(id: &str, tags: &str, script: &str) -> String {
    format!(
        "[plugin]\nid = \"{id}\"\nversion = \"1.0.0\"\ntags = {tags}\n\n[entry]\ncommand = [\"sh\", \"-c\", '{script}']\n"
    )
}

/// Inline plugin that records the order it ran in.
struct Recorder {
    meta: PluginMetadata,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Plugin for Recorder {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
        self.seen.lock().push(ctx.plugin_id().to_string());
        Ok(())
    }
}

fn recorder_registry(metas: Vec<PluginMetadata>) -> (PluginRegistry, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::new();
    for meta in metas {
        registry.register_inline(Arc::new(Recorder { meta, seen: Arc::clone(&seen) })).unwrap();
    }
    (registry, seen)
}

// ============================================================================
// Built-in Plugins
// ============================================================================

#[test]
fn test_builtins_clean_and_validate() {
    let workspace = TempDir::new().unwrap();
    let root = workspace.path();
    write_config(root, "required_files: [main.py]\n");
    fs::write(root.join("main.py"), "print('hi')\n").unwrap();
    fs::create_dir_all(root.join("pkg/__pycache__")).unwrap();
    fs::write(root.join("pkg/__pycache__/mod.cpython-312.pyc"), b"\0").unwrap();
    fs::write(root.join("pkg/stale.pyc"), b"\0").unwrap();

    let report = PipelineRunner::new(root).run().unwrap();

    assert_eq!(report.verdict, Verdict::Proceed);
    assert_eq!(report.statuses(), vec![PluginStatus::Succeeded, PluginStatus::Succeeded]);
    assert!(!root.join("pkg/__pycache__").exists());
    assert!(!root.join("pkg/stale.pyc").exists());
    assert!(root.join("main.py").exists());
}

#[test]
fn test_rerun_on_unchanged_workspace_is_safe() {
    let workspace = TempDir::new().unwrap();
    let root = workspace.path();
    write_config(root, "required_files: [main.py]\n");
    fs::write(root.join("main.py"), "").unwrap();
    fs::write(root.join("old.pyc"), b"\0").unwrap();

    let runner = PipelineRunner::new(root);
    let first = runner.run().unwrap();
    let second = runner.run().unwrap();

    assert!(first.is_proceed());
    assert!(second.is_proceed());
    assert_eq!(first.statuses(), second.statuses());
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn test_missing_required_file_vetoes() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "required_files: [main.py, LICENSE]\n");
    fs::write(workspace.path().join("main.py"), "").unwrap();

    let report = PipelineRunner::new(workspace.path()).run().unwrap();

    assert_eq!(report.verdict, Verdict::Abort);
    let outcome = report.get("required_files").unwrap();
    assert_eq!(outcome.status, PluginStatus::Vetoed);
    assert!(outcome.message.as_deref().unwrap().contains("LICENSE"));
}

#[test]
fn test_global_disable_short_circuits() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "required_files: [nope.py]\noptions:\n  enabled: false\n");

    let report = PipelineRunner::new(workspace.path()).run().unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(report.verdict, Verdict::Proceed);
    assert_eq!(report.summary(), format!(
        "Plugins: 0/0 ok, 0 failed, 0 timed out, 0 vetoed, 0 skipped ({} ms)",
        report.total_duration.as_millis()
    ));
}

#[test]
fn test_plugin_disabled_in_config_is_not_run() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "required_files: [nope.py]\nplugins:\n  required_files: false\n");

    let report = PipelineRunner::new(workspace.path()).run().unwrap();
    assert!(report.get("required_files").is_none());
    assert!(report.is_proceed());
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_requires_beats_priority() {
    let workspace = TempDir::new().unwrap();
    let (registry, seen) = recorder_registry(vec![
        PluginMetadata::new("early", "1.0.0").with_priority(1).with_requires(["late"]),
        PluginMetadata::new("late", "1.0.0").with_priority(50),
        PluginMetadata::new("lint", "1.0.0").with_tags(["lint"]),
    ]);

    let report = PipelineRunner::new(workspace.path()).registry(registry).run().unwrap();

    assert_eq!(*seen.lock(), vec!["late", "early", "lint"]);
    let ids: Vec<_> = report.outcomes.iter().map(|o| o.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["late", "early", "lint"]);
}

#[test]
fn test_explicit_order_and_cycle_warning() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "plugin_order: [zeta, alpha]\n");
    let (registry, seen) = recorder_registry(vec![
        PluginMetadata::new("alpha", "1.0.0"),
        PluginMetadata::new("zeta", "1.0.0"),
        PluginMetadata::new("x", "1.0.0").with_requires(["y"]),
        PluginMetadata::new("y", "1.0.0").with_requires(["x"]),
    ]);

    let report = PipelineRunner::new(workspace.path()).registry(registry).run().unwrap();

    assert_eq!(*seen.lock(), vec!["zeta", "alpha", "x", "y"]);
    assert_eq!(report.diagnostics.len(), 1);
    assert!(report.diagnostics[0].contains("x, y"));
    assert!(report.is_proceed());
}

#[test]
fn test_file_iteration_is_cached_across_plugins() {
    struct Scanner {
        meta: PluginMetadata,
        counts: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl Plugin for Scanner {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
            let files = ctx.iter_files(&["**/*.py".to_string()], &["tests/**".to_string()]);
            self.counts.lock().push((files.len(), ctx.scan_count()));
            Ok(())
        }
    }

    let workspace = TempDir::new().unwrap();
    let root = workspace.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("tests")).unwrap();
    fs::write(root.join("src/app.py"), "").unwrap();
    fs::write(root.join("main.py"), "").unwrap();
    fs::write(root.join("tests/test_app.py"), "").unwrap();

    let counts = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::new();
    for id in ["one", "two"] {
        let plugin =
            Scanner { meta: PluginMetadata::new(id, "1.0.0"), counts: Arc::clone(&counts) };
        registry.register_inline(Arc::new(plugin)).unwrap();
    }

    PipelineRunner::new(root).registry(registry).run().unwrap();
    assert_eq!(*counts.lock(), vec![(2, 1), (2, 1)]);
}

// ============================================================================
// Discovered Packages
// ============================================================================

#[test]
fn test_bad_packages_do_not_stop_discovery() {
    let workspace = TempDir::new().unwrap();
    let plugins = TempDir::new().unwrap();
    write_package(plugins.path(), "broken", "this is [not toml");
    write_package(
        plugins.path(),
        "future",
        "[plugin]\nid = \"future\"\nversion = \"1.0.0\"\n\n[plugin.requirements]\ncore = \"9.0.0\"\n\n[entry]\ncommand = [\"true\"]\n",
    );
    write_package(plugins.path(), "cleaner", "[entry]\nbuiltin = \"cleaner\"\n");
    fs::create_dir_all(plugins.path().join("__pycache__")).unwrap();

    let report = PipelineRunner::new(workspace.path()).plugins_dir(plugins.path()).run().unwrap();

    let ids: Vec<_> = report.outcomes.iter().map(|o| o.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["cleaner"]);
    assert_eq!(report.diagnostics.len(), 2);
    assert!(report.diagnostics.iter().any(|d| d.contains("core >= 9.0.0")));
}

#[cfg(unix)]
#[test]
fn test_command_plugins_follow_phases() {
    let workspace = TempDir::new().unwrap();
    let plugins = TempDir::new().unwrap();
    write_package(plugins.path(), "a_lint", &command_manifest("a_lint", "[\"lint\"]", "echo linted"));
    write_package(
        plugins.path(),
        "b_clean",
        &command_manifest("b_clean", "[\"clean\"]", "echo cleaned in $BCASL_PLUGIN_ID"),
    );

    let report = PipelineRunner::new(workspace.path()).plugins_dir(plugins.path()).run().unwrap();

    let ids: Vec<_> = report.outcomes.iter().map(|o| o.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["b_clean", "a_lint"]);
    assert_eq!(report.get("b_clean").unwrap().logs, vec!["cleaned in b_clean"]);
    assert!(report.is_proceed());
}

#[cfg(unix)]
#[test]
fn test_command_veto_skips_remaining() {
    let workspace = TempDir::new().unwrap();
    let plugins = TempDir::new().unwrap();
    write_package(
        plugins.path(),
        "license",
        &command_manifest("license", "[\"license\"]", "echo checking; echo LICENSE missing >&2; exit 3"),
    );
    write_package(plugins.path(), "lint", &command_manifest("lint", "[\"lint\"]", "echo linted"));
    write_package(plugins.path(), "broken_lint", &command_manifest("broken_lint", "[\"check\"]", "exit 7"));

    let report = PipelineRunner::new(workspace.path()).plugins_dir(plugins.path()).run().unwrap();

    assert_eq!(
        report.statuses(),
        vec![PluginStatus::Failed, PluginStatus::Vetoed, PluginStatus::Skipped]
    );
    assert_eq!(report.verdict, Verdict::Abort);
    assert_eq!(report.get("license").unwrap().message.as_deref(), Some("LICENSE missing"));
    assert_eq!(report.executed(), 2);
}

#[cfg(unix)]
#[test]
fn test_abort_on_timeout_package() {
    let workspace = TempDir::new().unwrap();
    let plugins = TempDir::new().unwrap();
    write_config(workspace.path(), "options:\n  plugin_timeout_s: 0.3\n");
    write_package(
        plugins.path(),
        "slow",
        "[plugin]\nid = \"slow\"\nversion = \"1.0.0\"\nabort_on_timeout = true\n\n[entry]\ncommand = [\"sleep\", \"5\"]\n",
    );

    let start = Instant::now();
    let report = PipelineRunner::new(workspace.path()).plugins_dir(plugins.path()).run().unwrap();

    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(report.statuses(), vec![PluginStatus::TimedOut]);
    assert_eq!(report.verdict, Verdict::Abort);
}

// ============================================================================
// Sandboxing
// ============================================================================

#[cfg(unix)]
#[test]
fn test_sandboxed_builtins_run_in_host_worker() {
    use bcasl::plugin::WorkerCommand;

    let workspace = TempDir::new().unwrap();
    let root = workspace.path();
    write_config(root, "required_files: [main.py]\noptions:\n  sandbox: true\n  plugin_timeout_s: 20\n");
    fs::write(root.join("stale.pyc"), b"\0").unwrap();

    let worker = WorkerCommand::new(env!("CARGO_BIN_EXE_bcasl")).args(["sandbox-worker"]);
    let report = PipelineRunner::new(root).host_worker(Some(worker)).run().unwrap();

    assert_eq!(report.get("cleaner").unwrap().status, PluginStatus::Succeeded);
    assert!(!root.join("stale.pyc").exists());

    let veto = report.get("required_files").unwrap();
    assert_eq!(veto.status, PluginStatus::Vetoed);
    assert_eq!(veto.message.as_deref(), Some("missing required file(s): main.py"));
    assert_eq!(report.verdict, Verdict::Abort);
}

#[cfg(unix)]
#[test]
fn test_sandbox_output_ceiling() {
    let workspace = TempDir::new().unwrap();
    let plugins = TempDir::new().unwrap();
    write_config(
        workspace.path(),
        "options:\n  sandbox: true\n  plugin_timeout_s: 10\n  plugin_limits:\n    fsize_mb: 1\n",
    );
    write_package(plugins.path(), "chatty", &command_manifest("chatty", "[]", "yes chatty"));

    let report = PipelineRunner::new(workspace.path()).plugins_dir(plugins.path()).run().unwrap();

    let outcome = report.get("chatty").unwrap();
    assert_eq!(outcome.status, PluginStatus::Failed);
    assert!(outcome.message.as_deref().unwrap().starts_with("resource limit exceeded"));
    assert!(report.is_proceed());
}
