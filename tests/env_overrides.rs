//! Environment Override Tests
//!
//! `BCASL_PLUGIN_TIMEOUT` and `BCASL_PLUGIN_PARALLELISM` win over the
//! workspace file. These tests mutate the process environment, so they live
//! in their own test binary and run serially.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bcasl::core::{HookContext, PipelineRunner, PluginStatus, ENV_PLUGIN_PARALLELISM, ENV_PLUGIN_TIMEOUT};
use bcasl::plugin::{HookError, Plugin, PluginMetadata, PluginRegistry};
use serial_test::serial;
use tempfile::TempDir;

struct Sleeper {
    meta: PluginMetadata,
    duration: Duration,
}

impl Plugin for Sleeper {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
        let until = Instant::now() + self.duration;
        while Instant::now() < until {
            if ctx.is_cancelled() {
                return Err(HookError::failed("cancelled"));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

fn sleepers(durations: &[(&str, u64)]) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for (id, ms) in durations {
        let plugin = Sleeper {
            meta: PluginMetadata::new(*id, "1.0.0"),
            duration: Duration::from_millis(*ms),
        };
        registry.register_inline(Arc::new(plugin)).unwrap();
    }
    registry
}

fn with_env<T>(key: &str, value: &str, f: impl FnOnce() -> T) -> T {
    std::env::set_var(key, value);
    let result = f();
    std::env::remove_var(key);
    result
}

fn write_config(workspace: &Path, yaml: &str) {
    fs::write(workspace.join("bcasl.yml"), yaml).unwrap();
}

#[test]
#[serial]
fn test_env_timeout_overrides_file() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "options:\n  plugin_timeout_s: 60\n");
    let registry = sleepers(&[("a_slow", 5_000), ("b_fast", 0)]);

    let start = Instant::now();
    let report = with_env(ENV_PLUGIN_TIMEOUT, "0.2", || {
        PipelineRunner::new(workspace.path()).registry(registry).run()
    })
    .unwrap();

    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(report.statuses(), vec![PluginStatus::TimedOut, PluginStatus::Succeeded]);
    assert!(report.is_proceed());
}

#[test]
#[serial]
fn test_env_timeout_zero_disables_file_timeout() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "options:\n  plugin_timeout_s: 0.05\n");
    let registry = sleepers(&[("a", 200)]);

    let report = with_env(ENV_PLUGIN_TIMEOUT, "0", || {
        PipelineRunner::new(workspace.path()).registry(registry).run()
    })
    .unwrap();

    assert_eq!(report.statuses(), vec![PluginStatus::Succeeded]);
}

#[test]
#[serial]
fn test_env_parallelism_overrides_file() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "options:\n  plugin_parallelism: 1\n");
    let registry = sleepers(&[("a", 300), ("b", 300), ("c", 300), ("d", 300)]);

    let start = Instant::now();
    let report = with_env(ENV_PLUGIN_PARALLELISM, "4", || {
        PipelineRunner::new(workspace.path()).registry(registry).run()
    })
    .unwrap();

    assert!(start.elapsed() < Duration::from_millis(1100));
    assert!(report.outcomes.iter().all(|o| o.status.is_success()));
}

#[test]
#[serial]
fn test_invalid_env_value_is_ignored() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "options:\n  plugin_timeout_s: 0.1\n");
    let registry = sleepers(&[("a", 2_000)]);

    let report = with_env(ENV_PLUGIN_TIMEOUT, "soon", || {
        PipelineRunner::new(workspace.path()).registry(registry).run()
    })
    .unwrap();

    assert_eq!(report.statuses(), vec![PluginStatus::TimedOut]);
}

#[test]
#[serial]
fn test_env_timeout_too_large_is_unlimited() {
    let workspace = TempDir::new().unwrap();
    write_config(workspace.path(), "options:\n  plugin_timeout_s: 0.05\n");
    let registry = sleepers(&[("a", 200)]);

    let report = with_env(ENV_PLUGIN_TIMEOUT, "1e20", || {
        PipelineRunner::new(workspace.path()).registry(registry).run()
    })
    .unwrap();

    assert_eq!(report.statuses(), vec![PluginStatus::Succeeded]);
}
