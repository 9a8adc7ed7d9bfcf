//! Plugins shipped with the binary.

use std::sync::Arc;

use super::{HookError, Plugin, PluginCatalog, PluginMetadata, VersionRequirements};
use crate::core::HookContext;

/// The catalog of built-in plugins.
pub fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with_factory("cleaner", || Arc::new(Cleaner::new()))
        .with_factory("required_files", || Arc::new(RequiredFiles::new()))
}

fn requirements() -> VersionRequirements {
    VersionRequirements {
        loader: "2.0.0".to_string(),
        core: "1.0.0".to_string(),
        sdk: "1.0.0".to_string(),
        context: "1.0.0".to_string(),
        utilities: "1.0.0".to_string(),
    }
}

/// Removes compiled Python bytecode left over from previous runs.
#[derive(Debug)]
pub struct Cleaner {
    metadata: PluginMetadata,
}

impl Cleaner {
    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new("cleaner", "1.0.0")
                .with_name("Cleaner")
                .with_description("Remove *.pyc files and __pycache__ directories")
                .with_tags(["clean"])
                .with_requirements(requirements()),
        }
    }
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Cleaner {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
        if !ctx.is_valid() {
            ctx.log("workspace has no configuration, nothing to clean");
            return Ok(());
        }

        let excludes = ctx.exclude_patterns().to_vec();
        let mut removed_files = 0;
        for path in ctx.iter_files(&["**/*.pyc".to_string()], &excludes).iter() {
            if ctx.is_cancelled() {
                return Err(HookError::failed("cancelled"));
            }
            match std::fs::remove_file(path) {
                Ok(()) => removed_files += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => ctx.log(format!("cannot remove {}: {e}", path.display())),
            }
        }

        let mut removed_dirs = 0;
        let root = ctx.workspace_root();
        let caches: Vec<_> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir() && e.file_name() == "__pycache__")
            .map(|e| e.into_path())
            .collect();
        for dir in caches {
            if ctx.is_cancelled() {
                return Err(HookError::failed("cancelled"));
            }
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => removed_dirs += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => ctx.log(format!("cannot remove {}: {e}", dir.display())),
            }
        }

        ctx.log(format!("removed {removed_files} .pyc file(s), {removed_dirs} __pycache__ dir(s)"));
        Ok(())
    }
}

/// Vetoes the build when a configured required file is missing.
#[derive(Debug)]
pub struct RequiredFiles {
    metadata: PluginMetadata,
}

impl RequiredFiles {
    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new("required_files", "1.0.0")
                .with_name("Required files")
                .with_description("Check that every required file exists in the workspace")
                .with_tags(["validation"])
                .with_requirements(requirements()),
        }
    }
}

impl Default for RequiredFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for RequiredFiles {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
        let missing: Vec<&str> = ctx
            .required_files()
            .iter()
            .filter(|f| !ctx.has_required_file(f))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            ctx.log(format!("{} required file(s) present", ctx.required_files().len()));
            Ok(())
        } else {
            Err(HookError::veto(format!("missing required file(s): {}", missing.join(", "))))
        }
    }
}
