//! Pipeline runner.
//!
//! Ties the pieces together for one workspace: configuration, discovery,
//! order resolution, execution and the final report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::{
    ExecutionContext, LoadedConfig, OrderResolver, PipelineError, PipelineReport, PluginExecutor,
    ResolvedOrder, Verdict, WorkspaceConfig,
};
use crate::plugin::{builtin, HostVersions, PluginCatalog, PluginDiscovery, PluginRegistry, WorkerCommand};

/// Everything decided before the first plugin runs.
#[derive(Debug)]
pub struct PipelinePlan {
    /// Canonical workspace root.
    pub workspace: PathBuf,
    pub loaded: LoadedConfig,
    /// Registry with the workspace configuration applied.
    pub registry: PluginRegistry,
    pub order: ResolvedOrder,
    /// Discovery problems and ordering warnings.
    pub diagnostics: Vec<String>,
}

impl PipelinePlan {
    pub fn config(&self) -> &WorkspaceConfig {
        &self.loaded.config
    }
}

/// Runs the pre-compilation pipeline for a workspace.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    workspace: PathBuf,
    plugins_dir: Option<PathBuf>,
    catalog: PluginCatalog,
    host: HostVersions,
    host_worker: Option<WorkerCommand>,
    registry: PluginRegistry,
}

impl PipelineRunner {
    /// Create a runner using the built-in plugin catalog.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            plugins_dir: None,
            catalog: builtin::catalog(),
            host: HostVersions::current(),
            host_worker: None,
            registry: PluginRegistry::new(),
        }
    }

    /// Discover plugin packages in this directory instead of registering
    /// the catalog's built-in plugins.
    #[must_use]
    pub fn plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugins_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn host_versions(mut self, host: HostVersions) -> Self {
        self.host = host;
        self
    }

    /// Worker command that isolates in-binary plugins when sandboxing.
    #[must_use]
    pub fn host_worker(mut self, command: Option<WorkerCommand>) -> Self {
        self.host_worker = command;
        self
    }

    /// Use a pre-populated registry. Discovery is skipped unless it is empty.
    #[must_use]
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Load configuration, populate the registry and resolve the order.
    pub fn plan(&self) -> Result<PipelinePlan, PipelineError> {
        let workspace = self
            .workspace
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| PipelineError::WorkspaceNotFound(self.workspace.clone()))?;

        let loaded = WorkspaceConfig::load(&workspace)?;
        let options = &loaded.config.options;
        let mut diagnostics = Vec::new();

        let mut registry = self.registry.clone();
        if registry.is_empty() {
            self.populate(&mut registry, options.require_explicit_versions, &mut diagnostics);
        }

        registry.apply_config(&loaded.config);
        let order = OrderResolver::new(&registry, &loaded.config.plugin_order).resolve();
        diagnostics.extend(order.warnings.iter().map(ToString::to_string));

        Ok(PipelinePlan { workspace, loaded, registry, order, diagnostics })
    }

    fn populate(&self, registry: &mut PluginRegistry, strict: bool, diagnostics: &mut Vec<String>) {
        match &self.plugins_dir {
            Some(dir) => {
                let report = PluginDiscovery::new(self.catalog.clone())
                    .host_versions(self.host.clone())
                    .strict(strict)
                    .discover(dir, registry);
                tracing::debug!(loaded = report.loaded().len(), dir = %dir.display(), "discovery finished");
                diagnostics.extend(report.problems());
            }
            None => {
                if let Err(e) = self.catalog.register_all(registry) {
                    tracing::warn!(error = %e, "failed to register built-in plugins");
                    diagnostics.push(e.to_string());
                }
            }
        }
    }

    /// Run the pipeline.
    ///
    /// Plugin failures end up in the report; only setup problems are errors.
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        let start = Instant::now();
        let plan = self.plan()?;
        let mut report = PipelineReport::empty(plan.workspace.clone());
        report.diagnostics = plan.diagnostics;

        let options = &plan.loaded.config.options;
        if !options.enabled {
            tracing::info!(workspace = %plan.workspace.display(), "pipeline disabled by configuration");
            report.total_duration = start.elapsed();
            return Ok(report);
        }

        let ctx = Arc::new(ExecutionContext::new(&plan.workspace, plan.loaded.clone()));
        let executor = PluginExecutor::from_options(options).host_worker(self.host_worker.clone());
        tracing::info!(
            workspace = %plan.workspace.display(),
            plugins = plan.order.len(),
            "running pre-compilation pipeline"
        );

        report.outcomes = executor.execute(&plan.registry, &plan.order, &ctx);
        if let Some(outcome) = report.outcomes.iter().find(|o| o.abort) {
            tracing::warn!(plugin = %outcome.plugin_id, "build aborted");
            report.verdict = Verdict::Abort;
        }
        report.workspace_switch = ctx.take_workspace_switch();
        report.total_duration = start.elapsed();

        tracing::info!(verdict = %report.verdict, summary = %report.summary(), "pipeline finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HookContext, PluginStatus};
    use crate::plugin::{HookError, Plugin, PluginMetadata};
    use std::fs;
    use tempfile::TempDir;

    struct Switcher(PluginMetadata);

    impl Plugin for Switcher {
        fn metadata(&self) -> &PluginMetadata {
            &self.0
        }

        fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
            ctx.request_workspace_switch("/elsewhere");
            Ok(())
        }
    }

    #[test]
    fn test_missing_workspace_is_setup_error() {
        let result = PipelineRunner::new("/definitely/not/here").run();
        assert!(matches!(result, Err(PipelineError::WorkspaceNotFound(_))));
    }

    #[test]
    fn test_builtins_run_by_default() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bcasl.yml"), "required_files: [main.py]\n").unwrap();
        fs::write(temp.path().join("main.py"), "print(1)\n").unwrap();

        let report = PipelineRunner::new(temp.path()).run().unwrap();
        let ids: Vec<_> = report.outcomes.iter().map(|o| o.plugin_id.as_str()).collect();
        assert_eq!(ids, vec!["cleaner", "required_files"]);
        assert!(report.is_proceed());
        assert!(report.diagnostics.is_empty());
    }

    #[test]
    fn test_disabled_pipeline_runs_nothing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bcasl.yml"), "required_files: [missing.py]\noptions:\n  enabled: false\n")
            .unwrap();

        let report = PipelineRunner::new(temp.path()).run().unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(report.verdict, Verdict::Proceed);
    }

    #[test]
    fn test_huge_timeout_runs_without_limit() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bcasl.yml"), "options:\n  plugin_timeout_s: 1e20\n  pipeline_timeout_s: 1e20\n")
            .unwrap();

        let report = PipelineRunner::new(temp.path()).run().unwrap();
        assert_eq!(report.statuses(), vec![PluginStatus::Succeeded, PluginStatus::Succeeded]);
        assert!(report.is_proceed());
    }

    #[test]
    fn test_veto_aborts() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bcasl.yml"), "required_files: [missing.py]\n").unwrap();

        let report = PipelineRunner::new(temp.path()).run().unwrap();
        assert_eq!(report.verdict, Verdict::Abort);
        assert_eq!(report.get("required_files").unwrap().status, PluginStatus::Vetoed);
    }

    #[test]
    fn test_prepopulated_registry_and_switch() {
        let temp = TempDir::new().unwrap();
        let mut registry = PluginRegistry::new();
        registry.register_inline(Arc::new(Switcher(PluginMetadata::new("switch", "1.0.0")))).unwrap();

        let report = PipelineRunner::new(temp.path()).registry(registry).run().unwrap();
        assert_eq!(report.statuses(), vec![PluginStatus::Succeeded]);
        assert_eq!(report.workspace_switch, Some(PathBuf::from("/elsewhere")));
    }

    #[test]
    fn test_plan_reports_unknown_order_entries() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bcasl.yml"), "plugin_order: [ghost, required_files]\n").unwrap();

        let plan = PipelineRunner::new(temp.path()).plan().unwrap();
        assert_eq!(plan.order.order, vec!["required_files", "cleaner"]);
        assert_eq!(plan.diagnostics.len(), 1);
        assert!(plan.diagnostics[0].contains("ghost"));
    }
}
