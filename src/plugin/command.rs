//! Plugins implemented by an external program.

use std::path::{Path, PathBuf};

use super::{
    HookError, Plugin, PluginMetadata, PluginOrigin, ResourceLimits, Supervisor, WorkerCommand,
    WorkerExit, WorkerRequest,
};
use crate::core::HookContext;

/// A plugin whose hook runs an external command.
///
/// The command receives a JSON [`WorkerRequest`] on stdin and reports back
/// through its exit code.
#[derive(Debug, Clone)]
pub struct CommandPlugin {
    metadata: PluginMetadata,
    command: Vec<String>,
    package_dir: PathBuf,
}

impl CommandPlugin {
    pub fn new(metadata: PluginMetadata, command: Vec<String>, package_dir: &Path) -> Self {
        Self { metadata, command, package_dir: package_dir.to_path_buf() }
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    /// Resolve the program: a file shipped in the package wins over `PATH`.
    fn program(&self) -> PathBuf {
        let program = self.command.first().map(String::as_str).unwrap_or_default();
        let local = self.package_dir.join(program);
        if !program.is_empty() && local.is_file() {
            local
        } else {
            PathBuf::from(program)
        }
    }

    fn command_for(&self, workspace_root: &Path) -> WorkerCommand {
        WorkerCommand::new(self.program())
            .args(self.command.iter().skip(1).cloned())
            .cwd(workspace_root)
            .env("BCASL_PLUGIN_ID", self.metadata.id())
            .env("BCASL_WORKSPACE_ROOT", workspace_root.to_string_lossy())
            .env("BCASL_PLUGIN_DIR", self.package_dir.to_string_lossy())
    }
}

impl Plugin for CommandPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn on_pre_compile(&self, ctx: &HookContext) -> Result<(), HookError> {
        let origin = PluginOrigin::Manifest(self.package_dir.join(super::MANIFEST_FILE));
        let request = WorkerRequest::for_plugin(ctx, self.metadata.id(), &origin);
        let input = serde_json::to_vec(&request)
            .map_err(|e| HookError::failed(format!("cannot encode worker request: {e}")))?;

        let command = self.command_for(ctx.workspace_root());
        let run = Supervisor::new(ResourceLimits::unlimited())
            .run(&command, &input, ctx.cancel_token())
            .map_err(|e| {
                HookError::failed(format!("cannot start {}: {e}", command.program.display()))
            })?;

        for line in run.logs {
            ctx.log(line);
        }

        match run.exit {
            WorkerExit::Succeeded => Ok(()),
            WorkerExit::Vetoed(reason) => Err(HookError::Veto(reason)),
            WorkerExit::Failed(message) => Err(HookError::Failed(message)),
            WorkerExit::LimitExceeded(breach) => {
                Err(HookError::failed(format!("resource limit exceeded: {breach}")))
            }
            WorkerExit::TimedOut => Err(HookError::failed("worker timed out")),
            WorkerExit::Cancelled => Err(HookError::failed("cancelled")),
        }
    }

    fn worker_command(&self, request: &WorkerRequest) -> Option<WorkerCommand> {
        Some(self.command_for(&request.workspace_root))
    }
}
