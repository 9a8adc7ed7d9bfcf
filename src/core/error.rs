//! Fatal pipeline errors.
//!
//! Everything that can go wrong with a single plugin ends up in its
//! outcome. Only setup problems stop a run.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that prevent a pipeline run from starting.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The workspace path does not exist or is not a directory.
    #[error("Workspace not found: {}", .0.display())]
    WorkspaceNotFound(PathBuf),

    /// The configuration file exists but cannot be read.
    #[error("Cannot read configuration {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid.
    #[error("Invalid configuration {}: {message}", .path.display())]
    ConfigParse { path: PathBuf, message: String },
}
