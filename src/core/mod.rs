//! Pipeline machinery.
//!
//! Configuration, tag phases, order resolution, the execution context shared
//! by plugins, the executor and the runner that produces a report.

mod config;
mod context;
mod error;
mod executor;
mod order;
mod pipeline;
mod report;
mod tags;

pub use config::{
    default_excludes, LoadedConfig, PipelineOptions, PluginSettings, WorkspaceConfig,
    CONFIG_FILES, DEFAULT_FILE_PATTERN, ENV_PLUGIN_PARALLELISM, ENV_PLUGIN_TIMEOUT,
};
pub use context::{CancelToken, ExecutionContext, HookContext};
pub use error::PipelineError;
pub use executor::PluginExecutor;
pub use order::{OrderResolver, OrderingWarning, ResolvedOrder};
pub use pipeline::{PipelinePlan, PipelineRunner};
pub use report::{ExecutionOutcome, PipelineReport, PluginStatus, Verdict};
pub use tags::{describe_priority, Phase};
