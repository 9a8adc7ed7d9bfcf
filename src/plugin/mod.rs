//! Plugin model for the pre-compilation pipeline.
//!
//! A plugin is anything implementing [`Plugin`]: built-in plugins compiled
//! into the binary, command plugins described by a `plugin.toml` package, or
//! plugins registered inline by an embedding application.
//!
//! # Package layout
//!
//! ```toml
//! [plugin]
//! id = "license_header"
//! version = "1.2.0"
//! tags = ["license"]
//! requires = ["cleaner"]
//!
//! [plugin.requirements]
//! core = "1.0.0"
//!
//! [entry]
//! command = ["./check.sh", "--strict"]
//! ```

pub mod builtin;
mod command;
mod discovery;
mod error;
mod manifest;
mod registry;
mod sandbox;
mod types;
mod version;

pub use command::CommandPlugin;
pub use discovery::{
    DiscoveryEntry, DiscoveryReport, PluginCatalog, PluginDiscovery, PluginFactory, RegisterFn,
};
pub use error::{HookError, PluginError, PluginResult};
pub use manifest::{Entrypoint, ManifestEntry, ManifestPlugin, PluginManifest};
pub use registry::{PluginRecord, PluginRegistry, Registrar};
pub use sandbox::{
    serve_worker, ResourceBreach, ResourceLimits, Supervisor, WorkerCommand, WorkerExit,
    WorkerRequest, WorkerRun,
};
pub use types::{Plugin, PluginMetadata, PluginOrigin, DEFAULT_PRIORITY, MANIFEST_FILE, VETO_EXIT_CODE};
pub use version::{
    is_compatible, Component, HostVersions, UnmetRequirement, Version, VersionRequirements,
};
