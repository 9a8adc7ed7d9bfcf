#![allow(clippy::vec_init_then_push)]
#![allow(clippy::needless_collect)]
#![allow(clippy::format_push_string)]
#![allow(clippy::unused_self)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::unnecessary_filter_map)]
#![allow(clippy::unnecessary_lazy_evaluations)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::manual_strip)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::single_char_pattern)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::or_fun_call)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]
#![allow(clippy::should_implement_trait)]

//! # bcasl
//!
//! Pre-compilation plugin pipeline for Python workspaces.
//!
//! Before a workspace is handed to a compiler, bcasl discovers plugins,
//! checks them against the host's API versions, orders them by explicit
//! order, priority, tag phase and declared dependencies, and runs them
//! against a shared execution context. The result is a [`PipelineReport`]
//! whose verdict tells the caller whether compilation may proceed.
//!
//! ## Features
//!
//! - **Discovery**: `plugin.toml` packages, built-in plugins and inline registration
//! - **Ordering**: tag phases, priorities and `requires` edges with cycle recovery
//! - **Execution**: sequential, bounded parallel or sandboxed in worker processes
//! - **Control**: per-plugin and pipeline timeouts, resource ceilings and build vetoes
//!
//! ## Quick Start
//!
//! ```no_run
//! use bcasl::PipelineRunner;
//!
//! let report = PipelineRunner::new("path/to/workspace").run()?;
//! println!("{}", report.summary());
//! if !report.is_proceed() {
//!     std::process::exit(2);
//! }
//! # Ok::<(), bcasl::core::PipelineError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::if_not_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::unnecessary_literal_bound)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::redundant_clone)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::unnecessary_debug_formatting)]
#![allow(clippy::for_kv_map)]
#![allow(clippy::use_self)]
#![allow(clippy::ptr_arg)]

pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use core::{
    ExecutionContext, ExecutionOutcome, HookContext, PipelineError, PipelineReport,
    PipelineRunner, PluginStatus, Verdict, WorkspaceConfig,
};
pub use plugin::{
    HookError, Plugin, PluginCatalog, PluginError, PluginMetadata, PluginRegistry, PluginResult,
};

/// Library version, advertised to plugins as the loader version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "bcasl";
