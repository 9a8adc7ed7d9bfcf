//! Per-plugin outcomes and the aggregated pipeline report.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// State of one plugin invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Waiting to be scheduled.
    Pending,
    /// Hook in progress.
    Running,
    /// Hook returned successfully.
    Succeeded,
    /// Hook failed; the pipeline carries on.
    Failed,
    /// Hook exceeded its wall-clock budget.
    TimedOut,
    /// Hook vetoed the build.
    Vetoed,
    /// Never started.
    Skipped,
}

impl PluginStatus {
    /// Check if the invocation reached a final state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Whether the hook was actually invoked.
    pub fn was_executed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut | Self::Vetoed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Vetoed => "vetoed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall decision for the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The compiler may run.
    Proceed,
    /// A plugin stopped the build.
    Abort,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Proceed => "proceed",
            Self::Abort => "abort",
        })
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// What happened to one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub plugin_id: String,
    pub name: String,
    pub status: PluginStatus,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub logs: Vec<String>,
    /// Failure, veto or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// This outcome stops the whole build.
    pub abort: bool,
}

impl ExecutionOutcome {
    pub fn new(plugin_id: &str, name: &str, status: PluginStatus) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            name: name.to_string(),
            status,
            duration: Duration::ZERO,
            logs: Vec::new(),
            message: None,
            abort: false,
        }
    }

    /// A plugin that never ran.
    pub fn skipped(plugin_id: &str, name: &str, reason: impl Into<String>) -> Self {
        Self { message: Some(reason.into()), ..Self::new(plugin_id, name, PluginStatus::Skipped) }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_abort(mut self, abort: bool) -> Self {
        self.abort = abort;
        self
    }
}

/// The terminal artifact of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub workspace: PathBuf,
    /// One outcome per resolved plugin, in resolved order.
    pub outcomes: Vec<ExecutionOutcome>,
    pub verdict: Verdict,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
    /// Discovery problems and ordering warnings.
    pub diagnostics: Vec<String>,
    /// Workspace a plugin asked to switch to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_switch: Option<PathBuf>,
}

impl PipelineReport {
    /// An empty report with a `proceed` verdict.
    pub fn empty(workspace: PathBuf) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            workspace,
            outcomes: Vec::new(),
            verdict: Verdict::Proceed,
            total_duration: Duration::ZERO,
            diagnostics: Vec::new(),
            workspace_switch: None,
        }
    }

    pub fn get(&self, plugin_id: &str) -> Option<&ExecutionOutcome> {
        self.outcomes.iter().find(|o| o.plugin_id == plugin_id)
    }

    /// Outcome statuses in report order.
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.outcomes.iter().map(|o| o.status).collect()
    }

    pub fn count(&self, status: PluginStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Number of plugins whose hook was invoked.
    pub fn executed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.was_executed()).count()
    }

    /// Summed hook time.
    pub fn plugin_time(&self) -> Duration {
        self.outcomes.iter().map(|o| o.duration).sum()
    }

    pub fn is_proceed(&self) -> bool {
        self.verdict == Verdict::Proceed
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "Plugins: {}/{} ok, {} failed, {} timed out, {} vetoed, {} skipped ({} ms)",
            self.count(PluginStatus::Succeeded),
            self.outcomes.len(),
            self.count(PluginStatus::Failed),
            self.count(PluginStatus::TimedOut),
            self.count(PluginStatus::Vetoed),
            self.count(PluginStatus::Skipped),
            self.total_duration.as_millis()
        )
    }
}
