//! Plugin execution.
//!
//! Runs the resolved order against the execution context. One scheduler
//! covers every mode: with a degree of 1 plugins run one after the other
//! on the calling thread, with a higher degree independent plugins run on
//! worker threads while dependents wait for their dependencies. Each plugin
//! runs either in-process or, when sandboxing is on, in a supervised worker
//! process.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{
    CancelToken, ExecutionContext, ExecutionOutcome, HookContext, PipelineOptions, PluginStatus,
    ResolvedOrder,
};
use crate::plugin::{
    HookError, PluginOrigin, PluginRecord, PluginRegistry, ResourceBreach, ResourceLimits,
    Supervisor, WorkerCommand, WorkerExit, WorkerRequest,
};

/// How one invocation ended, before it becomes an outcome.
enum Attempt {
    Finished(Result<(), HookError>),
    TimedOut,
    LimitExceeded(ResourceBreach),
    Crashed(String),
}

/// Runs plugins and collects their outcomes.
#[derive(Debug, Clone)]
pub struct PluginExecutor {
    /// Per-plugin wall-clock budget
    timeout: Option<Duration>,
    /// Budget for scheduling new plugins
    pipeline_timeout: Option<Duration>,
    /// Maximum number of concurrent plugins
    parallelism: usize,
    /// Resource ceilings when sandboxed
    sandbox: Option<ResourceLimits>,
    /// Worker used to isolate in-binary plugins
    host_worker: Option<WorkerCommand>,
}

impl Default for PluginExecutor {
    fn default() -> Self {
        Self {
            timeout: None,
            pipeline_timeout: None,
            parallelism: 1,
            sandbox: None,
            host_worker: None,
        }
    }
}

impl PluginExecutor {
    /// Create a sequential, in-process executor without timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure from the pipeline options.
    pub fn from_options(options: &PipelineOptions) -> Self {
        let mut executor = Self::new()
            .timeout(options.plugin_timeout())
            .pipeline_timeout(options.pipeline_timeout())
            .parallelism(options.parallelism());
        if options.sandbox {
            executor = executor.sandboxed(options.plugin_limits);
        }
        executor
    }

    /// Set the per-plugin timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Stop scheduling new plugins once this much time has passed.
    #[must_use]
    pub fn pipeline_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pipeline_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Set the number of concurrent plugins. 1 is sequential.
    #[must_use]
    pub fn parallelism(mut self, degree: usize) -> Self {
        self.parallelism = degree.max(1);
        self
    }

    /// Run every plugin in a worker process under these limits.
    #[must_use]
    pub fn sandboxed(mut self, limits: ResourceLimits) -> Self {
        self.sandbox = Some(limits);
        self
    }

    /// Command that isolates in-binary plugins.
    #[must_use]
    pub fn host_worker(mut self, command: Option<WorkerCommand>) -> Self {
        self.host_worker = command;
        self
    }

    pub fn degree(&self) -> usize {
        self.parallelism
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Execute the resolved order.
    ///
    /// Returns one outcome per plugin of `resolved`, in resolved order.
    pub fn execute(
        &self,
        registry: &PluginRegistry,
        resolved: &ResolvedOrder,
        ctx: &Arc<ExecutionContext>,
    ) -> Vec<ExecutionOutcome> {
        let n = resolved.order.len();
        let started = Instant::now();
        let deadline = self.pipeline_timeout.map(|t| started + t);

        let mut state = Schedule::new(resolved, registry);
        let (tx, rx) = mpsc::channel::<(usize, ExecutionOutcome)>();
        let mut running = 0;

        tracing::debug!(
            plugins = n,
            degree = self.parallelism,
            sandboxed = self.is_sandboxed(),
            "executing plugins"
        );

        loop {
            while state.halt.is_none() && running < self.parallelism {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::warn!("pipeline time budget exhausted, not scheduling further plugins");
                    state.halt = Some("pipeline time budget exhausted".to_string());
                    break;
                }
                let Some(idx) = state.ready.pop_first() else {
                    break;
                };

                let id = &resolved.order[idx];
                let Some(record) = registry.get(id) else {
                    let outcome = ExecutionOutcome::new(id, id, PluginStatus::Failed)
                        .with_message("plugin is not registered");
                    state.complete(idx, outcome);
                    continue;
                };

                if self.parallelism == 1 {
                    let outcome = self.run_one(record, ctx);
                    state.complete(idx, outcome);
                } else {
                    let executor = self.clone();
                    let record = record.clone();
                    let ctx = Arc::clone(ctx);
                    let tx = tx.clone();
                    thread::spawn(move || {
                        let outcome = executor.run_one(&record, &ctx);
                        let _ = tx.send((idx, outcome));
                    });
                    running += 1;
                }
            }

            if running == 0 {
                break;
            }

            // Already-running plugins are always waited for, even after a
            // veto.
            match rx.recv() {
                Ok((idx, outcome)) => {
                    running -= 1;
                    state.complete(idx, outcome);
                }
                Err(_) => break,
            }
        }

        state.finish()
    }

    /// Run a single plugin to a terminal outcome.
    fn run_one(&self, record: &PluginRecord, ctx: &Arc<ExecutionContext>) -> ExecutionOutcome {
        let meta = record.metadata();
        let id = meta.id();
        let start = Instant::now();
        tracing::info!(plugin = %id, "running plugin");

        let (attempt, logs) = match self.sandbox {
            Some(limits) => self.run_isolated(record, ctx, limits),
            None => self.run_in_process(record, ctx),
        };

        let outcome = ExecutionOutcome::new(id, meta.name(), PluginStatus::Running)
            .with_duration(start.elapsed())
            .with_logs(logs);

        let outcome = match attempt {
            Attempt::Finished(Ok(())) => ExecutionOutcome { status: PluginStatus::Succeeded, ..outcome },
            Attempt::Finished(Err(HookError::Failed(message))) => {
                ExecutionOutcome { status: PluginStatus::Failed, ..outcome }.with_message(message)
            }
            Attempt::Finished(Err(HookError::Veto(reason))) => {
                ExecutionOutcome { status: PluginStatus::Vetoed, ..outcome }
                    .with_message(reason)
                    .with_abort(true)
            }
            Attempt::TimedOut => {
                let budget = self.timeout.map_or(0.0, |t| t.as_secs_f64());
                ExecutionOutcome { status: PluginStatus::TimedOut, ..outcome }
                    .with_message(format!("exceeded timeout of {budget}s"))
                    .with_abort(meta.abort_on_timeout())
            }
            Attempt::LimitExceeded(breach) => ExecutionOutcome { status: PluginStatus::Failed, ..outcome }
                .with_message(format!("resource limit exceeded: {breach}")),
            Attempt::Crashed(message) => {
                ExecutionOutcome { status: PluginStatus::Failed, ..outcome }.with_message(message)
            }
        };

        match outcome.status {
            PluginStatus::Succeeded => {
                tracing::info!(plugin = %id, duration_ms = outcome.duration.as_millis(), "plugin succeeded");
            }
            status => tracing::warn!(
                plugin = %id,
                %status,
                message = outcome.message.as_deref().unwrap_or_default(),
                "plugin did not succeed"
            ),
        }

        outcome
    }

    fn run_in_process(
        &self,
        record: &PluginRecord,
        ctx: &Arc<ExecutionContext>,
    ) -> (Attempt, Vec<String>) {
        let cancel = CancelToken::new();
        let hook = HookContext::new(Arc::clone(ctx), record.id(), cancel.clone());
        let plugin = Arc::clone(record.plugin());

        let Some(timeout) = self.timeout else {
            let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.on_pre_compile(&hook)));
            let attempt = match result {
                Ok(result) => Attempt::Finished(result),
                Err(payload) => Attempt::Crashed(panic_message(payload.as_ref())),
            };
            return (attempt, hook.take_logs());
        };

        let (tx, rx) = mpsc::channel();
        let worker_hook = hook.clone();
        let spawned = thread::Builder::new().name(format!("bcasl-{}", record.id())).spawn(move || {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| plugin.on_pre_compile(&worker_hook)));
            let _ = tx.send(result.map_err(|payload| panic_message(payload.as_ref())));
        });
        if let Err(e) = spawned {
            return (Attempt::Crashed(format!("cannot start plugin thread: {e}")), Vec::new());
        }

        let attempt = match rx.recv_timeout(timeout) {
            Ok(Ok(result)) => Attempt::Finished(result),
            Ok(Err(message)) => Attempt::Crashed(message),
            Err(RecvTimeoutError::Timeout) => {
                // The thread cannot be killed; cancel it and stop waiting.
                cancel.cancel();
                Attempt::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                Attempt::Crashed("plugin thread ended without a result".to_string())
            }
        };
        (attempt, hook.take_logs())
    }

    fn run_isolated(
        &self,
        record: &PluginRecord,
        ctx: &Arc<ExecutionContext>,
        limits: ResourceLimits,
    ) -> (Attempt, Vec<String>) {
        let request = WorkerRequest::for_plugin(ctx, record.id(), record.origin());
        let command = record.plugin().worker_command(&request).or_else(|| {
            if matches!(record.origin(), PluginOrigin::Inline) {
                None
            } else {
                self.host_worker.clone()
            }
        });

        let Some(command) = command else {
            tracing::warn!(plugin = %record.id(), "plugin cannot be isolated, running in process");
            return self.run_in_process(record, ctx);
        };

        let input = match serde_json::to_vec(&request) {
            Ok(input) => input,
            Err(e) => {
                return (Attempt::Crashed(format!("cannot encode worker request: {e}")), Vec::new())
            }
        };

        let supervisor = Supervisor::new(limits).timeout(self.timeout);
        match supervisor.run(&command, &input, &CancelToken::new()) {
            Ok(run) => {
                let attempt = match run.exit {
                    WorkerExit::Succeeded => Attempt::Finished(Ok(())),
                    WorkerExit::Vetoed(reason) => Attempt::Finished(Err(HookError::Veto(reason))),
                    WorkerExit::Failed(message) => {
                        Attempt::Finished(Err(HookError::Failed(message)))
                    }
                    WorkerExit::LimitExceeded(breach) => Attempt::LimitExceeded(breach),
                    WorkerExit::TimedOut => Attempt::TimedOut,
                    WorkerExit::Cancelled => Attempt::Crashed("worker cancelled".to_string()),
                };
                (attempt, run.logs)
            }
            Err(e) => (
                Attempt::Crashed(format!("cannot start worker {}: {e}", command.program.display())),
                Vec::new(),
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("plugin panicked: {detail}")
}

/// Bookkeeping for one execution.
struct Schedule {
    ids: Vec<String>,
    names: Vec<String>,
    outcomes: Vec<Option<ExecutionOutcome>>,
    dependents: Vec<Vec<usize>>,
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
    halt: Option<String>,
}

impl Schedule {
    fn new(resolved: &ResolvedOrder, registry: &PluginRegistry) -> Self {
        let n = resolved.order.len();
        let mut dependents = vec![Vec::new(); n];
        let mut waiting = vec![0; n];

        for (idx, id) in resolved.order.iter().enumerate() {
            for dep in resolved.dependencies_of(id) {
                if let Some(dep_idx) = resolved.position(dep) {
                    dependents[dep_idx].push(idx);
                    waiting[idx] += 1;
                }
            }
        }

        let names = resolved
            .order
            .iter()
            .map(|id| registry.get(id).map_or_else(|| id.clone(), |r| r.metadata().name().to_string()))
            .collect();
        let ready = (0..n).filter(|idx| waiting[*idx] == 0).collect();

        Self {
            ids: resolved.order.clone(),
            names,
            outcomes: vec![None; n],
            dependents,
            waiting,
            ready,
            halt: None,
        }
    }

    /// Record a terminal outcome and release or skip dependents.
    fn complete(&mut self, idx: usize, outcome: ExecutionOutcome) {
        if outcome.abort && self.halt.is_none() {
            self.halt = Some(format!("build aborted by '{}'", outcome.plugin_id));
        }

        let succeeded = outcome.status.is_success();
        let reason = format!("dependency '{}' {}", outcome.plugin_id, outcome.status);
        self.outcomes[idx] = Some(outcome);

        for dependent in self.dependents[idx].clone() {
            if succeeded {
                self.waiting[dependent] -= 1;
                if self.waiting[dependent] == 0 && self.outcomes[dependent].is_none() {
                    self.ready.insert(dependent);
                }
            } else {
                self.skip(dependent, &reason);
            }
        }
    }

    /// Skip a plugin and, transitively, everything waiting on it.
    fn skip(&mut self, idx: usize, reason: &str) {
        if self.outcomes[idx].is_some() {
            return;
        }
        self.ready.remove(&idx);
        tracing::info!(plugin = %self.ids[idx], reason, "skipping plugin");
        self.outcomes[idx] = Some(ExecutionOutcome::skipped(&self.ids[idx], &self.names[idx], reason));

        let next = format!("dependency '{}' skipped", self.ids[idx]);
        for dependent in self.dependents[idx].clone() {
            self.skip(dependent, &next);
        }
    }

    /// Outcomes in order, filling never-scheduled plugins as skipped.
    fn finish(self) -> Vec<ExecutionOutcome> {
        let reason = self.halt.unwrap_or_else(|| "not scheduled".to_string());
        self.outcomes
            .into_iter()
            .zip(self.ids.iter().zip(&self.names))
            .map(|(outcome, (id, name))| {
                outcome.unwrap_or_else(|| ExecutionOutcome::skipped(id, name, reason.clone()))
            })
            .collect()
    }
}
