//! Isolated worker processes.
//!
//! A sandboxed plugin runs in its own process, supervised from the host:
//! the [`Supervisor`] spawns the worker, streams its output, samples its
//! resource usage and forcibly reaps it on a ceiling breach, a timeout or a
//! cancellation. Workers speak a small protocol: a JSON [`WorkerRequest`] on
//! stdin, log lines on stdout/stderr, and an exit code (0 success,
//! [`VETO_EXIT_CODE`] veto, anything else failure).

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command as ProcessCommand, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use super::{HookError, PluginCatalog, PluginDiscovery, PluginOrigin, PluginRegistry, VETO_EXIT_CODE};
use crate::core::{CancelToken, ExecutionContext, HookContext, WorkspaceConfig};

const MB: u64 = 1024 * 1024;

/// Per-plugin resource ceilings. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Resident memory, in MiB.
    pub mem_mb: u64,
    /// Consumed CPU time, in seconds.
    pub cpu_time_s: u64,
    /// Open file descriptors.
    pub nofile: u64,
    /// Captured output, in MiB.
    pub fsize_mb: u64,
}

impl ResourceLimits {
    /// No ceilings at all.
    pub const fn unlimited() -> Self {
        Self { mem_mb: 0, cpu_time_s: 0, nofile: 0, fsize_mb: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::unlimited()
    }
}

/// A resource ceiling a worker went over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceBreach {
    Memory { used_mb: u64, limit_mb: u64 },
    CpuTime { used_s: u64, limit_s: u64 },
    OpenFiles { open: u64, limit: u64 },
    OutputSize { bytes: u64, limit_mb: u64 },
}

impl fmt::Display for ResourceBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { used_mb, limit_mb } => {
                write!(f, "memory {used_mb} MiB exceeds {limit_mb} MiB")
            }
            Self::CpuTime { used_s, limit_s } => {
                write!(f, "cpu time {used_s}s exceeds {limit_s}s")
            }
            Self::OpenFiles { open, limit } => write!(f, "{open} open files exceed {limit}"),
            Self::OutputSize { bytes, limit_mb } => {
                write!(f, "output of {bytes} bytes exceeds {limit_mb} MiB")
            }
        }
    }
}

/// A process to run as a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), cwd: None, env: Vec::new() }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The host binary's own worker entrypoint.
    pub fn host_worker() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).args(["sandbox-worker"]))
    }
}

/// What a worker receives on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub plugin_id: String,
    pub origin: PluginOrigin,
    pub workspace_root: PathBuf,
    pub config_found: bool,
    pub config: WorkspaceConfig,
}

impl WorkerRequest {
    /// Build the request for one plugin run.
    pub fn for_plugin(ctx: &ExecutionContext, plugin_id: &str, origin: &PluginOrigin) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            origin: origin.clone(),
            workspace_root: ctx.workspace_root().to_path_buf(),
            config_found: ctx.is_valid(),
            config: ctx.config().clone(),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Succeeded,
    Vetoed(String),
    Failed(String),
    LimitExceeded(ResourceBreach),
    TimedOut,
    Cancelled,
}

/// Result of a supervised worker run.
#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub exit: WorkerExit,
    pub logs: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Captured {
    lines: Vec<String>,
    last_stderr: Option<String>,
}

/// Spawns and supervises a worker process.
#[derive(Debug, Clone)]
pub struct Supervisor {
    limits: ResourceLimits,
    timeout: Option<Duration>,
    poll_interval: Duration,
    sample_interval: Duration,
    drain_grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(ResourceLimits::unlimited())
    }
}

impl Supervisor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            timeout: None,
            poll_interval: Duration::from_millis(10),
            sample_interval: Duration::from_millis(250),
            drain_grace: Duration::from_millis(500),
        }
    }

    /// Wall-clock budget for the worker.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// How often resource usage is sampled.
    #[must_use]
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval.max(self.poll_interval);
        self
    }

    /// Run a worker to completion, feeding `input` on its stdin.
    ///
    /// Only a failure to spawn is returned as an error; every other way the
    /// worker can end is a [`WorkerExit`].
    pub fn run(
        &self,
        command: &WorkerCommand,
        input: &[u8],
        cancel: &CancelToken,
    ) -> io::Result<WorkerRun> {
        let start = Instant::now();

        let mut cmd = ProcessCommand::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        tracing::debug!(pid = child.id(), program = ?command.program, "spawned worker");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.to_vec();
            thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            });
        }

        let captured = Arc::new(Mutex::new(Captured::default()));
        let output_bytes = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        let mut readers = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, false, &captured, &output_bytes, done_tx.clone());
            readers += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, true, &captured, &output_bytes, done_tx.clone());
            readers += 1;
        }
        drop(done_tx);

        let exit = self.supervise(&mut child, cancel, &output_bytes, start);

        // Reader threads end when the pipes close. A grandchild holding them
        // open must not stall the pipeline.
        let grace = Instant::now() + self.drain_grace;
        for _ in 0..readers {
            let remaining = grace.saturating_duration_since(Instant::now());
            if done_rx.recv_timeout(remaining).is_err() {
                tracing::debug!("worker output still open after exit, detaching readers");
                break;
            }
        }

        let captured = std::mem::take(&mut *captured.lock());
        let exit = match exit {
            Supervised::Exited(status) => classify(status, captured.last_stderr),
            Supervised::Stopped(exit) => exit,
        };

        Ok(WorkerRun { exit, logs: captured.lines, duration: start.elapsed() })
    }

    fn supervise(
        &self,
        child: &mut Child,
        cancel: &CancelToken,
        output_bytes: &AtomicU64,
        start: Instant,
    ) -> Supervised {
        let pid = Pid::from_u32(child.id());
        let mut system = System::new();
        let mut cpu_secs = 0.0_f64;
        let mut last_sample = Instant::now();
        let deadline = self.timeout.map(|t| start + t);

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Supervised::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    terminate(child);
                    return Supervised::Stopped(WorkerExit::Failed(format!(
                        "lost track of worker: {e}"
                    )));
                }
            }

            if cancel.is_cancelled() {
                terminate(child);
                return Supervised::Stopped(WorkerExit::Cancelled);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(pid = pid.as_u32(), "worker exceeded its time budget");
                terminate(child);
                return Supervised::Stopped(WorkerExit::TimedOut);
            }

            let mut breach = self.check_output(output_bytes.load(Ordering::Relaxed));

            if breach.is_none() && last_sample.elapsed() >= self.sample_interval {
                let elapsed = last_sample.elapsed().as_secs_f64();
                last_sample = Instant::now();
                if system.refresh_process(pid) {
                    if let Some(proc) = system.process(pid) {
                        cpu_secs += f64::from(proc.cpu_usage()) / 100.0 * elapsed;
                        breach = self.check_usage(proc.memory(), cpu_secs, pid);
                    }
                }
            }

            if let Some(breach) = breach {
                tracing::warn!(pid = pid.as_u32(), %breach, "worker breached a resource limit");
                terminate(child);
                return Supervised::Stopped(WorkerExit::LimitExceeded(breach));
            }

            thread::sleep(self.poll_interval);
        }
    }

    fn check_output(&self, bytes: u64) -> Option<ResourceBreach> {
        let limit_mb = self.limits.fsize_mb;
        (limit_mb > 0 && bytes > limit_mb * MB)
            .then_some(ResourceBreach::OutputSize { bytes, limit_mb })
    }

    fn check_usage(&self, memory: u64, cpu_secs: f64, pid: Pid) -> Option<ResourceBreach> {
        let limits = &self.limits;
        if limits.mem_mb > 0 && memory > limits.mem_mb * MB {
            return Some(ResourceBreach::Memory { used_mb: memory / MB, limit_mb: limits.mem_mb });
        }
        if limits.cpu_time_s > 0 && cpu_secs > limits.cpu_time_s as f64 {
            return Some(ResourceBreach::CpuTime {
                used_s: cpu_secs as u64,
                limit_s: limits.cpu_time_s,
            });
        }
        if limits.nofile > 0 {
            if let Some(open) = open_files(pid) {
                if open > limits.nofile {
                    return Some(ResourceBreach::OpenFiles { open, limit: limits.nofile });
                }
            }
        }
        None
    }
}

enum Supervised {
    Exited(ExitStatus),
    Stopped(WorkerExit),
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    is_stderr: bool,
    captured: &Arc<Mutex<Captured>>,
    output_bytes: &Arc<AtomicU64>,
    done: mpsc::Sender<()>,
) {
    let captured = Arc::clone(captured);
    let output_bytes = Arc::clone(output_bytes);
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    output_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
                    let mut captured = captured.lock();
                    if is_stderr && !line.trim().is_empty() {
                        captured.last_stderr = Some(line.clone());
                    }
                    captured.lines.push(line);
                }
            }
        }
        let _ = done.send(());
    });
}

fn classify(status: ExitStatus, last_stderr: Option<String>) -> WorkerExit {
    match status.code() {
        Some(0) => WorkerExit::Succeeded,
        Some(VETO_EXIT_CODE) => {
            WorkerExit::Vetoed(last_stderr.unwrap_or_else(|| "vetoed by plugin".to_string()))
        }
        _ => WorkerExit::Failed(last_stderr.unwrap_or_else(|| format!("worker {status}"))),
    }
}

/// Kill the worker and everything it spawned, then reap it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid as NixPid;

        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = killpg(NixPid::from_raw(pid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(target_os = "linux")]
fn open_files(pid: Pid) -> Option<u64> {
    let dir = std::fs::read_dir(format!("/proc/{}/fd", pid.as_u32())).ok()?;
    Some(dir.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn open_files(_pid: Pid) -> Option<u64> {
    None
}

/// Serve one plugin run inside a worker process.
///
/// Reads a [`WorkerRequest`] from `input`, rebuilds the plugin from its
/// origin, runs its hook, writes its log lines to `out` and the failure or
/// veto reason to `err`. Returns the process exit code.
pub fn serve_worker(
    catalog: &PluginCatalog,
    input: impl Read,
    out: &mut impl Write,
    err: &mut impl Write,
) -> i32 {
    let request: WorkerRequest = match serde_json::from_reader(input) {
        Ok(request) => request,
        Err(e) => {
            let _ = writeln!(err, "invalid worker request: {e}");
            return 1;
        }
    };

    let plugin = match rebuild_plugin(catalog, &request) {
        Ok(plugin) => plugin,
        Err(e) => {
            let _ = writeln!(err, "{e}");
            return 1;
        }
    };

    let ctx = Arc::new(ExecutionContext::with_config(
        &request.workspace_root,
        request.config,
        request.config_found,
    ));
    let hook = HookContext::new(ctx, &request.plugin_id, CancelToken::new());
    let result = plugin.on_pre_compile(&hook);

    for line in hook.take_logs() {
        let _ = writeln!(out, "{line}");
    }

    match result {
        Ok(()) => 0,
        Err(HookError::Veto(reason)) => {
            let _ = writeln!(err, "{reason}");
            VETO_EXIT_CODE
        }
        Err(HookError::Failed(message)) => {
            let _ = writeln!(err, "{message}");
            1
        }
    }
}

fn rebuild_plugin(
    catalog: &PluginCatalog,
    request: &WorkerRequest,
) -> Result<Arc<dyn super::Plugin>, String> {
    match &request.origin {
        PluginOrigin::Builtin(name) => catalog
            .instantiate(name)
            .ok_or_else(|| format!("unknown builtin plugin '{name}'")),
        PluginOrigin::Manifest(path) => {
            let unit = path.parent().unwrap_or_else(|| Path::new("."));
            let mut registry = PluginRegistry::new();
            PluginDiscovery::new(catalog.clone())
                .load_unit(unit, &mut registry)
                .map_err(|e| e.to_string())?;
            registry
                .get(&request.plugin_id)
                .map(|record| Arc::clone(record.plugin()))
                .ok_or_else(|| format!("package does not provide plugin '{}'", request.plugin_id))
        }
        PluginOrigin::Inline => {
            Err(format!("plugin '{}' was registered inline and cannot be isolated", request.plugin_id))
        }
    }
}
