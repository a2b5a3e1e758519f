//! Tool Execution Engine (§4.1).
//!
//! Spawns external security-tool subprocesses with sanitized, argv-array arguments (never
//! shell interpolation), captures stdout/stderr incrementally with a per-line sequence
//! published to the Event Bus as `tool_output`, enforces a timeout and an output-size cap,
//! and terminates the subprocess gracefully (then forcefully, after `kill_grace`) on
//! cancellation, deadline, or output overflow. Grounded on the teacher's
//! `BashTool::execute`: spawn via `tokio::process::Command`, drain stdout/stderr
//! concurrently to avoid pipe-buffer deadlock, wrap the whole attempt in
//! `tokio::time::timeout`.

pub mod parsers;
pub mod sanitize;

use crate::error::{OrchestratorError, ToolErrorKind};
use crate::event::{EventBus, EventKind, OutputStream};
use crate::findings::RawFinding;
use crate::toolbox::schema::ValidatedArgs;
use crate::toolbox::ToolDescriptor;
use parsers::Parser;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{Notify, Semaphore};

/// Structured outcome of one tool execution (§4.1 Contract).
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub raw_output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub truncated: bool,
}

/// Per-execution cancellation and deadline context. Cheaply cloned and shared between the
/// scan controller (which signals cancellation) and the engine (which observes it).
#[derive(Clone)]
pub struct ExecutionContext {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Derives a per-tool-execution context that shares this context's cancellation signal
    /// (so a scan-level `cancel()` is observed mid-tool) but carries its own timeout.
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            notify: Arc::clone(&self.notify),
            deadline: Some(Instant::now() + timeout),
        }
    }
}

/// Bounds the number of subprocesses in flight across all scans. The sole process-wide
/// resource the orchestrator keeps outside a `Configuration`-threaded value, per §9
/// ("process-wide singletons are forbidden except for the subprocess worker pool").
pub struct ToolExecutionEngine {
    pool: Arc<Semaphore>,
    kill_grace: Duration,
    bus: Arc<EventBus>,
}

impl ToolExecutionEngine {
    pub fn new(max_concurrent: usize, kill_grace: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(max_concurrent.max(1))),
            kill_grace,
            bus,
        }
    }

    /// `Execute(ctx, descriptor, args) -> ToolResult | ExecutionError`.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        scan_id: &str,
        descriptor: &ToolDescriptor,
        args: &ValidatedArgs,
    ) -> Result<ToolResult, OrchestratorError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| OrchestratorError::tool(ToolErrorKind::Cancelled, "execution pool closed"))?;

        if ctx.is_cancelled() {
            return Err(OrchestratorError::tool(ToolErrorKind::Cancelled, "scan cancelled before execution"));
        }

        let argv = build_argv(descriptor, args);
        log::debug!("spawning tool '{}' with argv {:?}", descriptor.name, argv);

        let start = Instant::now();
        let mut command = TokioCommand::new(&descriptor.binary);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::tool(ToolErrorKind::NotInstalled, format!("{}: {e}", descriptor.binary))
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let max_bytes = descriptor.max_output_bytes;
        let tool_name = descriptor.name.clone();
        let bus = Arc::clone(&self.bus);
        let scan_id_owned = scan_id.to_string();
        let overflow = Arc::new(Notify::new());

        let stdout_task = read_and_publish_lines(
            stdout,
            max_bytes,
            OutputStream::Stdout,
            Arc::clone(&bus),
            scan_id_owned.clone(),
            tool_name.clone(),
            Arc::clone(&overflow),
        );
        let stderr_task = read_and_publish_lines(
            stderr,
            max_bytes,
            OutputStream::Stderr,
            bus,
            scan_id_owned,
            tool_name,
            Arc::clone(&overflow),
        );

        let timeout = ctx
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(descriptor.default_timeout);

        // Run on a separate task so overflow/cancellation/timeout can race against it: once
        // either reader hits `max_output_bytes` it notifies `overflow` but keeps reading
        // nothing further until the child is killed below, at which point both readers hit
        // EOF (the pipe closes) and this task resolves with whatever was already collected.
        let run_handle = tokio::spawn(async move { tokio::join!(stdout_task, stderr_task) });

        tokio::select! {
            biased;
            _ = ctx.notify.notified() => {
                terminate(&mut child, self.kill_grace).await;
                Err(OrchestratorError::tool(ToolErrorKind::Cancelled, "execution cancelled"))
            }
            _ = tokio::time::sleep(timeout) => {
                terminate(&mut child, self.kill_grace).await;
                Err(OrchestratorError::tool(ToolErrorKind::TimedOut, format!("exceeded {:?}", timeout)))
            }
            _ = overflow.notified() => {
                terminate(&mut child, self.kill_grace).await;
                let (stdout_result, stderr_result) = run_handle.await.map_err(|e| {
                    OrchestratorError::tool(ToolErrorKind::ParseFailed, format!("output reader task failed: {e}"))
                })?;
                let (stdout_lines, _) = stdout_result?;
                let (stderr_lines, _) = stderr_result?;
                let duration_ms = start.elapsed().as_millis() as u64;
                log::warn!("tool '{}' exceeded max_output_bytes ({max_bytes}); terminated", descriptor.name);

                let mut raw_output = stdout_lines.join("\n");
                if !stderr_lines.is_empty() {
                    raw_output.push_str("\n--- stderr ---\n");
                    raw_output.push_str(&stderr_lines.join("\n"));
                }

                Ok(ToolResult {
                    raw_output,
                    exit_code: -1,
                    duration_ms,
                    truncated: true,
                })
            }
            joined = &mut run_handle => {
                let (stdout_result, stderr_result) = joined.map_err(|e| {
                    OrchestratorError::tool(ToolErrorKind::ParseFailed, format!("output reader task failed: {e}"))
                })?;
                let (stdout_lines, stdout_truncated) = stdout_result?;
                let (stderr_lines, stderr_truncated) = stderr_result?;
                let status = child.wait().await.map_err(OrchestratorError::from)?;
                let duration_ms = start.elapsed().as_millis() as u64;
                let exit_code = status.code().unwrap_or(-1);

                if !status.success() && !descriptor.success_exit_codes.contains(&exit_code) {
                    log::warn!("tool '{}' exited non-zero: {}", descriptor.name, exit_code);
                }

                let mut raw_output = stdout_lines.join("\n");
                if !stderr_lines.is_empty() {
                    raw_output.push_str("\n--- stderr ---\n");
                    raw_output.push_str(&stderr_lines.join("\n"));
                }

                Ok(ToolResult {
                    raw_output,
                    exit_code,
                    duration_ms,
                    truncated: stdout_truncated || stderr_truncated,
                })
            }
        }
    }

    /// Parse a completed execution's captured output via the descriptor's parser, producing
    /// the raw finding dictionaries the Finding Normalizer consumes next.
    pub fn parse(
        &self,
        descriptor_parser: &dyn Parser,
        result: &ToolResult,
    ) -> Result<Vec<RawFinding>, OrchestratorError> {
        descriptor_parser.parse(&result.raw_output, "")
    }
}

/// Every argument is passed as a separate argv element; no shell is involved, so there is
/// nothing to interpolate or escape.
fn build_argv(descriptor: &ToolDescriptor, args: &ValidatedArgs) -> Vec<String> {
    let mut argv = Vec::new();
    for spec in &descriptor.argument_schema {
        let Some(value) = args.get(&spec.name) else { continue };
        argv.push(format!("--{}", spec.name.replace('_', "-")));
        match value {
            crate::toolbox::schema::ArgumentValue::String(s) => argv.push(s.clone()),
            crate::toolbox::schema::ArgumentValue::Number(n) => argv.push(n.to_string()),
            crate::toolbox::schema::ArgumentValue::Integer(i) => argv.push(i.to_string()),
            crate::toolbox::schema::ArgumentValue::Boolean(b) => {
                if !b {
                    argv.pop();
                }
            }
            crate::toolbox::schema::ArgumentValue::List(items) => argv.push(items.join(",")),
        }
    }
    argv
}

/// Two-phase termination (§5): a graceful SIGTERM, then a grace window for the tool to
/// exit on its own, then an unconditional SIGKILL via `start_kill`.
async fn terminate(child: &mut tokio::process::Child, kill_grace: Duration) {
    #[cfg(unix)]
    if let Some(id) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
        if tokio::time::timeout(kill_grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Reads `reader` line by line, publishing one `tool_output` event per line in emission
/// order, and accumulates the lines for `ToolResult.raw_output` until `max_bytes` is
/// exceeded, at which point reading stops and `truncated=true` is reported rather than
/// erroring the whole execution.
async fn read_and_publish_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    max_bytes: usize,
    stream: OutputStream,
    bus: Arc<EventBus>,
    scan_id: String,
    tool_name: String,
    overflow: Arc<Notify>,
) -> Result<(Vec<String>, bool), OrchestratorError> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    let mut total_bytes = 0usize;
    let mut truncated = false;

    while let Some(line) = lines.next_line().await.map_err(OrchestratorError::from)? {
        if total_bytes + line.len() > max_bytes {
            truncated = true;
            overflow.notify_waiters();
            break;
        }
        total_bytes += line.len();
        bus.publish(
            &scan_id,
            EventKind::ToolOutput {
                tool: tool_name.clone(),
                line: line.clone(),
                stream,
            },
            None,
        );
        collected.push(line);
    }

    Ok((collected, truncated))
}
