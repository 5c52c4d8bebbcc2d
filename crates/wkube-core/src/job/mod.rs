//! Job lifecycle controller.
//!
//! The controller owns the externally observable state machine
//! (`MAPPING_INPUTS → PROCESSING → MAPPING_OUTPUTS → DONE`, with `ERROR`
//! reachable from anywhere, once), spawns the user command in its own process
//! group, sequences mappings and the tunnel around it, and guarantees that
//! finalization runs exactly once on every exit path: nominal, erroring,
//! panicking, signal-cancelled, or health-killed.

mod debug;
mod finalize;

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt as _;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::gateway::{GatewayClient, GatewayError};
use crate::logsink::{self, MultiWriter, RemoteLogSink};
use crate::mapping::{self, MappingError, MappingExecutor, MappingPlan, Selections};
use crate::tunnel::{self, TunnelError};

pub use finalize::Finalizer;

/// Grace between SIGTERM and SIGKILL to the command's process group.
const KILL_ESCALATION_DELAY: Duration = Duration::from_secs(10);

/// Externally visible job status, reported to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Inputs are being staged into the container.
    MappingInputs,

    /// The user command is running.
    Processing,

    /// Outputs are being pushed out of the container.
    MappingOutputs,

    /// Clean completion.
    Done,

    /// Terminal failure. May follow any state, once.
    Error,
}

impl JobStatus {
    /// Wire representation of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MappingInputs => "MAPPING_INPUTS",
            Self::Processing => "PROCESSING",
            Self::MappingOutputs => "MAPPING_OUTPUTS",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    /// Whether this status may be reported after `previous`. The nominal
    /// progression is strictly ordered; only `Error` may enter out of order,
    /// and nothing follows a terminal status.
    #[must_use]
    pub fn may_follow(self, previous: Option<Self>) -> bool {
        match previous {
            None => matches!(self, Self::MappingInputs | Self::Error),
            Some(Self::Done | Self::Error) => false,
            Some(prev) => {
                if self == Self::Error {
                    return true;
                }
                let order = [Self::MappingInputs, Self::Processing, Self::MappingOutputs, Self::Done];
                let prev_index = order.iter().position(|s| *s == prev);
                let next_index = order.iter().position(|s| *s == self);
                matches!((prev_index, next_index), (Some(p), Some(n)) if n == p + 1)
            },
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job controller errors, the error taxonomy of a run.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A status transition could not be reported.
    #[error("error updating status to {status}: {source}")]
    StatusUpdate {
        /// The status that failed to report.
        status: JobStatus,
        /// Underlying gateway error.
        #[source]
        source: GatewayError,
    },

    /// Pre-run mapping failure; the command never started.
    #[error("error in pre-process-mappings: {0}")]
    PreMappings(#[source] MappingError),

    /// Post-run mapping failure; the command already succeeded.
    #[error("error in post-process-mappings: {0}")]
    PostMappings(#[source] MappingError),

    /// The node-name metadata ping failed.
    #[error("error reporting node name: {0}")]
    NodeName(#[source] GatewayError),

    /// The user command could not be started.
    #[error("error starting command: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the user command failed.
    #[error("error waiting for command: {0}")]
    Wait(#[source] std::io::Error),

    /// The user command exited unsuccessfully.
    #[error("command execution error: {status}")]
    CommandFailed {
        /// The command's exit status.
        status: std::process::ExitStatus,
    },

    /// The job context was cancelled.
    #[error("context cancelled during {0} — aborting")]
    Cancelled(&'static str),

    /// The reverse tunnel collapsed past its restart policy.
    #[error("error setting up interactive tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    /// The control plane declared the job unhealthy.
    #[error("job terminated by control-plane health verdict")]
    HealthKill,

    /// The controller panicked; recovered and reported.
    #[error("panic in job controller: {0}")]
    Panic(String),
}

/// Mutable run bookkeeping shared between the run body and finalization.
#[derive(Debug, Default)]
struct RunState {
    post_mappings_done: bool,
}

/// Top-level controller for one supervised job.
pub struct JobController {
    config: AgentConfig,
    gateway: Arc<GatewayClient>,
    sink: RemoteLogSink,
    writer: MultiWriter,
    cancel: CancellationToken,
    health_kill: CancellationToken,
    signalled: Arc<AtomicBool>,
}

impl JobController {
    /// Wire up a controller.
    ///
    /// `cancel` is the job-wide cancellation token; `health_kill` is the
    /// token the log sink engages on an unhealthy verdict.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        gateway: Arc<GatewayClient>,
        sink: RemoteLogSink,
        writer: MultiWriter,
        cancel: CancellationToken,
        health_kill: CancellationToken,
    ) -> Self {
        Self {
            config,
            gateway,
            sink,
            writer,
            cancel,
            health_kill,
            signalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the job to completion and return the process exit code.
    ///
    /// Finalization runs on every path out of the run body, including a
    /// panic, which is caught, logged, and reported as `ERROR`.
    pub async fn run(self, command: String) -> i32 {
        self.spawn_signal_listener();

        let health_killed = Arc::new(AtomicBool::new(false));
        {
            let health_kill = self.health_kill.clone();
            let cancel = self.cancel.clone();
            let flag = Arc::clone(&health_killed);
            tokio::spawn(async move {
                health_kill.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                cancel.cancel();
            });
        }

        let mut state = RunState::default();
        let outcome = std::panic::AssertUnwindSafe(self.run_inner(&command, &mut state))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Panic: {message}");
                Some(JobError::Panic(message))
            },
        };

        // A health kill can surface as a generic cancellation; name it.
        let error = match error {
            None if health_killed.load(Ordering::SeqCst) => Some(JobError::HealthKill),
            Some(JobError::Cancelled(_)) if health_killed.load(Ordering::SeqCst) => {
                Some(JobError::HealthKill)
            },
            other => other,
        };

        let signal_origin = self.signalled.load(Ordering::SeqCst)
            && matches!(error, Some(JobError::Cancelled(_)));

        Finalizer::new(
            self.config,
            self.gateway,
            self.sink,
            error,
            signal_origin,
            state.post_mappings_done,
        )
        .run()
        .await
    }

    async fn run_inner(&self, command: &str, state: &mut RunState) -> Result<(), JobError> {
        self.report_status(JobStatus::MappingInputs).await?;

        let plan = plan_from_config(&self.config).map_err(JobError::PreMappings)?;

        let executor = MappingExecutor::new(&self.gateway);
        executor.run_pre(&plan).await.map_err(JobError::PreMappings)?;

        self.abort_if_cancelled("input mappings")?;

        self.report_status(JobStatus::Processing).await?;

        self.gateway
            .report_node_name(&self.config.pod_id)
            .await
            .map_err(JobError::NodeName)?;

        debug::check_and_list_debug_path(
            "BEFORE STARTING COMMAND",
            self.config.debug_mapping_path.as_deref(),
        );

        let tunnel_failure = self.start_tunnel_if_configured();

        self.abort_if_cancelled("tunnel setup")?;

        self.supervise_command(command, &tunnel_failure).await?;

        self.report_status(JobStatus::MappingOutputs).await?;

        debug::check_and_list_debug_path(
            "AFTER COMMAND FINISHED",
            self.config.debug_mapping_path.as_deref(),
        );

        executor
            .run_post(&plan)
            .await
            .map_err(JobError::PostMappings)?;
        state.post_mappings_done = true;

        Ok(())
    }

    /// Spawn the user command in its own process group and wait for it,
    /// escalating SIGTERM → SIGKILL on cancellation.
    async fn supervise_command(
        &self,
        command: &str,
        tunnel_failure: &Arc<Mutex<Option<TunnelError>>>,
    ) -> Result<(), JobError> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .env("PYTHONUNBUFFERED", "1")
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(JobError::Spawn)?;

        let pgid = child.id().map(|id| Pid::from_raw(id as i32));

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(logsink::pump(stdout, self.writer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(logsink::pump(stderr, self.writer.clone())));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status.map_err(JobError::Wait)?),
            () = self.cancel.cancelled() => None,
        };

        let Some(status) = waited else {
            info!("Command interrupted due to context cancellation");
            if let Some(pgid) = pgid {
                let _ = killpg(pgid, Signal::SIGTERM);
            }
            if tokio::time::timeout(KILL_ESCALATION_DELAY, child.wait())
                .await
                .is_err()
            {
                warn!("Command still alive after SIGTERM grace — sending SIGKILL to process group");
                if let Some(pgid) = pgid {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                let _ = child.wait().await;
            }
            for pump in pumps {
                let _ = pump.await;
            }

            if let Some(err) = take_tunnel_failure(tunnel_failure) {
                return Err(JobError::Tunnel(err));
            }
            return Err(JobError::Cancelled("command execution"));
        };

        for pump in pumps {
            let _ = pump.await;
        }

        if !status.success() {
            return Err(JobError::CommandFailed { status });
        }
        Ok(())
    }

    /// Start the tunnel supervisor when an interactive socket is configured
    /// and watch its error channel; a terminal tunnel error cancels the job.
    fn start_tunnel_if_configured(&self) -> Arc<Mutex<Option<TunnelError>>> {
        let failure: Arc<Mutex<Option<TunnelError>>> = Arc::default();

        if let Some(socket) = &self.config.interactive_socket {
            let mut errors = tunnel::start_with_restart(
                socket.clone(),
                self.writer.clone(),
                self.cancel.clone(),
            );

            let cancel = self.cancel.clone();
            let slot = Arc::clone(&failure);
            tokio::spawn(async move {
                tokio::select! {
                    received = errors.recv() => {
                        if let Some(err) = received {
                            error!("{err}");
                            *slot.lock().expect("tunnel failure slot poisoned") = Some(err);
                            cancel.cancel();
                        }
                    },
                    () = cancel.cancelled() => {},
                }
            });
        }

        failure
    }

    fn spawn_signal_listener(&self) {
        let cancel = self.cancel.clone();
        let signalled = Arc::clone(&self.signalled);

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to install SIGTERM handler: {err}");
                    return;
                },
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to install SIGINT handler: {err}");
                    return;
                },
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received signal: SIGTERM — forwarding to child process");
                },
                _ = sigint.recv() => {
                    info!("Received signal: SIGINT — forwarding to child process");
                },
            }
            signalled.store(true, Ordering::SeqCst);
            cancel.cancel();
        });
    }

    async fn report_status(&self, status: JobStatus) -> Result<(), JobError> {
        self.gateway
            .update_job_status(status)
            .await
            .map_err(|source| JobError::StatusUpdate { status, source })
    }

    fn abort_if_cancelled(&self, during: &'static str) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled(during));
        }
        Ok(())
    }
}

fn take_tunnel_failure(slot: &Arc<Mutex<Option<TunnelError>>>) -> Option<TunnelError> {
    slot.lock().expect("tunnel failure slot poisoned").take()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Build a [`Selections`] value from the agent configuration.
#[must_use]
pub fn selections_from_config(config: &AgentConfig) -> Selections {
    Selections {
        files: config.selected_filenames.clone(),
        folders: config.selected_foldernames.clone(),
    }
}

/// Rebuild the mapping plan from configuration; used by finalization when the
/// run body never got as far as building one.
pub(crate) fn plan_from_config(config: &AgentConfig) -> Result<MappingPlan, MappingError> {
    mapping::build_plan(
        &config.input_mappings,
        &config.output_mappings,
        &selections_from_config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(JobStatus::MappingInputs.as_str(), "MAPPING_INPUTS");
        assert_eq!(JobStatus::Processing.as_str(), "PROCESSING");
        assert_eq!(JobStatus::MappingOutputs.as_str(), "MAPPING_OUTPUTS");
        assert_eq!(JobStatus::Done.as_str(), "DONE");
        assert_eq!(JobStatus::Error.as_str(), "ERROR");
    }

    #[test]
    fn test_status_monotonic_progression() {
        assert!(JobStatus::MappingInputs.may_follow(None));
        assert!(JobStatus::Processing.may_follow(Some(JobStatus::MappingInputs)));
        assert!(JobStatus::MappingOutputs.may_follow(Some(JobStatus::Processing)));
        assert!(JobStatus::Done.may_follow(Some(JobStatus::MappingOutputs)));

        // No skipping forward, no going back.
        assert!(!JobStatus::MappingOutputs.may_follow(Some(JobStatus::MappingInputs)));
        assert!(!JobStatus::MappingInputs.may_follow(Some(JobStatus::Processing)));
        assert!(!JobStatus::Done.may_follow(Some(JobStatus::Processing)));
    }

    #[test]
    fn test_error_allowed_from_any_live_state_once() {
        assert!(JobStatus::Error.may_follow(None));
        assert!(JobStatus::Error.may_follow(Some(JobStatus::MappingInputs)));
        assert!(JobStatus::Error.may_follow(Some(JobStatus::Processing)));
        assert!(JobStatus::Error.may_follow(Some(JobStatus::MappingOutputs)));

        // Terminal states accept nothing, ERROR included.
        assert!(!JobStatus::Error.may_follow(Some(JobStatus::Error)));
        assert!(!JobStatus::Error.may_follow(Some(JobStatus::Done)));
        assert!(!JobStatus::Processing.may_follow(Some(JobStatus::Done)));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("literal panic");
        assert_eq!(panic_message(boxed.as_ref()), "literal panic");

        let boxed: Box<dyn std::any::Any + Send> = Box::new("owned panic".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "owned panic");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
