//! Reverse-tunnel supervision.
//!
//! When the orchestrator asks for an interactive socket, the agent keeps an
//! `ssh -N -R` child alive that forwards a per-job remote UNIX socket on the
//! tunnel gateway to a local target inside the container. The child is
//! restarted on failure under a bounded policy; once the policy gives up, the
//! terminal error is the job's death warrant: the controller cancels
//! everything.

use std::io::Write as _;
use std::process::Stdio;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TunnelConfig;
use crate::logsink::{self, MultiWriter};

/// Delay between restart attempts.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Window from the first failure within which restarts are still attempted.
const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Consecutive failures after which the supervisor gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Consecutive-failure bookkeeping for the restart loop.
#[derive(Debug, Default)]
pub struct TunnelBackoff {
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
}

/// What the restart loop should do after a child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Sleep, then start the child again.
    RetryAfter(Duration),

    /// Stop restarting and surface a terminal error.
    GiveUp {
        /// Consecutive failures at the point of giving up.
        failures: u32,
    },
}

impl TunnelBackoff {
    /// Record a failed child lifetime and decide whether to restart.
    pub fn on_failure(&mut self, now: Instant) -> RestartDecision {
        self.consecutive_failures += 1;
        let first = *self.first_failure_at.get_or_insert(now);

        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            || now.duration_since(first) > GRACE_PERIOD
        {
            RestartDecision::GiveUp {
                failures: self.consecutive_failures,
            }
        } else {
            RestartDecision::RetryAfter(RETRY_DELAY)
        }
    }

    /// Record a clean child exit; the failure streak is over.
    pub fn on_clean_exit(&mut self) {
        self.consecutive_failures = 0;
        self.first_failure_at = None;
    }

    /// Current consecutive-failure count.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Tunnel supervision errors.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Tunnel gateway identity incomplete.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The base64 key material did not decode.
    #[error("failed to decode SSH key: {0}")]
    InvalidKey(#[from] base64::DecodeError),

    /// Local failure preparing or spawning the child.
    #[error("failed to start SSH reverse tunnel: {0}")]
    Io(#[from] std::io::Error),

    /// The ssh child exited unsuccessfully.
    #[error("tunnel process exited with status {status}")]
    ProcessFailed {
        /// The child's exit status.
        status: std::process::ExitStatus,
    },

    /// The restart policy gave up.
    #[error("tunnel failed {failures} times over {elapsed:?} — giving up")]
    Terminal {
        /// Consecutive failures at the point of giving up.
        failures: u32,
        /// Time since the first failure of the streak.
        elapsed: Duration,
    },
}

/// Start the supervision task. The returned receiver yields at most one
/// terminal error; the controller cancels the job when it does.
#[must_use]
pub fn start_with_restart(
    local_socket: String,
    writer: MultiWriter,
    cancel: CancellationToken,
) -> mpsc::Receiver<TunnelError> {
    let (err_tx, err_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut backoff = TunnelBackoff::default();

        loop {
            if cancel.is_cancelled() {
                info!("Tunnel supervisor exiting due to cancellation");
                return;
            }

            let attempt = tokio::select! {
                result = run_tunnel_once(&local_socket, writer.clone()) => result,
                () = cancel.cancelled() => {
                    info!("Tunnel supervisor exiting due to cancellation");
                    return;
                },
            };

            match attempt {
                Ok(()) => backoff.on_clean_exit(),
                Err(err) => {
                    warn!("Tunnel process exited with error: {err}");
                    let now = Instant::now();
                    match backoff.on_failure(now) {
                        RestartDecision::RetryAfter(delay) => {
                            info!(
                                "Retrying tunnel in {delay:?} ({}/{MAX_CONSECUTIVE_FAILURES})",
                                backoff.consecutive_failures()
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {},
                                () = cancel.cancelled() => return,
                            }
                        },
                        RestartDecision::GiveUp { failures } => {
                            let elapsed = backoff
                                .first_failure_at
                                .map(|first| now.duration_since(first))
                                .unwrap_or_default();
                            let _ = err_tx
                                .send(TunnelError::Terminal { failures, elapsed })
                                .await;
                            return;
                        },
                    }
                },
            }
        }
    });

    err_rx
}

/// Run one ssh child to completion.
async fn run_tunnel_once(local_socket: &str, writer: MultiWriter) -> Result<(), TunnelError> {
    let config = TunnelConfig::from_env()?;

    let key_bytes = BASE64.decode(config.private_key_base64.trim())?;
    let key_file = write_key_file(&key_bytes)?;

    let remote_socket = format!("/tmp/{}.sock", Uuid::new_v4());

    let mut args: Vec<String> = vec![
        "-i".to_string(),
        key_file.path().display().to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=10".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "-N".to_string(),
        "-p".to_string(),
        config.ssh_port.clone(),
    ];

    if let Some(unix_path) = local_socket.strip_prefix("unix:") {
        args.push("-R".to_string());
        args.push(format!("{remote_socket}:{unix_path}"));
        info!("Setting up UNIX → UNIX tunnel: {remote_socket} -> {unix_path}");
    } else {
        args.push("-R".to_string());
        args.push(format!("{remote_socket}:{local_socket}"));
        info!("Setting up TCP → UNIX tunnel: {remote_socket} -> {local_socket}");
    }

    args.push(format!("{}@{}", config.ssh_user, config.ssh_server));

    info!("Starting reverse tunnel with command: ssh {}", args.join(" "));

    let mut child = Command::new(&config.ssh_binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(logsink::pump(stdout, writer.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(logsink::pump(stderr, writer.clone()));
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(TunnelError::ProcessFailed { status });
    }

    let socket_name = remote_socket
        .trim_start_matches("/tmp/")
        .trim_end_matches(".sock");
    info!(
        "Interactive socket tunneled at: {socket_name}.{}",
        config.gateway_domain
    );
    Ok(())
}

/// Write key material to a 0600 tempfile that is deleted on drop.
fn write_key_file(key_bytes: &[u8]) -> Result<tempfile::NamedTempFile, TunnelError> {
    use std::os::unix::fs::PermissionsExt as _;

    let mut key_file = tempfile::Builder::new().prefix("id_rsa_").tempfile()?;
    std::fs::set_permissions(key_file.path(), std::fs::Permissions::from_mode(0o600))?;
    key_file.write_all(key_bytes)?;
    key_file.flush()?;
    Ok(key_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_allows_early_retries() {
        let mut backoff = TunnelBackoff::default();
        let t0 = Instant::now();

        for attempt in 1..MAX_CONSECUTIVE_FAILURES {
            let decision = backoff.on_failure(t0 + Duration::from_secs(u64::from(attempt)));
            assert_eq!(decision, RestartDecision::RetryAfter(RETRY_DELAY));
        }
    }

    #[test]
    fn test_backoff_gives_up_after_max_failures() {
        let mut backoff = TunnelBackoff::default();
        let t0 = Instant::now();

        for _ in 1..MAX_CONSECUTIVE_FAILURES {
            backoff.on_failure(t0);
        }
        assert_eq!(
            backoff.on_failure(t0),
            RestartDecision::GiveUp {
                failures: MAX_CONSECUTIVE_FAILURES
            }
        );
    }

    #[test]
    fn test_backoff_gives_up_past_grace_period() {
        let mut backoff = TunnelBackoff::default();
        let t0 = Instant::now();

        assert_eq!(
            backoff.on_failure(t0),
            RestartDecision::RetryAfter(RETRY_DELAY)
        );
        // Second failure, but long after the first: grace period exceeded.
        assert!(matches!(
            backoff.on_failure(t0 + GRACE_PERIOD + Duration::from_secs(1)),
            RestartDecision::GiveUp { failures: 2 }
        ));
    }

    #[test]
    fn test_clean_exit_resets_streak() {
        let mut backoff = TunnelBackoff::default();
        let t0 = Instant::now();

        backoff.on_failure(t0);
        backoff.on_failure(t0);
        backoff.on_clean_exit();
        assert_eq!(backoff.consecutive_failures(), 0);

        // The streak starts over, with a fresh grace window.
        assert_eq!(
            backoff.on_failure(t0 + GRACE_PERIOD * 2),
            RestartDecision::RetryAfter(RETRY_DELAY)
        );
    }

    #[test]
    fn test_key_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt as _;

        let key_file = write_key_file(b"---- KEY ----").unwrap();
        let mode = std::fs::metadata(key_file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
