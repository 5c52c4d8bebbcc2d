//! Unconditional job finalization.
//!
//! A linear list of cleanup steps, each with independent error capture, plus
//! a single terminal-status decision at the end. Every exit path of the
//! controller funnels through here exactly once; nothing in a step may stop
//! the steps after it.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::{JobError, JobStatus, plan_from_config};
use crate::config::{AgentConfig, LOCAL_LOG_PATH};
use crate::gateway::GatewayClient;
use crate::logsink::RemoteLogSink;
use crate::mapping::MappingExecutor;
use crate::stats;

/// Runs the cleanup steps and decides the terminal status and exit code.
pub struct Finalizer {
    config: AgentConfig,
    gateway: Arc<GatewayClient>,
    sink: RemoteLogSink,
    error: Option<JobError>,
    signal_origin: bool,
    post_mappings_done: bool,
}

impl Finalizer {
    /// Capture the run outcome.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        gateway: Arc<GatewayClient>,
        sink: RemoteLogSink,
        error: Option<JobError>,
        signal_origin: bool,
        post_mappings_done: bool,
    ) -> Self {
        Self {
            config,
            gateway,
            sink,
            error,
            signal_origin,
            post_mappings_done,
        }
    }

    /// Run all cleanup steps and return the process exit code.
    pub async fn run(self) -> i32 {
        if let Some(err) = &self.error {
            error!("Error: {err}");
        }

        if self.post_mappings_done {
            info!("Output mappings already pushed; skipping in finalization");
        } else {
            self.push_outputs_best_effort().await;
        }

        if let Err(err) = stats::verbose_resource_report().await {
            warn!("Error generating resource report: {err}");
        }

        if let Err(err) = self
            .gateway
            .upload_file(Path::new(LOCAL_LOG_PATH), &self.config.log_file_name)
            .await
        {
            error!("error uploading job log: {err}");
        }

        self.sink.final_flush().await;

        self.report_terminal_status().await;

        i32::from(self.error.is_some())
    }

    /// Output pushes may already have failed once during the run; retrying
    /// here is still the right call for health kills and cancellations, where
    /// partial outputs beat no outputs.
    async fn push_outputs_best_effort(&self) {
        let plan = match plan_from_config(&self.config) {
            Ok(plan) => plan,
            Err(err) => {
                error!("error preparing post-process mappings: {err}");
                return;
            },
        };

        if let Err(err) = MappingExecutor::new(&self.gateway).run_post(&plan).await {
            error!("error in post-process-mappings: {err}");
        }
    }

    async fn report_terminal_status(&self) {
        match &self.error {
            None => {
                if let Err(err) = self.gateway.update_job_status(JobStatus::Done).await {
                    error!("Error updating status to DONE: {err}");
                }
            },
            Some(_) if self.signal_origin => {
                // The orchestrator initiated the shutdown; it already knows
                // the job's fate and a late ERROR would misfile preemption
                // as failure.
                info!("Skipping terminal status update for signal-initiated cancellation");
            },
            Some(_) => {
                if let Err(err) = self.gateway.update_job_status(JobStatus::Error).await {
                    error!("Error updating status to ERROR: {err}");
                }
            },
        }
    }
}
