//! Serial execution of mapping plans.
//!
//! Tasks run one at a time: the symlink-before-transfer ordering does all the
//! sequencing work, and parallel transfers would need dependency tracking the
//! plan does not carry.

use std::path::{Path, PathBuf};

use tracing::info;

use super::fsops;
use super::plan::{MappingPlan, MappingTask};
use super::MappingError;
use crate::gateway::GatewayClient;

/// Runs mapping plans against the local filesystem and the gateway.
pub struct MappingExecutor<'a> {
    gateway: &'a GatewayClient,
}

impl<'a> MappingExecutor<'a> {
    /// Create an executor borrowing the gateway client.
    #[must_use]
    pub const fn new(gateway: &'a GatewayClient) -> Self {
        Self { gateway }
    }

    /// Run the pre-command phase: the full symlink queue, then input
    /// transfers. The first error aborts the remaining tasks.
    ///
    /// # Errors
    ///
    /// Returns the first task error.
    pub async fn run_pre(&self, plan: &MappingPlan) -> Result<(), MappingError> {
        info!("Pre process input/output mappings started");
        for task in plan.symlinks.iter().chain(&plan.input_transfers) {
            self.run_task(task).await?;
        }
        info!("Pre process input/output mappings completed");
        Ok(())
    }

    /// Run the post-command phase: output transfers only.
    ///
    /// # Errors
    ///
    /// Returns the first task error. Outputs already pushed stay pushed; there
    /// is no rollback.
    pub async fn run_post(&self, plan: &MappingPlan) -> Result<(), MappingError> {
        info!("Post process output mappings started");
        for task in &plan.output_transfers {
            self.run_task(task).await?;
        }
        info!("Post process output mappings completed");
        Ok(())
    }

    async fn run_task(&self, task: &MappingTask) -> Result<(), MappingError> {
        match task {
            MappingTask::Symlink { mounted, link } => fsops::symlink_from_mounted(mounted, link),
            MappingTask::CopyFromGraph {
                source,
                destination,
            }
            | MappingTask::CopyToGraph {
                source,
                destination,
            } => fsops::copy_dir_recursive(source, destination),
            MappingTask::DownloadPrefix {
                prefix,
                destination,
            } => self.remote_copy(prefix, destination).await,
            MappingTask::UploadPrefix {
                source,
                destination,
            } => self.remote_push(source, destination).await,
        }
    }

    /// Enumerate a remote prefix and download each object.
    async fn remote_copy(&self, prefix: &str, destination: &str) -> Result<(), MappingError> {
        let files = self.gateway.enumerate_files(prefix).await?;

        if files.len() > 1 && !destination.ends_with('/') {
            return Err(MappingError::MultiFileDestination {
                prefix: prefix.to_string(),
                destination: destination.to_string(),
            });
        }

        for file in &files {
            let destination_file = if destination.ends_with('/') {
                let rel = file
                    .strip_prefix(prefix)
                    .unwrap_or(file)
                    .trim_start_matches('/');
                Path::new(destination).join(rel)
            } else {
                PathBuf::from(destination)
            };

            if let Some(parent) = destination_file.parent() {
                std::fs::create_dir_all(parent).map_err(|source| MappingError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }

            info!("Downloading file: {file}");
            self.gateway.download_file(file, &destination_file).await?;
        }

        Ok(())
    }

    /// Upload a local file, or every regular file under a local directory.
    async fn remote_push(&self, source: &str, destination: &str) -> Result<(), MappingError> {
        let destination = destination.trim_end_matches('/');

        let meta = std::fs::metadata(source).map_err(|e| MappingError::Io {
            path: source.to_string(),
            source: e,
        })?;

        if !meta.is_dir() {
            self.gateway
                .upload_file(Path::new(source), destination)
                .await?;
            return Ok(());
        }

        for file in fsops::walk_files(Path::new(source))? {
            let rel = file
                .strip_prefix(source)
                .expect("walked path is under source");
            let remote = format!("{destination}/{}", rel.display());
            self.gateway.upload_file(&file, &remote).await?;
        }

        Ok(())
    }
}
