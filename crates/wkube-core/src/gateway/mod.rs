//! Control-plane gateway client.
//!
//! Stateless request builder against the accelerator job API: every request
//! carries the `X-Authorization` token, JSON bodies set their content type,
//! and idempotent operations pass through a bounded exponential-backoff retry.
//! Blob transfers against presigned URLs go out once: retrying a
//! non-idempotent PUT risks a double write the object store cannot detect.

pub mod multipart;

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::AgentConfig;
use crate::job::JobStatus;

/// Path prefix all job endpoints are mounted under.
const API_PREFIX: &str = "/v1/ajob-cli";

/// Retry policy for transient transport faults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first (so 2 means up to 3 sends).
    pub max_retries: u32,

    /// Base delay; attempt `n` waits `backoff * 2^n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying a given zero-based attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt)
    }
}

/// Whether a transport error is worth retrying. Only network-level faults
/// qualify; any HTTP response, however unhappy, reaches the caller.
fn is_retryable(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Client for the accelerator control-plane API.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
    retry: RetryPolicy,
}

impl GatewayClient {
    /// Build a client from the agent configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BuildClient`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(config: &AgentConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.tls_no_verify)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(GatewayError::BuildClient)?;

        Ok(Self {
            http,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            retry: RetryPolicy::default(),
        })
    }

    /// Build an authenticated request against a job API endpoint.
    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!("{}{API_PREFIX}{endpoint}", self.base_url);
        self.http
            .request(method, url)
            .header("X-Authorization", &self.auth_token)
    }

    /// Send a request through the retry wrapper and map non-200 responses to
    /// [`GatewayError::Status`].
    async fn send_with_retry(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
    ) -> Result<Response, GatewayError> {
        let mut attempt = 0;
        loop {
            let req = builder
                .try_clone()
                .ok_or_else(|| GatewayError::UncloneableRequest {
                    endpoint: endpoint.to_string(),
                })?;

            match req.send().await {
                Ok(resp) => return check_status(resp, endpoint).await,
                Err(err) if is_retryable(&err) && attempt < self.retry.max_retries => {
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                },
                Err(err) => {
                    return Err(GatewayError::Transport {
                        endpoint: endpoint.to_string(),
                        source: err,
                    });
                },
            }
        }
    }

    /// Send a request exactly once. Used for presigned blob PUTs where a
    /// retry could double-write.
    async fn send_once(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
    ) -> Result<Response, GatewayError> {
        let resp = builder.send().await.map_err(|err| GatewayError::Transport {
            endpoint: endpoint.to_string(),
            source: err,
        })?;
        check_status(resp, endpoint).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, GatewayError> {
        let resp = self
            .send_with_retry(self.request(Method::GET, endpoint), endpoint)
            .await?;
        decode_json(resp, endpoint).await
    }

    /// Report a new job status to the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-200 response. Failure
    /// does not stop the local state machine; the caller decides.
    pub async fn update_job_status(&self, new_status: JobStatus) -> Result<(), GatewayError> {
        let endpoint = "/webhook-event/";
        let event = WebhookEvent {
            kind: "STATUS_UPDATE",
            data: serde_json::json!({ "new_status": new_status.as_str() }),
        };
        self.send_with_retry(
            self.request(Method::POST, endpoint).json(&event),
            endpoint,
        )
        .await?;
        Ok(())
    }

    /// Report the node/pod identifier the job landed on. Metadata only; the
    /// gateway uses it to label the job in its UI.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-200 response.
    pub async fn report_node_name(&self, node_name: &str) -> Result<(), GatewayError> {
        let endpoint = "/webhook-event/";
        let event = WebhookEvent {
            kind: "NODE_NAME_UPDATE",
            data: serde_json::json!({ "node_name": node_name }),
        };
        self.send_with_retry(
            self.request(Method::POST, endpoint).json(&event),
            endpoint,
        )
        .await?;
        Ok(())
    }

    /// Ship one log batch: presigned URL, blob PUT, register. Returns the
    /// liveness bit piggy-backed on the presigned-URL response.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the three steps fails.
    pub async fn send_log_batch(
        &self,
        lines: &[u8],
        log_filename: &str,
    ) -> Result<bool, GatewayError> {
        let endpoint = "/presigned-log-upload-url/";
        let resp = self
            .send_with_retry(
                self.request(Method::GET, endpoint)
                    .query(&[("filename", format!("{log_filename}.log"))]),
                endpoint,
            )
            .await?;
        let signed: SignedUrlResponse = decode_json(resp, endpoint).await?;

        // Raw PUT to the object store: no auth header, no retry.
        self.send_once(
            self.http
                .put(&signed.upload_url)
                .header("Content-Type", "application/octet-stream")
                .body(lines.to_vec()),
            "presigned log PUT",
        )
        .await?;

        let register = "/register-log-file/";
        self.send_with_retry(
            self.request(Method::POST, register).json(&serde_json::json!({
                "filename": signed.filename,
                "app_bucket_id": signed.app_bucket_id,
            })),
            register,
        )
        .await?;

        Ok(signed.is_healthy)
    }

    /// Ask the gateway whether this job should still be alive.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-200 response.
    pub async fn check_health(&self) -> Result<bool, GatewayError> {
        let resp: HealthCheckResponse = self.get_json("/is-healthy/").await?;
        Ok(resp.is_healthy)
    }

    /// List all object keys under a prefix in the project's store.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-200 response.
    pub async fn enumerate_files(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        self.get_json(&enumerate_endpoint(prefix)).await
    }

    /// Resolve a signed download URL for one object.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-200 response.
    pub async fn get_download_url(&self, filename: &str) -> Result<String, GatewayError> {
        let endpoint = download_url_endpoint(filename);
        let resp = self
            .send_with_retry(
                self.request(Method::GET, &endpoint)
                    .query(&[("filename", filename)]),
                &endpoint,
            )
            .await?;
        decode_json(resp, &endpoint).await
    }

    /// Download one object to a local path, streaming to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be resolved, the transfer fails, or
    /// the destination cannot be written.
    pub async fn download_file(&self, filename: &str, output_path: &Path) -> Result<(), GatewayError> {
        let url = self.get_download_url(filename).await?;

        let mut file = tokio::fs::File::create(output_path)
            .await
            .map_err(|source| GatewayError::Io {
                path: output_path.display().to_string(),
                source,
            })?;

        let mut resp = self
            .send_with_retry(self.http.get(&url), "signed download GET")
            .await?;
        while let Some(chunk) = resp.chunk().await.map_err(|source| GatewayError::Transport {
            endpoint: "signed download GET".to_string(),
            source,
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|source| GatewayError::Io {
                    path: output_path.display().to_string(),
                    source,
                })?;
        }
        file.flush().await.map_err(|source| GatewayError::Io {
            path: output_path.display().to_string(),
            source,
        })?;

        info!("File downloaded successfully to {}", output_path.display());
        Ok(())
    }

    /// Upload a local file to the job's output store under a remote name.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the upload fails.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), GatewayError> {
        info!(
            "Uploading file: {} to remote job output folder at {remote_path}",
            local_path.display()
        );

        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|source| GatewayError::Io {
                path: local_path.display().to_string(),
                source,
            })?;

        let object_id = multipart::upload(self, remote_path, file, false).await?;
        info!("Upload successful. Bucket Object ID: {object_id}");
        Ok(())
    }
}

/// `GET /<project>/enumerate-all-files/<b64-prefix>` with the project slug
/// taken from the first path segment of the prefix.
fn enumerate_endpoint(prefix: &str) -> String {
    let project_slug = prefix.split('/').next().unwrap_or_default();
    let encoded = BASE64.encode(prefix.as_bytes());
    format!("/{project_slug}/enumerate-all-files/{encoded}")
}

fn download_url_endpoint(filename: &str) -> String {
    let project_slug = filename.split('/').next().unwrap_or_default();
    format!("/{project_slug}/get-file-download-url/")
}

async fn check_status(resp: Response, endpoint: &str) -> Result<Response, GatewayError> {
    let status = resp.status();
    if status == StatusCode::OK {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        endpoint: endpoint.to_string(),
        status,
        body,
    })
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    resp: Response,
    endpoint: &str,
) -> Result<T, GatewayError> {
    resp.json().await.map_err(|source| GatewayError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

#[derive(Debug, Serialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: &'static str,
    data: serde_json::Value,
}

/// Response to `presigned-log-upload-url`. Carries the liveness bit.
#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    upload_url: String,
    filename: String,
    app_bucket_id: i64,
    is_healthy: bool,
}

#[derive(Debug, Deserialize)]
struct HealthCheckResponse {
    is_healthy: bool,
}

/// Gateway client errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    BuildClient(#[source] reqwest::Error),

    /// Network-level failure after retries were exhausted.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        /// Endpoint the request targeted.
        endpoint: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The gateway answered with a non-200 status.
    #[error("{endpoint} returned status {status}, response: {body}")]
    Status {
        /// Endpoint the request targeted.
        endpoint: String,
        /// HTTP status code.
        status: StatusCode,
        /// Response body, for the job log.
        body: String,
    },

    /// The response body did not decode as the expected JSON shape.
    #[error("error decoding response from {endpoint}: {source}")]
    Decode {
        /// Endpoint the request targeted.
        endpoint: String,
        /// Underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// A streaming-body request cannot be cloned for retry.
    #[error("request to {endpoint} has a streaming body and cannot be retried")]
    UncloneableRequest {
        /// Endpoint the request targeted.
        endpoint: String,
    },

    /// Local filesystem failure during a transfer.
    #[error("io error on {path}: {source}")]
    Io {
        /// The local path involved.
        path: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// A multipart part PUT came back without an ETag header.
    #[error("ETag not found in part upload response")]
    MissingEtag,

    /// The multipart parts list is not contiguous from part 1.
    #[error("multipart parts list has a gap at part {expected}")]
    PartGap {
        /// First part number missing from the list.
        expected: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_enumerate_endpoint_encodes_prefix() {
        let endpoint = enumerate_endpoint("myproject/inputs/run1");
        assert!(endpoint.starts_with("/myproject/enumerate-all-files/"));

        let encoded = endpoint.rsplit('/').next().unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"myproject/inputs/run1");
    }

    #[test]
    fn test_download_url_endpoint_uses_project_slug() {
        assert_eq!(
            download_url_endpoint("myproject/data/a.txt"),
            "/myproject/get-file-download-url/"
        );
    }

    #[test]
    fn test_status_event_envelope_shape() {
        let event = WebhookEvent {
            kind: "STATUS_UPDATE",
            data: serde_json::json!({ "new_status": "PROCESSING" }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "STATUS_UPDATE");
        assert_eq!(json["data"]["new_status"], "PROCESSING");
    }
}
