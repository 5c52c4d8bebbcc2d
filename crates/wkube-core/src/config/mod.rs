//! Agent configuration sourced from the container environment.
//!
//! The orchestrator passes everything through environment variables; there is
//! no configuration file. Reading them happens once at startup so that a
//! malformed environment fails the job before any side effect.

use std::env;
use std::path::PathBuf;

/// Default control-plane base URL when `ACC_JOB_GATEWAY_SERVER` is unset.
pub const DEFAULT_GATEWAY_URL: &str = "https://accelerator-api.iiasa.ac.at";

/// Path of the local append-mode logfile mirrored to the remote sink.
pub const LOCAL_LOG_PATH: &str = "/tmp/job.log";

/// Default location of the statically linked ssh binary inside the image.
pub const DEFAULT_SSH_BINARY: &str = "/mnt/agent/ssh";

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control-plane base URL (no trailing slash).
    pub gateway_url: String,

    /// Bearer token sent as `X-Authorization`. Required.
    pub auth_token: String,

    /// Pod identifier used to name the uploaded logfile.
    pub pod_id: String,

    /// Remote name of the uploaded logfile, `job-<POD_ID>.log`.
    pub log_file_name: String,

    /// Raw `input_mappings` DSL expression (`;`-separated rules).
    pub input_mappings: String,

    /// Raw `output_mappings` DSL expression (`;`-separated rules).
    pub output_mappings: String,

    /// Comma list from `selected_filenames`, split but otherwise untouched.
    pub selected_filenames: Option<Vec<String>>,

    /// Comma list from `selected_foldernames`, split but otherwise untouched.
    pub selected_foldernames: Option<Vec<String>>,

    /// Reverse-tunnel target; tunneling is enabled when set.
    pub interactive_socket: Option<String>,

    /// When set, the agent walks and logs this path before and after the
    /// command.
    pub debug_mapping_path: Option<PathBuf>,

    /// Skip TLS certificate verification against the gateway. The deployed
    /// environment terminates TLS on an internal CA, so this defaults to on.
    pub tls_no_verify: bool,
}

impl AgentConfig {
    /// Load the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] when `ACC_JOB_TOKEN` is unset or
    /// empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let auth_token = env::var("ACC_JOB_TOKEN").unwrap_or_default();
        if auth_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        let pod_id = getenv_with_default("POD_ID", "unknown");

        Ok(Self {
            gateway_url: getenv_with_default("ACC_JOB_GATEWAY_SERVER", DEFAULT_GATEWAY_URL),
            auth_token,
            log_file_name: format!("job-{pod_id}.log"),
            pod_id,
            input_mappings: env::var("input_mappings").unwrap_or_default(),
            output_mappings: env::var("output_mappings").unwrap_or_default(),
            selected_filenames: split_selection(env::var("selected_filenames").ok()),
            selected_foldernames: split_selection(env::var("selected_foldernames").ok()),
            interactive_socket: env::var("interactive_socket").ok().filter(|s| !s.is_empty()),
            debug_mapping_path: env::var("DEBUG_WKUBE_MAPPING_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            tls_no_verify: getenv_with_default("ACC_JOB_TLS_NO_VERIFY", "1") != "0",
        })
    }
}

/// Reverse-tunnel gateway identity, read separately because the variables are
/// only required once a tunnel is actually requested.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// SSH user at the tunnel gateway.
    pub ssh_user: String,

    /// SSH server hostname.
    pub ssh_server: String,

    /// SSH port, defaults to 22.
    pub ssh_port: String,

    /// Public domain under which tunneled sockets are exposed.
    pub gateway_domain: String,

    /// Base64-encoded private key material.
    pub private_key_base64: String,

    /// Pod identifier, reused for tunnel bookkeeping on the gateway side.
    pub pod_id: String,

    /// Path to the ssh binary.
    pub ssh_binary: PathBuf,
}

impl TunnelConfig {
    /// Load the tunnel configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTunnelVariables`] when any of the
    /// required variables is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ssh_user = env::var("TUNNEL_GATEWAY_SSH_USER").unwrap_or_default();
        let ssh_server = env::var("TUNNEL_GATEWAY_SSH_SERVER").unwrap_or_default();
        let gateway_domain = env::var("TUNNEL_GATEWAY_DOMAIN").unwrap_or_default();
        let private_key_base64 =
            env::var("TUNNEL_GATEWAY_SSH_PRIVATE_KEY_BASE64").unwrap_or_default();
        let pod_id = env::var("POD_ID").unwrap_or_default();

        if ssh_user.is_empty()
            || ssh_server.is_empty()
            || gateway_domain.is_empty()
            || private_key_base64.is_empty()
            || pod_id.is_empty()
        {
            return Err(ConfigError::MissingTunnelVariables);
        }

        Ok(Self {
            ssh_user,
            ssh_server,
            ssh_port: getenv_with_default("TUNNEL_GATEWAY_SSH_PORT", "22"),
            gateway_domain,
            private_key_base64,
            pod_id,
            ssh_binary: PathBuf::from(getenv_with_default(
                "TUNNEL_GATEWAY_SSH_BINARY",
                DEFAULT_SSH_BINARY,
            )),
        })
    }
}

fn getenv_with_default(key: &str, fallback: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => fallback.to_string(),
    }
}

/// Split a selection env value on commas, preserving empty entries so that
/// cardinality checks see what the orchestrator actually sent.
fn split_selection(raw: Option<String>) -> Option<Vec<String>> {
    match raw {
        Some(s) if !s.is_empty() => Some(s.split(',').map(str::to_string).collect()),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `ACC_JOB_TOKEN` is unset.
    #[error("ACC_JOB_TOKEN environment variable not set")]
    MissingToken,

    /// One of the `TUNNEL_GATEWAY_*` variables is unset.
    #[error(
        "missing required environment variables: TUNNEL_GATEWAY_SSH_USER, \
         TUNNEL_GATEWAY_SSH_SERVER, TUNNEL_GATEWAY_SSH_PRIVATE_KEY_BASE64, \
         TUNNEL_GATEWAY_DOMAIN, POD_ID"
    )]
    MissingTunnelVariables,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_selection() {
        assert_eq!(split_selection(None), None);
        assert_eq!(split_selection(Some(String::new())), None);
        assert_eq!(
            split_selection(Some("a.txt".to_string())),
            Some(vec!["a.txt".to_string()])
        );
        // Empty entries survive the split; cardinality checks depend on it.
        assert_eq!(
            split_selection(Some("a.txt,".to_string())),
            Some(vec!["a.txt".to_string(), String::new()])
        );
    }

    #[test]
    fn test_getenv_with_default() {
        let key = "WKUBE_TEST_UNSET_VARIABLE_XYZ";
        std::env::remove_var(key);
        assert_eq!(getenv_with_default(key, "fallback"), "fallback");
    }
}
