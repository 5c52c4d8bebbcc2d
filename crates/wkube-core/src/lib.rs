//! # wkube-core
//!
//! Core library for the wkube job agent: the supervisor process that runs as
//! PID-1 inside a workload container, wraps a single user-supplied shell
//! command, and is the only component in the container that talks to the
//! accelerator control plane.
//!
//! ## Features
//!
//! - **Job Lifecycle**: Ordered, abortable status progression with guaranteed
//!   finalization on every exit path
//! - **Input/Output Mappings**: Declarative staging of object-store prefixes,
//!   mounted volumes, and dynamic selections around the command
//! - **Remote Log Sink**: Bounded, lossy, batched log forwarding with a
//!   liveness probe doubling as the control plane's kill switch
//! - **Reverse Tunnel**: Restartable SSH reverse tunnel supervision with
//!   bounded failure semantics
//!
//! ## Example
//!
//! ```rust,no_run
//! use wkube_core::config::AgentConfig;
//! use wkube_core::mapping::{self, Selections};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::from_env()?;
//! let plan = mapping::build_plan(
//!     &config.input_mappings,
//!     &config.output_mappings,
//!     &Selections::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod gateway;
pub mod job;
pub mod logsink;
pub mod mapping;
pub mod stats;
pub mod tunnel;

pub use config::AgentConfig;
pub use gateway::GatewayClient;
pub use job::{JobController, JobStatus};
pub use logsink::{MultiWriter, RemoteLogSink};
