//! nodeisp-service - container service manager for the nodeisp stack.
//!
//! Keeps a fixed set of containerized services converged with their
//! descriptors on a single host.
//!
//! ## Components
//!
//! - **Descriptors**: desired container configuration plus content hash
//! - **Runtime**: gateway trait over the container runtime (Docker)
//! - **Manager**: drift detection and convergence per service
//! - **Streamer**: per-service output readers feeding log files
//! - **Exec**: fire-and-forget commands inside service containers
//! - **State**: JSON snapshot of the manager between restarts

pub mod descriptor;
pub mod error;
pub mod exec;
pub mod labels;
pub mod logfile;
pub mod manager;
pub mod runtime;
pub mod state;
pub mod streamer;

pub use descriptor::{Mount, MountKind, PortBinding, PortBindings, ServiceDescriptor};
pub use error::{Result, RuntimeError, ServiceError, StateError};
pub use exec::CommandHandle;
pub use manager::{ExitState, Manager, RECONCILE_TIMEOUT, ServiceStatus};
pub use runtime::{ContainerRuntime, ContainerState, ContainerSummary, DockerRuntime};
pub use state::{StateSnapshot, StateStore};
pub use streamer::StreamerState;
