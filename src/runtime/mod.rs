//! Container-runtime capability set.
//!
//! Two backends implement the same three operations: list running containers
//! with their root pid and pod identity, remove a container, release the
//! client. Per-container inspect timeouts are reported through a one-way
//! callback so the detector can keep its ledger without the adapter holding
//! a reference back into it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeKind;

mod containerd;
mod docker;

pub use containerd::ContainerdRuntime;
pub use docker::DockerRuntime;

/// Invoked with the full container id whenever a per-container inspect call
/// exceeds its deadline.
pub type InspectTimeoutCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("cannot connect to container runtime: {0}")]
    Connection(String),

    #[error("container runtime error: {0}")]
    Backend(String),
}

/// A running container as seen in one detection pass.
#[derive(Debug, Clone)]
pub struct ContainerMeta {
    /// Short id, the 12-char prefix of the runtime id.
    pub id: String,
    pub root_pid: i32,
    pub pod_name: String,
    pub pod_namespace: String,
    pub cmdline: String,
    pub created_at: DateTime<Utc>,
    /// Transitive closure of `root_pid`'s children; filled by the detector.
    pub descendants: HashSet<i32>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers. Per-container inspect failures are skipped
    /// with a warning; inspect timeouts additionally fire the timeout
    /// callback. `descendants` is left empty.
    async fn list_containers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerMeta>, RuntimeError>;

    /// Stop and force-remove a container (volumes included) under the given
    /// deadline. Removing an already-gone container is success.
    async fn remove_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Release backend resources. Safe to call more than once.
    async fn close(&self);
}

/// Connect to the configured backend. Failure here is a startup error.
pub async fn connect(
    kind: RuntimeKind,
    inspect_timeout: Duration,
    on_inspect_timeout: InspectTimeoutCallback,
) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    match kind {
        RuntimeKind::Docker => {
            let rt = DockerRuntime::connect(inspect_timeout, on_inspect_timeout)?;
            Ok(Arc::new(rt))
        }
        RuntimeKind::Containerd => {
            let rt = ContainerdRuntime::connect(inspect_timeout, on_inspect_timeout).await?;
            Ok(Arc::new(rt))
        }
    }
}

/// First 12 characters of a runtime container id.
pub fn short_id(full_id: &str) -> String {
    full_id[..full_id.len().min(12)].to_string()
}
