//! Docker-compatible runtime adapter.
//!
//! Talks to the engine API via `DOCKER_HOST` when set, otherwise the local
//! unix socket. Pod identity comes from the legacy underscore-separated
//! container name (`k8s_<container>_<pod>_<namespace>_<uid>_<attempt>`).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{short_id, ContainerMeta, ContainerRuntime, InspectTimeoutCallback, RuntimeError};

pub struct DockerRuntime {
    client: Docker,
    inspect_timeout: Duration,
    on_inspect_timeout: InspectTimeoutCallback,
}

impl DockerRuntime {
    pub fn connect(
        inspect_timeout: Duration,
        on_inspect_timeout: InspectTimeoutCallback,
    ) -> Result<Self, RuntimeError> {
        let client = match std::env::var("DOCKER_HOST") {
            Ok(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)
            }
            Ok(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(&host, 120, bollard::API_DEFAULT_VERSION)
            }
            _ => Docker::connect_with_unix_defaults(),
        }
        .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            inspect_timeout,
            on_inspect_timeout,
        })
    }

}

/// Pod name and namespace from a legacy kubelet container name.
fn parse_pod_identity(raw_name: &str) -> (String, String) {
    let name = raw_name.trim_start_matches('/');
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() >= 5 {
        (parts[2].to_string(), parts[3].to_string())
    } else {
        (name.to_string(), "-".to_string())
    }
}

fn build_cmdline(entrypoint: Option<Vec<String>>, cmd: Option<Vec<String>>) -> String {
    let mut parts: Vec<String> = entrypoint.unwrap_or_default();
    if let Some(cmd) = cmd {
        if !cmd.is_empty() {
            let mut joined = cmd.join(" ");
            if joined.len() > 100 {
                joined.truncate(100);
                joined.push_str("...");
            }
            parts.push(joined);
        }
    }
    parts.join(" ")
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerMeta>, RuntimeError> {
        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| RuntimeError::Backend(e.to_string()))?;

        let mut result = Vec::new();
        for summary in summaries {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let Some(full_id) = summary.id else { continue };

            let inspect = match tokio::time::timeout(
                self.inspect_timeout,
                self.client.inspect_container(&full_id, None),
            )
            .await
            {
                Err(_) => {
                    tracing::warn!(container_id = %full_id, "Container inspect timed out");
                    (self.on_inspect_timeout)(&full_id);
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::warn!(container_id = %full_id, error = %e, "Container inspect failed");
                    continue;
                }
                Ok(Ok(inspect)) => inspect,
            };

            let root_pid = inspect
                .state
                .as_ref()
                .and_then(|s| s.pid)
                .unwrap_or_default();
            if root_pid <= 0 {
                // Not running.
                continue;
            }

            let (pod_name, pod_namespace) =
                parse_pod_identity(inspect.name.as_deref().unwrap_or(&full_id));

            let cmdline = inspect
                .config
                .map(|c| build_cmdline(c.entrypoint, c.cmd))
                .unwrap_or_default();

            let created_at = inspect
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            result.push(ContainerMeta {
                id: short_id(&full_id),
                root_pid: root_pid as i32,
                pod_name,
                pod_namespace,
                cmdline,
                created_at,
                descendants: HashSet::new(),
            });
        }

        Ok(result)
    }

    async fn remove_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        tracing::info!(container_id = %id, "Removing container");

        let work = async {
            // Best-effort stop first; force-remove below handles the rest.
            let stop_opts = StopContainerOptions {
                t: timeout.as_secs() as i64,
            };
            if let Err(e) = self.client.stop_container(id, Some(stop_opts)).await {
                tracing::debug!(container_id = %id, error = %e, "Stop before remove failed");
            }

            match self
                .client
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => Ok(()),
                Err(ref e) if is_not_found(e) => {
                    tracing::debug!(container_id = %id, "Container already gone");
                    Ok(())
                }
                Err(e) => Err(RuntimeError::Backend(e.to_string())),
            }
        };

        match tokio::time::timeout(timeout, work).await {
            Err(_) => Err(RuntimeError::Timeout),
            Ok(res) => res,
        }
    }

    async fn close(&self) {
        // The engine client holds no resources beyond its connection pool.
    }
}
