//! containerd-compatible runtime adapter.
//!
//! All calls are scoped to the `k8s.io` namespace. Pod identity comes from
//! the standard pod labels; containers without a running task are skipped.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    DeleteContainerRequest, DeleteTaskRequest, GetRequest, KillRequest, ListContainersRequest,
};
use containerd_client::tonic::transport::Channel;
use containerd_client::tonic::{Code, Request};
use containerd_client::{tonic, with_namespace};
use tokio_util::sync::CancellationToken;

use super::{short_id, ContainerMeta, ContainerRuntime, InspectTimeoutCallback, RuntimeError};

const SOCKET: &str = "/run/containerd/containerd.sock";
const NAMESPACE: &str = "k8s.io";

const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

pub struct ContainerdRuntime {
    channel: Channel,
    inspect_timeout: Duration,
    on_inspect_timeout: InspectTimeoutCallback,
}

impl ContainerdRuntime {
    pub async fn connect(
        inspect_timeout: Duration,
        on_inspect_timeout: InspectTimeoutCallback,
    ) -> Result<Self, RuntimeError> {
        let channel = containerd_client::connect(SOCKET)
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(Self {
            channel,
            inspect_timeout,
            on_inspect_timeout,
        })
    }

    /// Root pid of the container's task, under the inspect deadline.
    async fn task_pid(&self, container_id: &str) -> Option<i32> {
        let mut tasks = TasksClient::new(self.channel.clone());
        let req = GetRequest {
            container_id: container_id.to_string(),
            exec_id: String::new(),
        };
        let req = with_namespace!(req, NAMESPACE);

        match tokio::time::timeout(self.inspect_timeout, tasks.get(req)).await {
            Err(_) => {
                tracing::warn!(container_id = %container_id, "Task inspect timed out");
                (self.on_inspect_timeout)(container_id);
                None
            }
            Ok(Err(status)) => {
                if status.code() == Code::NotFound {
                    tracing::debug!(container_id = %container_id, "Container has no running task");
                } else {
                    tracing::warn!(
                        container_id = %container_id,
                        error = %status,
                        "Task inspect failed"
                    );
                }
                None
            }
            Ok(Ok(resp)) => resp
                .into_inner()
                .process
                .map(|p| p.pid as i32)
                .filter(|pid| *pid > 0),
        }
    }
}

/// Pod identity from the standard kubelet labels, with the documented
/// fallbacks for unlabeled containers.
fn pod_identity(labels: &HashMap<String, String>, container_id: &str) -> (String, String) {
    let pod_name = labels
        .get(POD_NAME_LABEL)
        .cloned()
        .unwrap_or_else(|| container_id.to_string());
    let pod_namespace = labels
        .get(POD_NAMESPACE_LABEL)
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    (pod_name, pod_namespace)
}

/// Join `process.args` out of an OCI runtime spec document.
fn oci_process_args(spec_json: &[u8]) -> Option<String> {
    let spec: serde_json::Value = serde_json::from_slice(spec_json).ok()?;
    let args = spec.get("process")?.get("args")?.as_array()?;
    let parts: Vec<&str> = args.iter().filter_map(|a| a.as_str()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[async_trait]
impl ContainerRuntime for ContainerdRuntime {
    async fn list_containers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerMeta>, RuntimeError> {
        let mut containers = ContainersClient::new(self.channel.clone());
        let req = ListContainersRequest::default();
        let req = with_namespace!(req, NAMESPACE);

        let listed = containers
            .list(req)
            .await
            .map_err(|e| RuntimeError::Backend(e.to_string()))?
            .into_inner()
            .containers;

        let mut result = Vec::new();
        for container in listed {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            let Some(root_pid) = self.task_pid(&container.id).await else {
                continue;
            };

            let (pod_name, pod_namespace) = pod_identity(&container.labels, &container.id);

            let cmdline = container
                .spec
                .as_ref()
                .and_then(|any| oci_process_args(&any.value))
                .unwrap_or_default();

            let created_at = container
                .created_at
                .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos as u32))
                .unwrap_or_else(Utc::now);

            result.push(ContainerMeta {
                id: short_id(&container.id),
                root_pid,
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
            let mut tasks = TasksClient::new(self.channel.clone());

            // Kill the task and everything in it, then delete it. Failures
            // here are tolerable: the container delete is what matters.
            let kill = KillRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
                signal: 9,
                all: true,
            };
            if let Err(status) = tasks.kill(with_namespace!(kill, NAMESPACE)).await {
                tracing::debug!(container_id = %id, error = %status, "Task kill failed");
            }

            let del_task = DeleteTaskRequest {
                container_id: id.to_string(),
            };
            if let Err(status) = tasks.delete(with_namespace!(del_task, NAMESPACE)).await {
                tracing::debug!(container_id = %id, error = %status, "Task delete failed");
            }

            let mut containers = ContainersClient::new(self.channel.clone());
            let del = DeleteContainerRequest { id: id.to_string() };
            match containers.delete(with_namespace!(del, NAMESPACE)).await {
                Ok(_) => Ok(()),
                Err(status) if status.code() == Code::NotFound => {
                    tracing::debug!(container_id = %id, "Container already gone");
                    Ok(())
                }
                Err(status) => Err(RuntimeError::Backend(status.to_string())),
            }
        };

        match tokio::time::timeout(timeout, work).await {
            Err(_) => Err(RuntimeError::Timeout),
            Ok(res) => res,
        }
    }

    async fn close(&self) {
        // Dropping the channel tears down the connection.
    }
}
