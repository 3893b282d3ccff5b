//! kube-rs implementation of the policytester cluster boundary.
//!
//! Maps the `pt-core` traits onto the Kubernetes API: pod listing,
//! label patching, ephemeral-container injection via the
//! `ephemeralcontainers` subresource, websocket exec with a wall-clock
//! timeout, and pod deletion.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use serde_json::Value;
use kube::Client;
use pt_core::cluster::{Cluster, ClusterError, ContainerSpec, ExecOutcome, PodHandle};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// A cluster reached through the local kubeconfig or in-cluster
/// service account.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using the environment's default configuration.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Api`] when no usable configuration is found.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Api(format!("failed to create client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    type Pod = KubePod;

    async fn find_pods(&self, namespace: Option<&str>) -> Result<Vec<KubePod>, ClusterError> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Api(format!("pod list failed: {e}")))?;
        debug!(count = pods.items.len(), "listed pods");
        Ok(pods
            .items
            .into_iter()
            .map(|pod| KubePod {
                pod,
                client: self.client.clone(),
            })
            .collect())
    }
}

/// A live pod plus the client needed to operate on it.
#[derive(Clone)]
pub struct KubePod {
    pod: Pod,
    client: Client,
}

impl KubePod {
    fn api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), self.namespace())
    }

    fn ephemeral_status<'a>(
        pod: &'a Pod,
        container: &str,
    ) -> Option<&'a k8s_openapi::api::core::v1::ContainerStatus> {
        pod.status
            .as_ref()
            .and_then(|s| s.ephemeral_container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|s| s.name == container))
    }

    fn status_running(
        status: Option<&k8s_openapi::api::core::v1::ContainerStatus>,
    ) -> bool {
        status
            .and_then(|s| s.state.as_ref())
            .and_then(|state| state.running.as_ref())
            .is_some()
    }
}

/// Recover the remote command's exit code from the exec channel status,
/// serialized to its wire form: `Success` means 0, a `Failure` carries
/// the code in an `ExitCode` cause.
fn exit_code(status: &Value) -> i32 {
    if status.get("status").and_then(Value::as_str) == Some("Success") {
        return 0;
    }
    status
        .get("details")
        .and_then(|d| d.get("causes"))
        .and_then(Value::as_array)
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.get("reason").and_then(Value::as_str) == Some("ExitCode"))
        })
        .and_then(|c| c.get("message"))
        .and_then(Value::as_str)
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

async fn read_all(stream: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        warn!(error = %e, "exec stream read failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl PodHandle for KubePod {
    fn name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or("")
    }

    fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or("default")
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.pod.metadata.labels.clone().unwrap_or_default()
    }

    fn cluster_ip(&self) -> Option<String> {
        self.pod.status.as_ref().and_then(|s| s.pod_ip.clone())
    }

    fn has_ephemeral_container(&self, container: &str) -> bool {
        Self::ephemeral_status(&self.pod, container).is_some()
    }

    fn ephemeral_container_running(&self, container: &str) -> bool {
        Self::status_running(Self::ephemeral_status(&self.pod, container))
    }

    async fn is_ephemeral_container_running(
        &self,
        container: &str,
    ) -> Result<bool, ClusterError> {
        let pod = self
            .api()
            .get(self.name())
            .await
            .map_err(|e| ClusterError::Api(format!("pod get failed: {e}")))?;
        Ok(Self::status_running(Self::ephemeral_status(&pod, container)))
    }

    async fn label(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        let patch = serde_json::json!({"metadata": {"labels": {key: value}}});
        self.api()
            .patch(self.name(), &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|e| ClusterError::Api(format!("label patch failed: {e}")))?;
        Ok(())
    }

    async fn create_ephemeral_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<(), ClusterError> {
        let container = EphemeralContainer {
            name: spec.name.clone(),
            image: Some(spec.image.clone()),
            command: Some(spec.command.clone()),
            ..EphemeralContainer::default()
        };
        let patch = serde_json::json!({"spec": {"ephemeralContainers": [container]}});
        self.api()
            .patch_ephemeral_containers(
                self.name(),
                &PatchParams::default(),
                &Patch::Strategic(patch),
            )
            .await
            .map_err(|e| ClusterError::ContainerInjection {
                pod: self.name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn exec(
        &self,
        command: &[String],
        container: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome, ClusterError> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .api()
            .exec(self.name(), command.to_vec(), &params)
            .await
            .map_err(|e| ClusterError::Exec {
                pod: self.name().to_string(),
                reason: e.to_string(),
            })?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let collect = async move {
            let (out, err) = tokio::join!(read_all(stdout), read_all(stderr));
            let status = match status {
                Some(fut) => fut
                    .await
                    .and_then(|s| serde_json::to_value(&s).ok()),
                None => None,
            };
            let mut output = out;
            output.push_str(&err);
            (status, output)
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok((status, output)) => {
                let exit_status = match status {
                    Some(status) => Some(exit_code(&status)),
                    // The channel closed without a status; the command
                    // did not complete normally.
                    None => Some(1),
                };
                Ok(ExecOutcome {
                    exit_status,
                    output,
                })
            }
            Err(_) => {
                warn!(pod = %self.name(), "exec timed out, closing connection");
                Ok(ExecOutcome {
                    exit_status: None,
                    output: String::new(),
                })
            }
        }
    }

    async fn delete(&self) -> Result<(), ClusterError> {
        self.api()
            .delete(self.name(), &DeleteParams::default())
            .await
            .map_err(|e| ClusterError::Api(format!("pod delete failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exit_code_success_is_zero() {
        let status = json!({"status": "Success", "metadata": {}});
        assert_eq!(exit_code(&status), 0);
    }

    #[test]
    fn test_exit_code_recovered_from_cause() {
        let status = json!({
            "status": "Failure",
            "reason": "NonZeroExitCode",
            "message": "command terminated with non-zero exit code",
            "details": {
                "causes": [
                    {"reason": "ExitCode", "message": "3"}
                ]
            }
        });
        assert_eq!(exit_code(&status), 3);
    }

    #[test]
    fn test_exit_code_defaults_to_one_on_opaque_failure() {
        let status = json!({"status": "Failure"});
        assert_eq!(exit_code(&status), 1);
    }
}
