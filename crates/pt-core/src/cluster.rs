//! Cluster-access trait boundary.
//!
//! The orchestrator drives a cluster through these traits so it can run
//! against a real cluster (the `pt-kube` crate) or a scripted fake (the
//! `pt-test-utils` crate). Sync accessors read the snapshot taken when
//! the pod was listed; [`PodHandle::is_ephemeral_container_running`]
//! re-checks live state.

use crate::model::{PortValue, Protocol};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Cluster API failures surfaced to the orchestrator.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Generic cluster API failure.
    #[error("cluster API error: {0}")]
    Api(String),

    /// A pod could not be found.
    #[error("pod not found: {0}")]
    NotFound(String),

    /// Ephemeral debug container injection failed.
    #[error("failed to inject debug container into pod {pod}: {reason}")]
    ContainerInjection {
        /// Live pod name.
        pod: String,
        /// Failure detail.
        reason: String,
    },

    /// Remote command execution failed before producing an exit status.
    #[error("exec in pod {pod} failed: {reason}")]
    Exec {
        /// Live pod name.
        pod: String,
        /// Failure detail.
        reason: String,
    },
}

/// The ephemeral debug container injected into source pods, plus the
/// per-protocol probe command templates.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (also used to recognize already-instrumented pods).
    pub name: String,
    /// Container image.
    pub image: String,
    /// Startup command keeping the container alive.
    pub command: Vec<String>,
    /// TCP probe template with `{host}`/`{port}` placeholders.
    pub tcp_check_command: String,
    /// UDP probe template with `{host}`/`{port}` placeholders.
    pub udp_check_command: String,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            name: "policytester-debug".to_string(),
            image: "nicolaka/netshoot".to_string(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 1000000".to_string(),
            ],
            tcp_check_command: "nc -z -w 5 {host} {port}".to_string(),
            udp_check_command: "nc -z -u -w 5 {host} {port}".to_string(),
        }
    }
}

impl ContainerSpec {
    /// Render the probe command for one destination.
    #[must_use]
    pub fn probe_command(&self, protocol: Protocol, host: &str, port: &PortValue) -> Vec<String> {
        let template = match protocol {
            Protocol::Tcp => &self.tcp_check_command,
            Protocol::Udp => &self.udp_check_command,
        };
        let rendered = template
            .replace("{host}", host)
            .replace("{port}", &port.to_string());
        vec!["sh".to_string(), "-c".to_string(), rendered]
    }
}

/// Result of a remote exec: `exit_status` is `None` when the command
/// timed out.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Exit status, `None` on timeout.
    pub exit_status: Option<i32>,
    /// Combined stdout/stderr text.
    pub output: String,
}

impl ExecOutcome {
    /// Whether the command ran and exited zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// A live pod as seen through the cluster-access layer.
#[async_trait]
pub trait PodHandle: Clone + Send + Sync {
    /// Live pod name.
    fn name(&self) -> &str;

    /// Pod namespace.
    fn namespace(&self) -> &str;

    /// Pod labels (snapshot).
    fn labels(&self) -> BTreeMap<String, String>;

    /// The pod's routable in-cluster address at snapshot time, if it
    /// has one. Pod addresses can change across restarts; callers
    /// resolve them freshly per run.
    fn cluster_ip(&self) -> Option<String>;

    /// Whether the snapshot shows an ephemeral container named
    /// `container`, in any state.
    fn has_ephemeral_container(&self, container: &str) -> bool;

    /// Whether the snapshot shows the ephemeral container running.
    fn ephemeral_container_running(&self, container: &str) -> bool;

    /// Re-check live state: is the ephemeral container running now?
    async fn is_ephemeral_container_running(&self, container: &str)
        -> Result<bool, ClusterError>;

    /// Add or overwrite one label on the live pod.
    async fn label(&self, key: &str, value: &str) -> Result<(), ClusterError>;

    /// Inject the ephemeral debug container.
    async fn create_ephemeral_container(&self, spec: &ContainerSpec) -> Result<(), ClusterError>;

    /// Execute `command` synchronously inside `container`, bounded by
    /// `timeout`.
    async fn exec(
        &self,
        command: &[String],
        container: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome, ClusterError>;

    /// Delete the live pod.
    async fn delete(&self) -> Result<(), ClusterError>;
}

/// Pod listing entry point.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// The pod handle type this cluster produces.
    type Pod: PodHandle;

    /// List live pods, optionally restricted to one namespace.
    async fn find_pods(&self, namespace: Option<&str>) -> Result<Vec<Self::Pod>, ClusterError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_command_substitutes_placeholders() {
        let spec = ContainerSpec::default();
        let cmd = spec.probe_command(Protocol::Tcp, "10.0.0.1", &PortValue::Number(80));
        assert_eq!(cmd, vec!["sh", "-c", "nc -z -w 5 10.0.0.1 80"]);
        let cmd = spec.probe_command(Protocol::Udp, "dns.local", &PortValue::Name("domain".to_string()));
        assert_eq!(cmd, vec!["sh", "-c", "nc -z -u -w 5 dns.local domain"]);
    }

    #[test]
    fn test_exec_outcome_success() {
        assert!(ExecOutcome { exit_status: Some(0), output: String::new() }.succeeded());
        assert!(!ExecOutcome { exit_status: Some(1), output: String::new() }.succeeded());
        assert!(!ExecOutcome { exit_status: None, output: String::new() }.succeeded());
    }
}
