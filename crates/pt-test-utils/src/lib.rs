//! Scripted fake cluster for policytester tests.
//!
//! [`FakeCluster`] implements the `pt-core` cluster traits with fully
//! scripted behavior: a pod inventory, per-probe exec exit codes,
//! injectable failures, and call records for assertions.
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = FakeCluster::new();
//! cluster.add_pod(FakePodSpec::new("client-abc", "ns1"));
//! cluster.add_pod(FakePodSpec::new("server-xyz", "ns1").ip("10.96.4.7"));
//! cluster.script_exec("10.96.4.7 80", 0);
//! ```

use async_trait::async_trait;
use pt_core::cluster::{Cluster, ClusterError, ContainerSpec, ExecOutcome, PodHandle};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Record of one exec call observed by the fake cluster.
#[derive(Debug, Clone)]
pub struct ExecRecord {
    /// Pod the command ran in.
    pub pod: String,
    /// Container the command ran in.
    pub container: String,
    /// The full command.
    pub command: Vec<String>,
}

struct ContainerState {
    name: String,
    running: bool,
    /// Readiness polls remaining until the container reports running;
    /// `None` means it never becomes ready.
    polls_remaining: Option<u32>,
}

struct PodState {
    name: String,
    namespace: String,
    ip: Option<String>,
    labels: BTreeMap<String, String>,
    container: Option<ContainerState>,
}

struct ClusterState {
    pods: Vec<PodState>,
    /// Substring patterns matched against the joined exec command;
    /// `None` exit simulates a timeout.
    exec_script: Vec<(String, Option<i32>)>,
    default_exit: i32,
    ready_after_polls: Option<u32>,
    fail_injection: HashSet<String>,
    fail_label: HashSet<String>,
    injections: Vec<String>,
    deletions: Vec<String>,
    execs: Vec<ExecRecord>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            pods: Vec::new(),
            exec_script: Vec::new(),
            default_exit: 1,
            ready_after_polls: Some(0),
            fail_injection: HashSet::new(),
            fail_label: HashSet::new(),
            injections: Vec::new(),
            deletions: Vec::new(),
            execs: Vec::new(),
        }
    }
}

/// Builder for one fake pod's initial state.
pub struct FakePodSpec {
    name: String,
    namespace: String,
    ip: Option<String>,
    labels: BTreeMap<String, String>,
    container: Option<(String, bool)>,
}

impl FakePodSpec {
    /// A pod with the given live name and namespace, no IP, no labels.
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ip: None,
            labels: BTreeMap::new(),
            container: None,
        }
    }

    /// Set the pod's in-cluster address.
    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Seed the pod with a debug container, optionally already running.
    pub fn with_debug_container(mut self, name: &str, running: bool) -> Self {
        self.container = Some((name.to_string(), running));
        self
    }
}

/// Scripted in-memory cluster.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    /// An empty cluster: no pods, every exec exits 1, injected
    /// containers become ready on the first poll.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("fake cluster state lock poisoned")
    }

    /// Add a pod to the inventory.
    pub fn add_pod(&self, spec: FakePodSpec) {
        let container = spec.container.map(|(name, running)| ContainerState {
            name,
            running,
            polls_remaining: Some(0),
        });
        self.lock().pods.push(PodState {
            name: spec.name,
            namespace: spec.namespace,
            ip: spec.ip,
            labels: spec.labels,
            container,
        });
    }

    /// Exec commands whose joined text contains `pattern` exit with
    /// `exit`. Patterns are matched in registration order.
    pub fn script_exec(&self, pattern: &str, exit: i32) {
        self.lock().exec_script.push((pattern.to_string(), Some(exit)));
    }

    /// Exec commands whose joined text contains `pattern` time out.
    pub fn script_exec_timeout(&self, pattern: &str) {
        self.lock().exec_script.push((pattern.to_string(), None));
    }

    /// Exit code for unscripted exec commands (default 1).
    pub fn set_default_exit(&self, exit: i32) {
        self.lock().default_exit = exit;
    }

    /// Injected containers report running after this many readiness
    /// polls (default 0: ready at the first poll).
    pub fn set_ready_after_polls(&self, polls: u32) {
        self.lock().ready_after_polls = Some(polls);
    }

    /// Injected containers never report running.
    pub fn set_never_ready(&self) {
        self.lock().ready_after_polls = None;
    }

    /// Make `create_ephemeral_container` fail for the named pod.
    pub fn fail_injection(&self, pod: &str) {
        self.lock().fail_injection.insert(pod.to_string());
    }

    /// Make `label` fail for the named pod.
    pub fn fail_label(&self, pod: &str) {
        self.lock().fail_label.insert(pod.to_string());
    }

    /// Pods that received a debug container injection, in order.
    pub fn injections(&self) -> Vec<String> {
        self.lock().injections.clone()
    }

    /// Pods deleted, in order.
    pub fn deletions(&self) -> Vec<String> {
        self.lock().deletions.clone()
    }

    /// Every exec call observed, in order.
    pub fn execs(&self) -> Vec<ExecRecord> {
        self.lock().execs.clone()
    }

    /// Current labels of the named pod, if it exists.
    pub fn pod_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .pods
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.labels.clone())
    }

    /// Names of pods still in the inventory.
    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.iter().map(|p| p.name.clone()).collect()
    }
}

/// A pod handle over the fake cluster: sync accessors serve the
/// snapshot taken at list time, async operations hit the shared state.
#[derive(Clone)]
pub struct FakePod {
    name: String,
    namespace: String,
    ip: Option<String>,
    labels: BTreeMap<String, String>,
    container: Option<(String, bool)>,
    state: Arc<Mutex<ClusterState>>,
}

impl FakePod {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("fake cluster state lock poisoned")
    }
}

#[async_trait]
impl PodHandle for FakePod {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }

    fn cluster_ip(&self) -> Option<String> {
        self.ip.clone()
    }

    fn has_ephemeral_container(&self, container: &str) -> bool {
        self.container.as_ref().is_some_and(|(name, _)| name == container)
    }

    fn ephemeral_container_running(&self, container: &str) -> bool {
        self.container
            .as_ref()
            .is_some_and(|(name, running)| name == container && *running)
    }

    async fn is_ephemeral_container_running(
        &self,
        container: &str,
    ) -> Result<bool, ClusterError> {
        let mut state = self.lock();
        let Some(pod) = state.pods.iter_mut().find(|p| p.name == self.name) else {
            return Err(ClusterError::NotFound(self.name.clone()));
        };
        let Some(c) = pod.container.as_mut().filter(|c| c.name == container) else {
            return Ok(false);
        };
        if c.running {
            return Ok(true);
        }
        match c.polls_remaining {
            Some(0) => {
                c.running = true;
                Ok(true)
            }
            Some(n) => {
                c.polls_remaining = Some(n - 1);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn label(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        if state.fail_label.contains(&self.name) {
            return Err(ClusterError::Api(format!(
                "scripted label failure for pod {}",
                self.name
            )));
        }
        let Some(pod) = state.pods.iter_mut().find(|p| p.name == self.name) else {
            return Err(ClusterError::NotFound(self.name.clone()));
        };
        pod.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn create_ephemeral_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        if state.fail_injection.contains(&self.name) {
            return Err(ClusterError::ContainerInjection {
                pod: self.name.clone(),
                reason: "scripted injection failure".to_string(),
            });
        }
        state.injections.push(self.name.clone());
        let polls = state.ready_after_polls;
        let Some(pod) = state.pods.iter_mut().find(|p| p.name == self.name) else {
            return Err(ClusterError::NotFound(self.name.clone()));
        };
        pod.container = Some(ContainerState {
            name: spec.name.clone(),
            running: false,
            polls_remaining: polls,
        });
        Ok(())
    }

    async fn exec(
        &self,
        command: &[String],
        container: &str,
        _timeout: Duration,
    ) -> Result<ExecOutcome, ClusterError> {
        let mut state = self.lock();
        state.execs.push(ExecRecord {
            pod: self.name.clone(),
            container: container.to_string(),
            command: command.to_vec(),
        });
        let joined = command.join(" ");
        let exit = state
            .exec_script
            .iter()
            .find(|(pattern, _)| joined.contains(pattern))
            .map_or(Some(state.default_exit), |(_, exit)| *exit);
        Ok(ExecOutcome {
            exit_status: exit,
            output: format!("exec [{joined}] -> {exit:?}"),
        })
    }

    async fn delete(&self) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.pods.retain(|p| p.name != self.name);
        state.deletions.push(self.name.clone());
        Ok(())
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    type Pod = FakePod;

    async fn find_pods(&self, namespace: Option<&str>) -> Result<Vec<FakePod>, ClusterError> {
        let state = self.lock();
        Ok(state
            .pods
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
            .map(|p| FakePod {
                name: p.name.clone(),
                namespace: p.namespace.clone(),
                ip: p.ip.clone(),
                labels: p.labels.clone(),
                container: p
                    .container
                    .as_ref()
                    .map(|c| (c.name.clone(), c.running)),
                state: Arc::clone(&self.state),
            })
            .collect())
    }
}
