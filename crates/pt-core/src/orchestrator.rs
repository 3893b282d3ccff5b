//! Test orchestration engine.
//!
//! Consumes the resolved model plus a cluster handle and drives a run
//! through its phases: provision debug capability on the needed source
//! pods (idempotently), wait for readiness under a timeout, execute the
//! allow/deny probe matrix in declaration order, and clean up.
//!
//! # Graceful Shutdown
//!
//! The run honors a cancellation token: the readiness wait and the
//! probe loop stop issuing new work when the token trips, and the
//! caller can still unwind to [`PolicyTester::cleanup`].

use crate::cluster::{Cluster, ContainerSpec, PodHandle};
use crate::errors::{PtError, Result};
use crate::model::{ConnectionTarget, Destination, Port, ResolvedModel, Rule, SinglePod};
use crate::report::TestReport;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Label key marking pods this tool instrumented.
pub const DEFAULT_LABEL_KEY: &str = "policytester.io/instrumented";

/// Label value marking pods this tool instrumented.
pub const DEFAULT_LABEL_VALUE: &str = "true";

/// Readiness poll granularity.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-probe exec timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run phase, advanced by the orchestration entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has run yet.
    Idle,
    /// Source pods are provisioned.
    Prepared,
    /// Every provisioned pod reported its debug container running.
    Ready,
    /// The readiness wait expired with pods still not ready.
    TimedOut,
    /// The probe matrix has executed.
    Tested,
    /// Instrumented pods have been deleted.
    CleanedUp,
}

/// Orchestrates one test run against a cluster.
///
/// Holds a read-only reference to the resolved model and owns the
/// mutable [`TestReport`] exclusively for the duration of the run.
pub struct PolicyTester<'a, C: Cluster> {
    model: &'a ResolvedModel,
    cluster: C,
    debug_container: ContainerSpec,
    label_key: String,
    label_value: String,
    /// When set, pod listing is restricted to this namespace.
    namespace: Option<String>,
    probe_timeout: Duration,
    cancel: CancellationToken,
    phase: Phase,
    /// Source references whose debug container injection failed; their
    /// probes are reported as failed with an `UNTESTED:` marker instead
    /// of being silently omitted.
    untested: HashSet<String>,
    report: TestReport,
}

impl<'a, C: Cluster> PolicyTester<'a, C> {
    /// Create an orchestrator over `model` and `cluster`.
    pub fn new(model: &'a ResolvedModel, cluster: C, debug_container: ContainerSpec) -> Self {
        Self {
            model,
            cluster,
            debug_container,
            label_key: DEFAULT_LABEL_KEY.to_string(),
            label_value: DEFAULT_LABEL_VALUE.to_string(),
            namespace: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            cancel: CancellationToken::new(),
            phase: Phase::Idle,
            untested: HashSet::new(),
            report: TestReport::default(),
        }
    }

    /// Override the instrumentation label.
    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.label_key = key.to_string();
        self.label_value = value.to_string();
        self
    }

    /// Restrict pod listing to one namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Override the per-probe exec timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Attach a run-level cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current run phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The report accumulated so far.
    #[must_use]
    pub fn report(&self) -> &TestReport {
        &self.report
    }

    /// Consume the orchestrator, handing over the report.
    #[must_use]
    pub fn into_report(self) -> TestReport {
        self.report
    }

    /// The union of every rule's source pods, de-duplicated, in
    /// declaration order.
    fn source_pods(&self) -> Vec<&'a SinglePod> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for rule in &self.model.rules {
            for source in &rule.sources {
                if seen.insert(source.name.as_str()) {
                    out.push(source);
                }
            }
        }
        out
    }

    /// Resolve a source reference to the live pod probes should run
    /// from: prefer a candidate with the debug container running, then
    /// one carrying it in any state, then the first name-prefix match.
    fn find_eligible_pod<'p>(
        source: &SinglePod,
        pods: &'p [C::Pod],
        container: &str,
    ) -> Option<&'p C::Pod> {
        let candidates: Vec<&C::Pod> = pods
            .iter()
            .filter(|pod| pod.name().starts_with(source.podname.as_str()))
            .collect();
        let instrumented: Vec<&C::Pod> = candidates
            .iter()
            .copied()
            .filter(|pod| pod.has_ephemeral_container(container))
            .collect();
        if let Some(running) = instrumented
            .iter()
            .copied()
            .find(|pod| pod.ephemeral_container_running(container))
        {
            return Some(running);
        }
        instrumented
            .first()
            .copied()
            .or_else(|| candidates.first().copied())
    }

    /// Provision the debug container on every source pod that needs it.
    ///
    /// Idempotent: pods already carrying a debug container of the
    /// expected name are left untouched. Pods whose injection fails are
    /// skipped and marked untested rather than aborting the run.
    ///
    /// # Errors
    ///
    /// [`PtError::NoEligiblePod`] when no live pod matches a source
    /// reference; [`PtError::Cluster`] when pod listing fails.
    pub async fn prepare(&mut self) -> Result<Vec<C::Pod>> {
        info!("gathering source pods");
        let sources = self.source_pods();
        let all_pods = self.cluster.find_pods(self.namespace.as_deref()).await?;
        let mut prepared = Vec::new();

        for source in sources {
            let Some(pod) =
                Self::find_eligible_pod(source, &all_pods, &self.debug_container.name)
            else {
                error!(
                    source = %source.name,
                    podname = %source.podname,
                    "no eligible pod for source reference"
                );
                return Err(PtError::NoEligiblePod(source.name.clone()));
            };
            debug!(source = %source.name, pod = %pod.name(), "eligible pod");

            if pod.has_ephemeral_container(&self.debug_container.name) {
                debug!(pod = %pod.name(), "debug container already present");
            } else {
                info!(
                    pod = %pod.name(),
                    namespace = %pod.namespace(),
                    container = %self.debug_container.name,
                    "injecting debug container"
                );
                let injected = async {
                    pod.label(&self.label_key, &self.label_value).await?;
                    pod.create_ephemeral_container(&self.debug_container).await
                }
                .await;
                if let Err(err) = injected {
                    warn!(
                        pod = %pod.name(),
                        error = %err,
                        "debug container injection failed, probes from this source will be reported as untested"
                    );
                    self.untested.insert(source.name.clone());
                    continue;
                }
            }
            prepared.push(pod.clone());
        }

        self.phase = Phase::Prepared;
        Ok(prepared)
    }

    /// Poll at 1-second granularity until every pod's debug container
    /// is running, the timeout expires, or the run is cancelled.
    /// Returns the pods still not ready.
    ///
    /// Advisory: callers may proceed to [`PolicyTester::test`] with a
    /// non-empty remainder, but probes from a not-ready pod fail
    /// deterministically.
    pub async fn wait_until_ready(&mut self, pods: Vec<C::Pod>, timeout: Duration) -> Vec<C::Pod> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending = pods;
        let mut interval = tokio::time::interval(READINESS_POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !pending.is_empty() {
            tokio::select! {
                _ = interval.tick() => {
                    let mut still_pending = Vec::new();
                    for pod in pending {
                        match pod
                            .is_ephemeral_container_running(&self.debug_container.name)
                            .await
                        {
                            Ok(true) => debug!(pod = %pod.name(), "debug container running"),
                            Ok(false) => still_pending.push(pod),
                            Err(err) => {
                                warn!(pod = %pod.name(), error = %err, "readiness check failed");
                                still_pending.push(pod);
                            }
                        }
                    }
                    pending = still_pending;
                    for pod in &pending {
                        debug!(pod = %pod.name(), "not ready");
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                }
                () = self.cancel.cancelled() => {
                    info!("readiness wait cancelled");
                    break;
                }
            }
        }

        self.phase = if pending.is_empty() {
            Phase::Ready
        } else {
            warn!(not_ready = pending.len(), "readiness wait ended with pods not ready");
            Phase::TimedOut
        };
        pending
    }

    /// Execute the probe matrix: for every rule, every (source pod ×
    /// target × port) triple of `allowed` expecting success, then of
    /// `denied` expecting failure, in declaration order.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: pod listing failure, a vanished source
    /// pod, or a missing target pod. Probe mismatches are recorded in
    /// the report, never raised.
    pub async fn test(&mut self) -> Result<&TestReport> {
        let model = self.model;
        let all_pods = self.cluster.find_pods(self.namespace.as_deref()).await?;

        for rule in &model.rules {
            info!(rule = %rule.name, "RULE");
            self.report.start_suite(&rule.name);
            self.test_rule(rule, true, &all_pods).await?;
            self.test_rule(rule, false, &all_pods).await?;
            self.report.end_suite();
            if self.cancel.is_cancelled() {
                warn!("run cancelled, skipping remaining rules");
                break;
            }
        }

        self.report.finish();
        self.phase = Phase::Tested;
        Ok(&self.report)
    }

    async fn test_rule(
        &mut self,
        rule: &Rule,
        expect_allowed: bool,
        all_pods: &[C::Pod],
    ) -> Result<()> {
        let targets: &[ConnectionTarget] = if expect_allowed {
            &rule.allowed
        } else {
            &rule.denied
        };

        for source in &rule.sources {
            let Some(pod) =
                Self::find_eligible_pod(source, all_pods, &self.debug_container.name)
            else {
                error!(source = %source.name, "source pod disappeared before testing");
                return Err(PtError::NoEligiblePod(source.name.clone()));
            };
            let untested = self.untested.contains(&source.name);

            for target in targets {
                for destination in &target.destinations {
                    let address = Self::destination_address(destination, all_pods)?;
                    for port in &target.ports {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        self.probe(pod, &address, target, port, expect_allowed, untested)
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// The address a probe should be aimed at: the live pod's current
    /// in-cluster address for pod destinations, resolved from the
    /// listing taken at the start of this run, or the literal endpoint
    /// string.
    fn destination_address(destination: &Destination, all_pods: &[C::Pod]) -> Result<String> {
        match destination {
            Destination::Pod(target_pod) => {
                let live = all_pods.iter().find(|pod| {
                    pod.namespace() == target_pod.namespace
                        && pod.name().starts_with(target_pod.podname.as_str())
                });
                let Some(live) = live else {
                    return Err(PtError::TargetPodNotFound {
                        name: target_pod.name.clone(),
                        namespace: target_pod.namespace.clone(),
                    });
                };
                live.cluster_ip()
                    .ok_or_else(|| PtError::NoPodAddress(live.name().to_string()))
            }
            Destination::Address(address) => Ok(address.clone()),
        }
    }

    async fn probe(
        &mut self,
        pod: &C::Pod,
        address: &str,
        target: &ConnectionTarget,
        port: &Port,
        expect_allowed: bool,
        untested: bool,
    ) {
        let case_name = format!(
            "{} -> {} {}:{}/{} {}",
            pod.name(),
            target.name,
            address,
            port.value,
            port.protocol,
            if expect_allowed { "allowed" } else { "denied" },
        );
        self.report.start_case(&case_name);

        if untested {
            warn!(case = %case_name, "UNTESTED (debug container injection failed)");
            self.report.end_case(
                false,
                format!(
                    "UNTESTED: debug container injection failed for source pod matching '{}'",
                    pod.name()
                ),
            );
            return;
        }

        let command = self
            .debug_container
            .probe_command(port.protocol, address, &port.value);
        let (actual, output) = match pod
            .exec(&command, &self.debug_container.name, self.probe_timeout)
            .await
        {
            Ok(outcome) => {
                if outcome.exit_status.is_none() {
                    warn!(case = %case_name, "probe timed out");
                }
                (outcome.succeeded(), outcome.output)
            }
            Err(err) => {
                // A single probe's exec error means the connection did
                // not succeed; it never aborts the run.
                warn!(case = %case_name, error = %err, "probe exec error");
                (false, err.to_string())
            }
        };

        let ok = actual == expect_allowed;
        if ok {
            info!(case = %case_name, "PASS");
        } else {
            warn!(
                case = %case_name,
                actual,
                expected = expect_allowed,
                "FAIL"
            );
        }
        self.report.end_case(ok, output);
    }

    /// Delete every pod carrying the instrumentation label with the
    /// expected value. Safe to call without a prior
    /// [`PolicyTester::prepare`].
    ///
    /// # Errors
    ///
    /// [`PtError::Cluster`] when listing or deletion fails.
    pub async fn cleanup(&mut self) -> Result<usize> {
        let pods = self.cluster.find_pods(self.namespace.as_deref()).await?;
        let mut deleted = 0;
        for pod in pods {
            if pod.labels().get(&self.label_key) == Some(&self.label_value) {
                info!(
                    pod = %pod.name(),
                    namespace = %pod.namespace(),
                    "deleting instrumented pod"
                );
                pod.delete().await?;
                deleted += 1;
            }
        }
        self.phase = Phase::CleanedUp;
        Ok(deleted)
    }
}
