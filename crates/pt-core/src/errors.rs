//! Error types for policytester runs.
//!
//! Validation errors are accumulated by the resolver, never raised; the
//! variants here are the fatal conditions that abort a run, plus the
//! cluster-API failures propagated through the orchestrator.

use crate::cluster::ClusterError;
use thiserror::Error;

/// Fatal run errors.
#[derive(Debug, Error)]
pub enum PtError {
    /// The specification did not resolve cleanly; orchestration must
    /// not start.
    #[error("specification invalid: {0} validation error(s)")]
    InvalidSpec(usize),

    /// No live pod matches a source pod reference.
    #[error("no eligible pod found for source '{0}'")]
    NoEligiblePod(String),

    /// No live pod matches a target pod reference at probe time.
    #[error("no running pod found for target '{name}' in namespace '{namespace}'")]
    TargetPodNotFound {
        /// Target reference name.
        name: String,
        /// Expected namespace.
        namespace: String,
    },

    /// A live target pod has no routable address.
    #[error("pod '{0}' has no routable in-cluster address")]
    NoPodAddress(String),

    /// Cluster API failure outside an individual probe.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Result type alias using [`PtError`].
pub type Result<T> = std::result::Result<T, PtError>;
