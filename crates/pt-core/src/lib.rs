//! Core library for policytester: verifies that a Kubernetes cluster's
//! network policies behave as declared.
//!
//! A human-authored YAML document of pods, address groups, connection
//! targets, and allow/deny rules is resolved into an immutable object
//! graph ([`resolver`]), then live connectivity probes are executed from
//! instrumented source pods against the declared targets
//! ([`orchestrator`]), producing a hierarchical pass/fail report
//! ([`report`]).
//!
//! Cluster access is abstracted behind the [`cluster`] traits so the
//! orchestrator can be driven against a real cluster (see the `pt-kube`
//! crate) or a scripted fake (see `pt-test-utils`).

#![warn(clippy::pedantic)]

/// Module for the cluster-access trait boundary and debug container spec
pub mod cluster;

/// Module for the typed, line-annotated document tree
pub mod doc;

/// Module for error types
pub mod errors;

/// Module for the line-tracking YAML loader
pub mod loader;

/// Module for the resolved specification model
pub mod model;

/// Module for the test orchestration engine
pub mod orchestrator;

/// Module for pass/fail/timing report bookkeeping
pub mod report;

/// Module for specification resolution and referential validation
pub mod resolver;

/// Module for schema validation and source-line error contextualization
pub mod schema;
