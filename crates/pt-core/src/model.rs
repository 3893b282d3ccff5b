//! Resolved specification model.
//!
//! Built once by the resolver and immutable thereafter. Pod references
//! are a tagged union resolved by pattern match; groups are built only
//! after all referenced names exist, so the graph is acyclic by
//! construction.

use std::collections::HashSet;
use std::fmt;

/// A single pod identity: `podname` is a name-prefix pattern matched
/// against live pods at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinglePod {
    /// Unique name in the pod namespace.
    pub name: String,
    /// Kubernetes namespace (exact match for target resolution).
    pub namespace: String,
    /// Live pod name prefix.
    pub podname: String,
}

/// A named group of previously defined pod references.
#[derive(Debug, Clone, PartialEq)]
pub struct PodGroup {
    /// Unique name in the pod namespace.
    pub name: String,
    /// Member references, resolved at definition time.
    pub members: Vec<PodReference>,
}

/// A pod reference: a single pod or a group of references.
#[derive(Debug, Clone, PartialEq)]
pub enum PodReference {
    /// A single pod.
    Single(SinglePod),
    /// A group of references.
    Group(PodGroup),
}

impl PodReference {
    /// The reference's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            PodReference::Single(pod) => &pod.name,
            PodReference::Group(group) => &group.name,
        }
    }

    /// Flatten to the transitively reachable [`SinglePod`] leaves,
    /// de-duplicated by name, in declaration order. Diamond-shaped
    /// reference graphs collapse to one entry per leaf.
    #[must_use]
    pub fn resolve_to_pods(&self) -> Vec<&SinglePod> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect_pods(&mut out, &mut seen);
        out
    }

    fn collect_pods<'a>(&'a self, out: &mut Vec<&'a SinglePod>, seen: &mut HashSet<&'a str>) {
        match self {
            PodReference::Single(pod) => {
                if seen.insert(pod.name.as_str()) {
                    out.push(pod);
                }
            }
            PodReference::Group(group) => {
                for member in &group.members {
                    member.collect_pods(out, seen);
                }
            }
        }
    }
}

/// A named group of external (non-pod) endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroup {
    /// Unique name, distinct from the pod namespace.
    pub name: String,
    /// Hostnames/IPs, in declaration order, including endpoints
    /// expanded from referenced groups.
    pub endpoints: Vec<String>,
}

/// Probe protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// TCP (the default when a port omits its type).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// A port value: numeric or symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortValue {
    /// Numeric port.
    Number(u16),
    /// Symbolic service name.
    Name(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{n}"),
            PortValue::Name(name) => write!(f, "{name}"),
        }
    }
}

/// A destination port with its protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Port value.
    pub value: PortValue,
    /// Protocol (TCP when unspecified in the document).
    pub protocol: Protocol,
}

impl Port {
    /// Numeric TCP port shorthand.
    #[must_use]
    pub fn tcp(value: u16) -> Self {
        Self {
            value: PortValue::Number(value),
            protocol: Protocol::Tcp,
        }
    }
}

/// A probe destination: a resolved pod identity or a literal endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// A pod, looked up live at probe time.
    Pod(SinglePod),
    /// A literal hostname/IP, used verbatim.
    Address(String),
}

/// A named bundle of destinations and ports referenced by rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTarget {
    /// Unique name in the target namespace.
    pub name: String,
    /// Destinations (pods flattened, addresses expanded).
    pub destinations: Vec<Destination>,
    /// Ports to probe; empty when omitted.
    pub ports: Vec<Port>,
}

/// A named allow/deny expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Rule name (report suite name).
    pub name: String,
    /// Source pods probes run from, flattened from the `from` reference.
    pub sources: Vec<SinglePod>,
    /// Targets that must be reachable.
    pub allowed: Vec<ConnectionTarget>,
    /// Targets that must not be reachable.
    pub denied: Vec<ConnectionTarget>,
}

/// The fully resolved specification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedModel {
    /// Pod and pod-group definitions, in document order.
    pub pods: Vec<PodReference>,
    /// Address groups, in document order.
    pub addresses: Vec<AddressGroup>,
    /// Connection targets, in document order.
    pub targets: Vec<ConnectionTarget>,
    /// Rules, in document order.
    pub rules: Vec<Rule>,
}
