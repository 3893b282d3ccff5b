//! Specification resolver.
//!
//! Turns a line-annotated document into the immutable [`ResolvedModel`],
//! accumulating every schema and referential violation into one flat
//! error list. The pass never aborts: an entry with a structural error
//! is excluded from the model and treated as absent, so later
//! references to it get their own "unknown reference" error.
//!
//! Definitions are processed in document order; forward references are
//! errors, which makes the reference graph acyclic by construction.

use crate::doc::{DocNode, PathSeg};
use crate::model::{
    AddressGroup, ConnectionTarget, Destination, PodGroup, PodReference, Port, PortValue,
    Protocol, ResolvedModel, Rule, SinglePod,
};
use crate::schema::{self, ValidationError};
use std::collections::{HashMap, HashSet};

/// Namespace under which a single pod lands when the document omits it.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resolve `doc` into a model plus the complete list of violations.
///
/// A non-empty error list must block orchestration; the model returned
/// alongside errors contains every entry that resolved cleanly.
#[must_use]
pub fn resolve(doc: &DocNode) -> (ResolvedModel, Vec<ValidationError>) {
    let mut errors = schema::validate_schema(doc);
    let mut ns = Namespaces::default();
    resolve_pods(doc, &mut ns, &mut errors);
    resolve_addresses(doc, &mut ns, &mut errors);
    // Both section spellings land in one target namespace.
    resolve_targets(doc, "targets", &mut ns, &mut errors);
    resolve_targets(doc, "connections", &mut ns, &mut errors);
    resolve_rules(doc, &mut ns, &mut errors);
    (ns.into_model(), errors)
}

/// Builder state threaded through the resolution pass.
#[derive(Default)]
struct Namespaces {
    pods: Vec<PodReference>,
    pod_index: HashMap<String, usize>,
    addresses: Vec<AddressGroup>,
    address_index: HashMap<String, usize>,
    targets: Vec<ConnectionTarget>,
    target_index: HashMap<String, usize>,
    rules: Vec<Rule>,
}

impl Namespaces {
    fn pod(&self, name: &str) -> Option<&PodReference> {
        self.pod_index.get(name).and_then(|&i| self.pods.get(i))
    }

    fn address(&self, name: &str) -> Option<&AddressGroup> {
        self.address_index
            .get(name)
            .and_then(|&i| self.addresses.get(i))
    }

    fn target(&self, name: &str) -> Option<&ConnectionTarget> {
        self.target_index
            .get(name)
            .and_then(|&i| self.targets.get(i))
    }

    fn into_model(self) -> ResolvedModel {
        ResolvedModel {
            pods: self.pods,
            addresses: self.addresses,
            targets: self.targets,
            rules: self.rules,
        }
    }
}

fn entry_path(section: &str, index: usize) -> Vec<PathSeg> {
    vec![PathSeg::Key(section.to_string()), PathSeg::Index(index)]
}

/// Section entries that are mappings with a string `name`. Entries the
/// schema already flagged (non-mapping, missing or non-string name) are
/// skipped here without a second error.
fn named_entries<'a>(doc: &'a DocNode, section: &str) -> Vec<(usize, &'a DocNode, &'a str)> {
    doc.get(section)
        .and_then(DocNode::as_seq)
        .map(|entries| {
            entries
                .iter()
                .enumerate()
                .filter_map(|(i, entry)| {
                    entry
                        .get("name")
                        .and_then(DocNode::as_str)
                        .map(|name| (i, entry, name))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_pods(doc: &DocNode, ns: &mut Namespaces, errors: &mut Vec<ValidationError>) {
    for (i, entry, name) in named_entries(doc, "pods") {
        let path = entry_path("pods", i);
        if ns.pod_index.contains_key(name) {
            errors.push(ValidationError::at_entry(
                entry,
                path,
                format!("duplicate pod '{name}'"),
            ));
            continue;
        }

        let single_keys = entry.has_key("podname") || entry.has_key("namespace");
        let group_key = entry.has_key("pods");
        if single_keys && group_key {
            errors.push(ValidationError::at_entry(
                entry,
                path,
                format!("pod '{name}' cannot combine podname/namespace with a pods list"),
            ));
            continue;
        }
        if !group_key && !entry.has_key("podname") {
            errors.push(ValidationError::at_entry(
                entry,
                path,
                format!("pod '{name}' must define either podname or a pods list"),
            ));
            continue;
        }

        let reference = if group_key {
            let mut members = Vec::new();
            let mut ok = true;
            for member in entry.get("pods").map(DocNode::str_seq).unwrap_or_default() {
                match ns.pod(member) {
                    Some(reference) => members.push(reference.clone()),
                    None => {
                        ok = false;
                        errors.push(ValidationError::at_entry(
                            entry,
                            path.clone(),
                            format!("unknown pod reference '{member}' in pod group '{name}'"),
                        ));
                    }
                }
            }
            if !ok {
                continue;
            }
            PodReference::Group(PodGroup {
                name: name.to_string(),
                members,
            })
        } else {
            // `podname` is present but may be ill-typed; the schema has
            // already flagged that case.
            let Some(podname) = entry.get("podname").and_then(DocNode::as_str) else {
                continue;
            };
            let namespace = entry
                .get("namespace")
                .and_then(DocNode::as_str)
                .unwrap_or(DEFAULT_NAMESPACE);
            PodReference::Single(SinglePod {
                name: name.to_string(),
                namespace: namespace.to_string(),
                podname: podname.to_string(),
            })
        };

        ns.pod_index.insert(name.to_string(), ns.pods.len());
        ns.pods.push(reference);
    }
}

fn resolve_addresses(doc: &DocNode, ns: &mut Namespaces, errors: &mut Vec<ValidationError>) {
    for (i, entry, name) in named_entries(doc, "addresses") {
        let path = entry_path("addresses", i);
        if ns.pod_index.contains_key(name) {
            errors.push(ValidationError::at_entry(
                entry,
                path,
                format!("address group name '{name}' is already used by a pod or pod group"),
            ));
            continue;
        }
        if ns.address_index.contains_key(name) {
            errors.push(ValidationError::at_entry(
                entry,
                path,
                format!("duplicate address group '{name}'"),
            ));
            continue;
        }

        let mut endpoints: Vec<String> = entry
            .get("hosts")
            .map(DocNode::str_seq)
            .unwrap_or_default()
            .iter()
            .map(ToString::to_string)
            .collect();
        let mut ok = true;
        for reference in entry
            .get("addresses")
            .map(DocNode::str_seq)
            .unwrap_or_default()
        {
            match ns.address(reference) {
                Some(group) => endpoints.extend(group.endpoints.iter().cloned()),
                None => {
                    ok = false;
                    errors.push(ValidationError::at_entry(
                        entry,
                        path.clone(),
                        format!(
                            "unknown address group reference '{reference}' in address group '{name}'"
                        ),
                    ));
                }
            }
        }
        if !ok {
            continue;
        }

        ns.address_index.insert(name.to_string(), ns.addresses.len());
        ns.addresses.push(AddressGroup {
            name: name.to_string(),
            endpoints,
        });
    }
}

fn resolve_targets(
    doc: &DocNode,
    section: &str,
    ns: &mut Namespaces,
    errors: &mut Vec<ValidationError>,
) {
    for (i, entry, name) in named_entries(doc, section) {
        let path = entry_path(section, i);
        if ns.target_index.contains_key(name) {
            errors.push(ValidationError::at_entry(
                entry,
                path,
                format!("duplicate target '{name}'"),
            ));
            continue;
        }

        let mut destinations = Vec::new();
        let mut seen_pods = HashSet::new();
        let mut ok = true;

        for reference in entry.get("pods").map(DocNode::str_seq).unwrap_or_default() {
            match ns.pod(reference) {
                Some(pod_ref) => {
                    for pod in pod_ref.resolve_to_pods() {
                        if seen_pods.insert(pod.name.clone()) {
                            destinations.push(Destination::Pod(pod.clone()));
                        }
                    }
                }
                None => {
                    ok = false;
                    errors.push(ValidationError::at_entry(
                        entry,
                        path.clone(),
                        format!("unknown pod reference '{reference}' in target '{name}'"),
                    ));
                }
            }
        }
        for reference in entry
            .get("addresses")
            .map(DocNode::str_seq)
            .unwrap_or_default()
        {
            match ns.address(reference) {
                Some(group) => destinations
                    .extend(group.endpoints.iter().cloned().map(Destination::Address)),
                None => {
                    ok = false;
                    errors.push(ValidationError::at_entry(
                        entry,
                        path.clone(),
                        format!(
                            "unknown address group reference '{reference}' in target '{name}'"
                        ),
                    ));
                }
            }
        }
        for reference in entry
            .get("targets")
            .map(DocNode::str_seq)
            .unwrap_or_default()
        {
            match ns.target(reference) {
                Some(target) => destinations.extend(target.destinations.iter().cloned()),
                None => {
                    ok = false;
                    errors.push(ValidationError::at_entry(
                        entry,
                        path.clone(),
                        format!("unknown target reference '{reference}' in target '{name}'"),
                    ));
                }
            }
        }

        let ports = resolve_ports(entry, &path, name, errors);
        if !ok {
            continue;
        }

        ns.target_index.insert(name.to_string(), ns.targets.len());
        ns.targets.push(ConnectionTarget {
            name: name.to_string(),
            destinations,
            ports,
        });
    }
}

fn resolve_ports(
    entry: &DocNode,
    path: &[PathSeg],
    target_name: &str,
    errors: &mut Vec<ValidationError>,
) -> Vec<Port> {
    let Some(items) = entry.get("ports").and_then(DocNode::as_seq) else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    for (j, item) in items.iter().enumerate() {
        let Some(value_node) = item.get("port") else {
            // Missing `port` is a schema violation, already reported.
            continue;
        };
        let value = if let Some(number) = value_node.as_i64() {
            match u16::try_from(number) {
                Ok(port) if port > 0 => PortValue::Number(port),
                _ => {
                    let mut port_path = path.to_vec();
                    port_path.push(PathSeg::Key("ports".to_string()));
                    port_path.push(PathSeg::Index(j));
                    errors.push(ValidationError::at_entry(
                        item,
                        port_path,
                        format!("port {number} out of range in target '{target_name}'"),
                    ));
                    continue;
                }
            }
        } else if let Some(name) = value_node.as_str() {
            PortValue::Name(name.to_string())
        } else {
            continue;
        };
        let protocol = match item.get("type").and_then(DocNode::as_str) {
            Some("UDP") => Protocol::Udp,
            _ => Protocol::Tcp,
        };
        ports.push(Port { value, protocol });
    }
    ports
}

fn resolve_rules(doc: &DocNode, ns: &mut Namespaces, errors: &mut Vec<ValidationError>) {
    for (i, entry, name) in named_entries(doc, "rules") {
        let path = entry_path("rules", i);
        let Some(from) = entry.get("from").and_then(DocNode::as_str) else {
            continue;
        };

        let sources: Vec<SinglePod> = match ns.pod(from) {
            Some(reference) => reference.resolve_to_pods().into_iter().cloned().collect(),
            None => {
                errors.push(ValidationError::at_entry(
                    entry,
                    path,
                    format!("rule '{name}' refers to unknown pod or pod group '{from}'"),
                ));
                continue;
            }
        };

        let mut ok = true;
        let allowed = resolve_target_refs(entry, "allowed", name, &path, ns, errors, &mut ok);
        let denied = resolve_target_refs(entry, "denied", name, &path, ns, errors, &mut ok);
        if !ok {
            continue;
        }

        ns.rules.push(Rule {
            name: name.to_string(),
            sources,
            allowed,
            denied,
        });
    }
}

fn resolve_target_refs(
    entry: &DocNode,
    key: &str,
    rule_name: &str,
    path: &[PathSeg],
    ns: &Namespaces,
    errors: &mut Vec<ValidationError>,
    ok: &mut bool,
) -> Vec<ConnectionTarget> {
    let mut targets = Vec::new();
    for reference in entry.get(key).map(DocNode::str_seq).unwrap_or_default() {
        match ns.target(reference) {
            Some(target) => targets.push(target.clone()),
            None => {
                *ok = false;
                errors.push(ValidationError::at_entry(
                    entry,
                    path.to_vec(),
                    format!("rule '{rule_name}' refers to unknown target '{reference}'"),
                ));
            }
        }
    }
    targets
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::loader::load_document;

    fn resolve_str(source: &str) -> (ResolvedModel, Vec<ValidationError>) {
        resolve(&load_document(source).unwrap())
    }

    #[test]
    fn test_ports_default_to_tcp_and_empty() {
        let (model, errors) = resolve_str(
            "targets:\n  - name: bare\n  - name: web\n    addresses: []\n    ports:\n      - port: 80\n      - port: dns\n        type: UDP\n",
        );
        assert!(errors.is_empty(), "{errors:?}");
        assert!(model.targets[0].ports.is_empty());
        let web = &model.targets[1];
        assert_eq!(web.ports[0], Port::tcp(80));
        assert_eq!(web.ports[1].protocol, Protocol::Udp);
        assert_eq!(web.ports[1].value, PortValue::Name("dns".to_string()));
    }

    #[test]
    fn test_port_out_of_range_is_an_error() {
        let (_, errors) =
            resolve_str("targets:\n  - name: web\n    ports:\n      - port: 70000\n");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("out of range"));
        assert_eq!(errors[0].line, Some(4));
    }

    #[test]
    fn test_namespace_defaults_when_omitted() {
        let (model, errors) = resolve_str("pods:\n  - name: a\n    podname: a-\n");
        assert!(errors.is_empty());
        match &model.pods[0] {
            PodReference::Single(pod) => assert_eq!(pod.namespace, DEFAULT_NAMESPACE),
            PodReference::Group(_) => panic!("expected a single pod"),
        }
    }
}
