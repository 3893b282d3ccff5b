//! Schema validation with source-line error contextualization.
//!
//! The specification document is validated against a fixed JSON Schema
//! covering the four top-level sections. The validator sees a copy of
//! the document with line information stripped; each violation's
//! instance path is then re-joined against the annotated tree to find
//! the deepest ancestor with a known line, which becomes the reported
//! location.

use crate::doc::{render_path, DocNode, PathSeg};
use jsonschema::paths::PathChunk;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use std::fmt;

/// A schema or referential-integrity violation.
///
/// Collected, never raised individually: the resolver always finishes a
/// full pass and returns the complete list.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Best-known document line (1-based); `None` if unknown.
    pub line: Option<usize>,
    /// Path prefix the validator could localize to a source line.
    pub path: Vec<PathSeg>,
    /// Path remainder beyond the located ancestor.
    pub remainder: Vec<PathSeg>,
    /// Violation message.
    pub message: String,
    /// Pretty-printed snippet of the located ancestor, lines stripped.
    pub context: String,
}

impl ValidationError {
    /// Error located at a resolved entry: full path localized, snippet
    /// of the entry as context.
    #[must_use]
    pub fn at_entry(entry: &DocNode, path: Vec<PathSeg>, message: String) -> Self {
        Self {
            line: entry.line(),
            path,
            remainder: Vec::new(),
            message,
            context: entry.to_snippet(4),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self.line.map_or(-1, |l| i64::try_from(l).unwrap_or(-1));
        write!(
            f,
            "line {line}: {}: '{}': {}",
            render_path(&self.path),
            render_path(&self.remainder),
            self.message
        )?;
        if !self.context.is_empty() {
            write!(f, "\n  CONTEXT:\n{}", self.context)?;
        }
        Ok(())
    }
}

/// The fixed schema for specification documents.
///
/// Sections: `pods`, `addresses`, `targets`/`connections`, `rules`.
#[must_use]
pub fn policy_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "pods": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"},
                        "namespace": {"type": "string"},
                        "podname": {"type": "string"},
                        "pods": {"type": "array", "items": {"type": "string"}}
                    }
                }
            },
            "addresses": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"},
                        "hosts": {"type": "array", "items": {"type": "string"}},
                        "addresses": {"type": "array", "items": {"type": "string"}}
                    }
                }
            },
            "targets": {"$ref": "#/definitions/targetList"},
            "connections": {"$ref": "#/definitions/targetList"},
            "rules": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name", "from"],
                    "properties": {
                        "name": {"type": "string"},
                        "from": {"type": "string"},
                        "allowed": {"type": "array", "items": {"type": "string"}},
                        "denied": {"type": "array", "items": {"type": "string"}}
                    }
                }
            }
        },
        "definitions": {
            "targetList": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"},
                        "pods": {"type": "array", "items": {"type": "string"}},
                        "addresses": {"type": "array", "items": {"type": "string"}},
                        "targets": {"type": "array", "items": {"type": "string"}},
                        "ports": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "additionalProperties": false,
                                "required": ["port"],
                                "properties": {
                                    "port": {"type": ["integer", "string"]},
                                    "type": {"enum": ["TCP", "UDP"]}
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Validate `doc` against the fixed schema, returning every violation
/// (never just the first) with source-line context attached.
#[must_use]
pub fn validate_schema(doc: &DocNode) -> Vec<ValidationError> {
    let schema = policy_schema();
    let compiled = match JSONSchema::compile(&schema) {
        Ok(compiled) => compiled,
        Err(err) => {
            // The schema is a constant; a compile failure is a
            // programming error, reported rather than panicked on.
            return vec![ValidationError {
                line: None,
                path: Vec::new(),
                remainder: Vec::new(),
                message: format!("internal schema error: {err}"),
                context: String::new(),
            }];
        }
    };

    let instance = doc.to_json();
    let mut out = Vec::new();
    if let Err(errors) = compiled.validate(&instance) {
        for err in errors {
            let segs: Vec<PathSeg> = err
                .instance_path
                .iter()
                .map(|chunk| match chunk {
                    PathChunk::Property(p) => PathSeg::Key(p.to_string()),
                    PathChunk::Index(i) => PathSeg::Index(*i),
                    PathChunk::Keyword(k) => PathSeg::Key((*k).to_string()),
                })
                .collect();
            out.push(contextualize(doc, segs, err.to_string()));
        }
    }
    out
}

/// Re-join a validator path against the annotated tree.
///
/// Walks the path, remembering the deepest ancestor that carries a line
/// marker; the path is split there into a localized prefix and an
/// unlocalized remainder. A segment that does not exist in the document
/// stops the walk at the last segment that did exist.
fn contextualize(doc: &DocNode, segs: Vec<PathSeg>, message: String) -> ValidationError {
    let mut node = doc;
    let mut best_line = doc.line();
    let mut best_node = doc;
    let mut split = 0;

    for (i, seg) in segs.iter().enumerate() {
        let next = match seg {
            PathSeg::Key(k) => node.get(k),
            PathSeg::Index(idx) => node.as_seq().and_then(|items| items.get(*idx)),
        };
        let Some(next) = next else { break };
        node = next;
        if let Some(line) = next.line() {
            best_line = Some(line);
            best_node = next;
            split = i + 1;
        }
    }

    let remainder = segs.get(split..).unwrap_or_default().to_vec();
    let mut path = segs;
    path.truncate(split);

    ValidationError {
        line: best_line,
        path,
        remainder,
        message,
        context: best_node.to_snippet(4),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::loader::load_document;

    #[test]
    fn test_valid_document_has_no_errors() {
        let doc = load_document(
            "pods:\n  - name: client\n    namespace: ns1\n    podname: client-\n\
             rules:\n  - name: r\n    from: client\n",
        )
        .unwrap();
        assert!(validate_schema(&doc).is_empty());
    }

    #[test]
    fn test_each_violation_is_reported_with_its_line() {
        // Two independent shape violations: integer name (line 2) and
        // integer podname (line 5).
        let doc = load_document(
            "pods:\n  - name: 17\n    podname: a-\n  - name: b\n    podname: 99\n",
        )
        .unwrap();
        let errors = validate_schema(&doc);
        assert_eq!(errors.len(), 2);
        let mut lines: Vec<Option<usize>> = errors.iter().map(|e| e.line).collect();
        lines.sort_unstable();
        assert_eq!(lines, vec![Some(2), Some(5)]);
    }

    #[test]
    fn test_missing_required_field_locates_the_entry() {
        let doc = load_document("rules:\n  - from: client\n").unwrap();
        let errors = validate_schema(&doc);
        assert_eq!(errors.len(), 1);
        let err = &errors[0];
        // The missing field has no path presence; the location stops at
        // the rule entry itself.
        assert_eq!(err.line, Some(2));
        assert_eq!(render_path(&err.path), "rules[0]");
        assert!(err.remainder.is_empty());
        assert!(err.context.contains("from: client"));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let doc = load_document("bogus: []\n").unwrap();
        let errors = validate_schema(&doc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(1));
    }

    #[test]
    fn test_port_protocol_enum_is_enforced() {
        let doc = load_document(
            "targets:\n  - name: web\n    ports:\n      - port: 80\n        type: SCTP\n",
        )
        .unwrap();
        let errors = validate_schema(&doc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(5));
        assert!(errors[0].message.contains("SCTP"));
    }

    #[test]
    fn test_display_shape() {
        let err = ValidationError {
            line: None,
            path: vec![PathSeg::Key("pods".to_string()), PathSeg::Index(0)],
            remainder: vec![PathSeg::Key("podname".to_string())],
            message: "boom".to_string(),
            context: String::new(),
        };
        assert_eq!(err.to_string(), "line -1: pods[0]: 'podname': boom");
    }
}
