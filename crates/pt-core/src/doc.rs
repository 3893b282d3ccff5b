//! Typed, line-annotated document tree.
//!
//! The loader produces this tree instead of a loosely-typed map so that
//! every node carries an explicit optional source line. The schema
//! validator works on a line-stripped JSON copy ([`DocNode::to_json`]);
//! error contextualization walks the annotated tree to recover the
//! deepest known source line for a validator path.

use serde_json::Value;
use std::fmt;

/// One step of a structural path into the document: a mapping key or a
/// sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    /// Mapping key.
    Key(String),
    /// Sequence index.
    Index(usize),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(k) => write!(f, "{k}"),
            PathSeg::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Render a path as `section[2]field`: keys bare, indices bracketed.
#[must_use]
pub fn render_path(segs: &[PathSeg]) -> String {
    segs.iter().map(ToString::to_string).collect()
}

/// A document node: a value plus the source line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DocNode {
    value: DocValue,
    line: Option<usize>,
}

/// The value held by a [`DocNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    /// Ordered mapping (key order is document order).
    Mapping(Vec<(String, DocNode)>),
    /// Sequence of nodes.
    Sequence(Vec<DocNode>),
    /// String scalar.
    Str(String),
    /// Integer scalar.
    Int(i64),
    /// Boolean scalar.
    Bool(bool),
    /// Null / missing value.
    Null,
}

impl DocNode {
    /// Create a node with a known source line (1-based).
    #[must_use]
    pub fn new(value: DocValue, line: Option<usize>) -> Self {
        Self { value, line }
    }

    /// The node's source line, if the parser knew it.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        self.line
    }

    /// The node's value.
    #[must_use]
    pub fn value(&self) -> &DocValue {
        &self.value
    }

    /// Mapping lookup; `None` for non-mappings and missing keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&DocNode> {
        match &self.value {
            DocValue::Mapping(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, node)| node),
            _ => None,
        }
    }

    /// Whether this mapping contains `key`.
    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The mapping entries, if this node is a mapping.
    #[must_use]
    pub fn as_mapping(&self) -> Option<&[(String, DocNode)]> {
        match &self.value {
            DocValue::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    /// The items, if this node is a sequence.
    #[must_use]
    pub fn as_seq(&self) -> Option<&[DocNode]> {
        match &self.value {
            DocValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// The string value, if this node is a string scalar.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            DocValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer value, if this node is an integer scalar.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            DocValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string items of a sequence-of-strings field, skipping
    /// non-string items (the schema has already flagged those).
    #[must_use]
    pub fn str_seq(&self) -> Vec<&str> {
        self.as_seq()
            .map(|items| items.iter().filter_map(DocNode::as_str).collect())
            .unwrap_or_default()
    }

    /// Convert to a plain JSON value with all line information stripped.
    ///
    /// The schema validator has no notion of source positions, so it is
    /// handed this copy.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match &self.value {
            DocValue::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            DocValue::Sequence(items) => {
                Value::Array(items.iter().map(DocNode::to_json).collect())
            }
            DocValue::Str(s) => Value::String(s.clone()),
            DocValue::Int(i) => Value::Number((*i).into()),
            DocValue::Bool(b) => Value::Bool(*b),
            DocValue::Null => Value::Null,
        }
    }

    /// Pretty-print this node as an indented YAML-like snippet, line
    /// markers stripped, for use as error context.
    #[must_use]
    pub fn to_snippet(&self, indent: usize) -> String {
        let mut out = String::new();
        self.write_snippet(indent, &mut out);
        out
    }

    fn write_snippet(&self, indent: usize, out: &mut String) {
        let pad = " ".repeat(indent);
        match &self.value {
            DocValue::Mapping(entries) => {
                for (k, v) in entries {
                    if v.is_scalar() {
                        out.push_str(&format!("{pad}{k}: {}\n", v.scalar_text()));
                    } else {
                        out.push_str(&format!("{pad}{k}:\n"));
                        v.write_snippet(indent + 2, out);
                    }
                }
            }
            DocValue::Sequence(items) => {
                for item in items {
                    if item.is_scalar() {
                        out.push_str(&format!("{pad}- {}\n", item.scalar_text()));
                    } else {
                        out.push_str(&format!("{pad}-\n"));
                        item.write_snippet(indent + 2, out);
                    }
                }
            }
            _ => out.push_str(&format!("{pad}{}\n", self.scalar_text())),
        }
    }

    fn is_scalar(&self) -> bool {
        !matches!(self.value, DocValue::Mapping(_) | DocValue::Sequence(_))
    }

    fn scalar_text(&self) -> String {
        match &self.value {
            DocValue::Str(s) => s.clone(),
            DocValue::Int(i) => i.to_string(),
            DocValue::Bool(b) => b.to_string(),
            DocValue::Null => "null".to_string(),
            DocValue::Mapping(_) | DocValue::Sequence(_) => String::new(),
        }
    }
}
