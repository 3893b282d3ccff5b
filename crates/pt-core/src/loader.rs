//! Line-tracking YAML loader.
//!
//! Builds the typed [`DocNode`] tree from YAML source, recording the
//! 1-based source line of every node from the parser's event markers.
//! Only the first document of a stream is used; anchors and aliases are
//! rejected.

use crate::doc::{DocNode, DocValue};
use thiserror::Error;
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::{Marker, ScanError, TScalarStyle};

/// Errors produced while loading a specification document.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The YAML scanner rejected the input.
    #[error("YAML parse error: {0}")]
    Scan(#[from] ScanError),

    /// The input contained no document.
    #[error("document is empty")]
    Empty,

    /// Anchors/aliases are not supported in specification documents.
    #[error("line {line}: YAML aliases are not supported")]
    AliasUnsupported {
        /// Source line of the alias.
        line: usize,
    },

    /// A mapping key was not a plain string.
    #[error("line {line}: mapping keys must be strings")]
    NonStringKey {
        /// Source line of the offending key.
        line: usize,
    },
}

/// Load the first YAML document of `source` into a line-annotated tree.
///
/// # Errors
///
/// Returns [`LoadError`] when the input is not valid YAML, is empty,
/// uses aliases, or has non-string mapping keys.
pub fn load_document(source: &str) -> Result<DocNode, LoadError> {
    let mut parser = Parser::new_from_str(source);
    let mut builder = DocBuilder::default();
    parser.load(&mut builder, false)?;
    if let Some(err) = builder.error {
        return Err(err);
    }
    builder.root.ok_or(LoadError::Empty)
}

enum Frame {
    Sequence {
        items: Vec<DocNode>,
        line: usize,
    },
    Mapping {
        entries: Vec<(String, DocNode)>,
        pending_key: Option<String>,
        line: usize,
    },
}

#[derive(Default)]
struct DocBuilder {
    stack: Vec<Frame>,
    root: Option<DocNode>,
    error: Option<LoadError>,
}

impl DocBuilder {
    fn push_node(&mut self, node: DocNode, marker: Marker) {
        match self.stack.last_mut() {
            Some(Frame::Sequence { items, .. }) => items.push(node),
            Some(Frame::Mapping {
                entries,
                pending_key,
                ..
            }) => {
                if let Some(key) = pending_key.take() {
                    entries.push((key, node));
                } else {
                    match node.as_str() {
                        Some(key) => *pending_key = Some(key.to_string()),
                        None => {
                            if self.error.is_none() {
                                self.error = Some(LoadError::NonStringKey {
                                    line: node.line().unwrap_or(marker.line()),
                                });
                            }
                        }
                    }
                }
            }
            None => {
                // Completed root of the first document.
                if self.root.is_none() {
                    self.root = Some(node);
                }
            }
        }
    }

    fn scalar_node(value: String, style: TScalarStyle, line: usize) -> DocNode {
        let parsed = if style == TScalarStyle::Plain {
            match value.as_str() {
                "" | "~" | "null" | "Null" | "NULL" => DocValue::Null,
                "true" => DocValue::Bool(true),
                "false" => DocValue::Bool(false),
                other => other
                    .parse::<i64>()
                    .map_or(DocValue::Str(value.clone()), DocValue::Int),
            }
        } else {
            DocValue::Str(value)
        };
        DocNode::new(parsed, Some(line))
    }
}

impl MarkedEventReceiver for DocBuilder {
    fn on_event(&mut self, event: Event, marker: Marker) {
        if self.error.is_some() {
            return;
        }
        match event {
            Event::Scalar(value, style, _, _) => {
                let node = Self::scalar_node(value, style, marker.line());
                self.push_node(node, marker);
            }
            Event::SequenceStart(..) => {
                self.stack.push(Frame::Sequence {
                    items: Vec::new(),
                    line: marker.line(),
                });
            }
            Event::SequenceEnd => {
                if let Some(Frame::Sequence { items, line }) = self.stack.pop() {
                    self.push_node(
                        DocNode::new(DocValue::Sequence(items), Some(line)),
                        marker,
                    );
                }
            }
            Event::MappingStart(..) => {
                self.stack.push(Frame::Mapping {
                    entries: Vec::new(),
                    pending_key: None,
                    line: marker.line(),
                });
            }
            Event::MappingEnd => {
                if let Some(Frame::Mapping { entries, line, .. }) = self.stack.pop() {
                    self.push_node(
                        DocNode::new(DocValue::Mapping(entries), Some(line)),
                        marker,
                    );
                }
            }
            Event::Alias(_) => {
                self.error = Some(LoadError::AliasUnsupported {
                    line: marker.line(),
                });
            }
            Event::Nothing
            | Event::StreamStart
            | Event::StreamEnd
            | Event::DocumentStart
            | Event::DocumentEnd => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_typing() {
        let doc = load_document("port: 80\nname: web\nquoted: '80'\nflag: true\nnothing: ~\n")
            .unwrap();
        assert_eq!(doc.get("port").and_then(DocNode::as_i64), Some(80));
        assert_eq!(doc.get("name").and_then(DocNode::as_str), Some("web"));
        assert_eq!(doc.get("quoted").and_then(DocNode::as_str), Some("80"));
        assert_eq!(doc.get("flag").unwrap().value(), &DocValue::Bool(true));
        assert_eq!(doc.get("nothing").unwrap().value(), &DocValue::Null);
    }

    #[test]
    fn test_line_numbers_are_one_based_document_positions() {
        let doc = load_document(
            "pods:\n  - name: client\n    podname: client-\n  - name: server\n    podname: server-\n",
        )
        .unwrap();
        assert_eq!(doc.line(), Some(1));
        let pods = doc.get("pods").unwrap();
        let items = pods.as_seq().unwrap();
        assert_eq!(items[0].line(), Some(2));
        assert_eq!(items[1].line(), Some(4));
        assert_eq!(items[1].get("podname").unwrap().line(), Some(5));
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(matches!(load_document(""), Err(LoadError::Empty)));
    }

    #[test]
    fn test_aliases_are_rejected() {
        let res = load_document("base: &a [x]\nother: *a\n");
        assert!(matches!(res, Err(LoadError::AliasUnsupported { .. })));
    }

    #[test]
    fn test_invalid_yaml_is_a_scan_error() {
        let res = load_document("pods: [unclosed\n");
        assert!(matches!(res, Err(LoadError::Scan(_))));
    }

    #[test]
    fn test_only_first_document_is_loaded() {
        let doc = load_document("name: first\n---\nname: second\n").unwrap();
        assert_eq!(doc.get("name").and_then(DocNode::as_str), Some("first"));
    }
}
