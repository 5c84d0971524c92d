//! Typed expression nodes.
//!
//! Argument values inside `StepStmt` / `YieldStmt` nodes form a small
//! expression tree. The runtime deserializes them into [`Expr`] before
//! reduction; dependency extraction also walks this tree.
//!
//! The canonical literal node is `Literal`, but compiled programs in the
//! wild also carry the emitter's scalar shorthand tags (`Int`, `Float`,
//! `Bool`, `String`, `Null` and their width-named aliases), so those
//! deserialize too.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One segment of a reference path: a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Map key or name segment.
    Key(String),
    /// Sequence index.
    Index(u64),
}

impl PathSegment {
    /// The segment as a name, if it is one.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Self::Key(k) => Some(k),
            Self::Index(_) => None,
        }
    }
}

/// A key/value pair inside a `MapLiteral`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: String,
    pub value: Expr,
}

/// An expression node of the compiled program tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    /// Reference to a workflow input (or loop binding), `$.name.path…`.
    InputRef { path: Vec<PathSegment> },

    /// Reference to a completed sibling step's return, `step.name.path…`.
    StepRef { path: Vec<PathSegment> },

    /// Canonical literal node carrying an arbitrary JSON value.
    Literal { value: Value },

    /// Integer literal shorthand.
    #[serde(alias = "Long")]
    Int { value: i64 },

    /// Floating-point literal shorthand.
    #[serde(alias = "Double")]
    Float { value: f64 },

    /// Boolean literal shorthand.
    #[serde(alias = "Boolean")]
    Bool { value: bool },

    /// String literal shorthand.
    #[serde(rename = "String")]
    Str { value: String },

    /// Null literal shorthand.
    Null,

    /// Binary operation.
    BinaryExpr {
        operator: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Unary operation (`-`, `!`).
    UnaryExpr {
        operator: String,
        #[serde(alias = "expr")]
        operand: Box<Expr>,
    },

    /// Ordered sequence literal.
    ArrayLiteral { elements: Vec<Expr> },

    /// Map literal.
    MapLiteral { entries: Vec<MapEntry> },

    /// Indexing, `target[index]`.
    IndexExpr {
        target: Box<Expr>,
        index: Box<Expr>,
    },

    /// String interpolation parts.
    ConcatExpr { parts: Vec<Expr> },

    /// A facet call. Never reduced — marks a step boundary.
    CallExpr,
}

/// Failure to interpret an IR node as an expression.
#[derive(Debug, thiserror::Error)]
#[error("invalid expression node: {0}")]
pub struct ExprParseError(#[from] serde_json::Error);

impl Expr {
    /// Deserialize an expression from its IR node.
    pub fn from_ir(node: &Value) -> Result<Self, ExprParseError> {
        Ok(serde_json::from_value(node.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_input_ref() {
        let expr = Expr::from_ir(&json!({"type": "InputRef", "path": ["input"]})).unwrap();
        assert_eq!(
            expr,
            Expr::InputRef {
                path: vec![PathSegment::Key("input".into())]
            }
        );
    }

    #[test]
    fn parses_mixed_path_segments() {
        let expr =
            Expr::from_ir(&json!({"type": "StepRef", "path": ["s1", "items", 0]})).unwrap();
        match expr {
            Expr::StepRef { path } => {
                assert_eq!(path[0], PathSegment::Key("s1".into()));
                assert_eq!(path[2], PathSegment::Index(0));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_literal_shorthands() {
        assert_eq!(
            Expr::from_ir(&json!({"type": "Int", "value": 1})).unwrap(),
            Expr::Int { value: 1 }
        );
        assert_eq!(
            Expr::from_ir(&json!({"type": "Long", "value": 7})).unwrap(),
            Expr::Int { value: 7 }
        );
        assert_eq!(
            Expr::from_ir(&json!({"type": "String", "value": "hi"})).unwrap(),
            Expr::Str { value: "hi".into() }
        );
        assert_eq!(Expr::from_ir(&json!({"type": "Null"})).unwrap(), Expr::Null);
    }

    #[test]
    fn parses_binary_tree() {
        let expr = Expr::from_ir(&json!({
            "type": "BinaryExpr",
            "operator": "+",
            "left": {"type": "InputRef", "path": ["input"]},
            "right": {"type": "Int", "value": 1},
        }))
        .unwrap();
        match expr {
            Expr::BinaryExpr { operator, .. } => assert_eq!(operator, "+"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_collections() {
        let expr = Expr::from_ir(&json!({
            "type": "MapLiteral",
            "entries": [{"key": "k", "value": {"type": "Int", "value": 1}}],
        }))
        .unwrap();
        match expr {
            Expr::MapLiteral { entries } => assert_eq!(entries[0].key, "k"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_tags() {
        assert!(Expr::from_ir(&json!({"type": "Mystery"})).is_err());
    }
}
