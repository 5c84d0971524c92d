//! Node tags of the compiled program tree.
//!
//! Every node in a compiled program carries a `type` field holding one of
//! these tags. The constants exist so the runtime never spells a tag
//! inline.

pub const PROGRAM: &str = "Program";
pub const NAMESPACE: &str = "Namespace";
pub const WORKFLOW_DECL: &str = "WorkflowDecl";
pub const FACET_DECL: &str = "FacetDecl";
pub const EVENT_FACET_DECL: &str = "EventFacetDecl";
pub const SCHEMA_DECL: &str = "SchemaDecl";
pub const AND_THEN_BLOCK: &str = "AndThenBlock";
pub const FOREACH_CLAUSE: &str = "ForeachClause";
pub const STEP_STMT: &str = "StepStmt";
pub const YIELD_STMT: &str = "YieldStmt";
pub const CALL_EXPR: &str = "CallExpr";
pub const NAMED_ARG: &str = "NamedArg";

/// Field holding the node tag.
pub const TYPE: &str = "type";

/// Field holding a container's declaration list after normalization.
pub const DECLARATIONS: &str = "declarations";

/// Returns the `type` tag of a node, if present.
pub fn node_type(node: &serde_json::Value) -> Option<&str> {
    node.get(TYPE).and_then(|t| t.as_str())
}

/// Returns the `name` field of a node, if present.
pub fn node_name(node: &serde_json::Value) -> Option<&str> {
    node.get("name").and_then(|n| n.as_str())
}
