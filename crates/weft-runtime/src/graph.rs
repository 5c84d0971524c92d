//! Dependency graph over a block's statements.
//!
//! Built once per block from the block's IR. For each statement the graph
//! records the sibling statements whose returns it references and the
//! free input names it references. Reference collection traverses every
//! expression shape — including array and map literals and both positions
//! of an index expression; missing either produces false "ready" states
//! and evaluator deadlocks.
//!
//! References to workflow inputs (and loop bindings, which arrive through
//! the input environment) never create sibling dependencies.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use weft_program::{Expr, PathSegment};

use crate::error::RuntimeError;

/// One statement of a block: a step statement or the yield.
#[derive(Debug, Clone)]
pub struct StatementDef {
    /// Stable IR node id.
    pub id: String,
    /// Binding name (empty for the yield).
    pub name: String,
    /// Call target as written in the source.
    pub target: String,
    /// Whether this is the block's yield statement.
    pub is_yield: bool,
    /// The statement node itself (args are re-read at reduction time).
    pub node: Value,
}

/// Dependency graph of a single block.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Statements in declaration order (yield last).
    statements: Vec<StatementDef>,
    /// Statement id → sibling statement ids it depends on.
    dependencies: HashMap<String, HashSet<String>>,
    /// Statement id → free input names it references.
    free_inputs: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Build the graph from a block node (`steps` list plus optional
    /// `yield`).
    pub fn from_block(block: &Value) -> Result<Self, RuntimeError> {
        let mut statements = Vec::new();

        for node in block.get("steps").and_then(|s| s.as_array()).into_iter().flatten() {
            statements.push(statement_def(node, false)?);
        }
        if let Some(node) = block.get("yield") {
            statements.push(statement_def(node, true)?);
        }

        let name_to_id: HashMap<&str, &str> = statements
            .iter()
            .filter(|s| !s.name.is_empty())
            .map(|s| (s.name.as_str(), s.id.as_str()))
            .collect();

        let mut dependencies = HashMap::new();
        let mut free_inputs = HashMap::new();

        for stmt in &statements {
            let mut refs = RefSet::default();
            for arg in call_args(&stmt.node) {
                if let Some(value) = arg.get("value") {
                    let expr = Expr::from_ir(value)
                        .map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
                    collect_refs(&expr, &mut refs);
                }
            }

            let deps: HashSet<String> = refs
                .step_roots
                .iter()
                .filter_map(|name| name_to_id.get(name.as_str()))
                .map(|id| id.to_string())
                .collect();

            dependencies.insert(stmt.id.clone(), deps);
            free_inputs.insert(stmt.id.clone(), refs.input_roots);
        }

        Ok(Self {
            statements,
            dependencies,
            free_inputs,
        })
    }

    /// Statements in declaration order.
    pub fn statements(&self) -> &[StatementDef] {
        &self.statements
    }

    pub fn statement(&self, id: &str) -> Option<&StatementDef> {
        self.statements.iter().find(|s| s.id == id)
    }

    /// Sibling dependencies of a statement.
    pub fn dependencies(&self, id: &str) -> Option<&HashSet<String>> {
        self.dependencies.get(id)
    }

    /// Free input names a statement references.
    pub fn free_inputs(&self, id: &str) -> Option<&HashSet<String>> {
        self.free_inputs.get(id)
    }

    /// Whether every sibling dependency of `id` is in `completed`.
    /// Free-input references alone never block creation.
    pub fn can_create(&self, id: &str, completed: &HashSet<String>) -> bool {
        match self.dependencies.get(id) {
            Some(deps) => deps.is_subset(completed),
            None => false,
        }
    }

    /// All statements whose dependencies are satisfied and which are not
    /// themselves in `completed`. The evaluator filters out already
    /// materialized ids; order within the result carries no meaning.
    pub fn get_ready(&self, completed: &HashSet<String>) -> Vec<&StatementDef> {
        self.statements
            .iter()
            .filter(|s| !completed.contains(&s.id))
            .filter(|s| self.can_create(&s.id, completed))
            .collect()
    }

    /// A deterministic ordering honoring the dependency partial order;
    /// ties break by declaration order. Used for telemetry and logging.
    pub fn topological_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.statements.len());
        let mut placed: HashSet<String> = HashSet::new();

        while order.len() < self.statements.len() {
            let mut advanced = false;
            for stmt in &self.statements {
                if placed.contains(&stmt.id) {
                    continue;
                }
                if self.can_create(&stmt.id, &placed) {
                    placed.insert(stmt.id.clone());
                    order.push(stmt.id.clone());
                    advanced = true;
                }
            }
            if !advanced {
                // Dependency cycle: append the remainder in declaration
                // order rather than spin.
                for stmt in &self.statements {
                    if !placed.contains(&stmt.id) {
                        placed.insert(stmt.id.clone());
                        order.push(stmt.id.clone());
                    }
                }
            }
        }

        order
    }
}

fn statement_def(node: &Value, is_yield: bool) -> Result<StatementDef, RuntimeError> {
    let id = node
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RuntimeError::Evaluation("statement node missing id".into()))?;
    let name = node.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let target = node
        .get("call")
        .and_then(|c| c.get("target"))
        .and_then(|t| t.as_str())
        .unwrap_or("");

    Ok(StatementDef {
        id: id.to_string(),
        name: name.to_string(),
        target: target.to_string(),
        is_yield,
        node: node.clone(),
    })
}

/// Named arguments of a statement's call node.
pub fn call_args(stmt_node: &Value) -> impl Iterator<Item = &Value> {
    stmt_node
        .get("call")
        .and_then(|c| c.get("args"))
        .and_then(|a| a.as_array())
        .map(|a| a.iter())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct RefSet {
    step_roots: HashSet<String>,
    input_roots: HashSet<String>,
}

fn collect_refs(expr: &Expr, out: &mut RefSet) {
    match expr {
        Expr::StepRef { path } => {
            if let Some(PathSegment::Key(root)) = path.first() {
                out.step_roots.insert(root.clone());
            }
        }
        Expr::InputRef { path } => {
            if let Some(PathSegment::Key(root)) = path.first() {
                out.input_roots.insert(root.clone());
            }
        }
        Expr::BinaryExpr { left, right, .. } => {
            collect_refs(left, out);
            collect_refs(right, out);
        }
        Expr::UnaryExpr { operand, .. } => collect_refs(operand, out),
        Expr::ArrayLiteral { elements } => {
            for e in elements {
                collect_refs(e, out);
            }
        }
        Expr::MapLiteral { entries } => {
            for entry in entries {
                collect_refs(&entry.value, out);
            }
        }
        Expr::IndexExpr { target, index } => {
            collect_refs(target, out);
            collect_refs(index, out);
        }
        Expr::ConcatExpr { parts } => {
            for p in parts {
                collect_refs(p, out);
            }
        }
        Expr::Literal { .. }
        | Expr::Int { .. }
        | Expr::Float { .. }
        | Expr::Bool { .. }
        | Expr::Str { .. }
        | Expr::Null
        | Expr::CallExpr => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(block: Value) -> DependencyGraph {
        DependencyGraph::from_block(&block).unwrap()
    }

    fn step_ref(path: &[&str]) -> Value {
        json!({"type": "StepRef", "path": path})
    }

    #[test]
    fn simple_chain() {
        let g = graph(json!({
            "steps": [
                {"id": "step-1", "name": "s1", "call": {"target": "Value", "args": [
                    {"name": "input", "value": {"type": "InputRef", "path": ["input"]}}
                ]}},
                {"id": "step-2", "name": "s2", "call": {"target": "Value", "args": [
                    {"name": "input", "value": step_ref(&["s1", "input"])}
                ]}},
            ]
        }));

        assert!(g.statement("step-1").is_some());
        assert!(g.statement("step-2").is_some());
        assert!(g.dependencies("step-1").unwrap().is_empty());
        assert!(g.dependencies("step-2").unwrap().contains("step-1"));
        assert!(g.free_inputs("step-1").unwrap().contains("input"));
    }

    #[test]
    fn yield_is_a_statement() {
        let g = graph(json!({
            "steps": [
                {"id": "step-1", "name": "s1", "call": {"target": "Value", "args": []}}
            ],
            "yield": {"id": "yield-1", "call": {"target": "TestOne", "args": [
                {"name": "output", "value": step_ref(&["s1", "input"])}
            ]}},
        }));

        let y = g.statement("yield-1").unwrap();
        assert!(y.is_yield);
        assert!(g.dependencies("yield-1").unwrap().contains("step-1"));
    }

    #[test]
    fn can_create_gates_on_dependencies() {
        let g = graph(json!({
            "steps": [
                {"id": "s1", "name": "s1", "call": {"target": "V", "args": []}},
                {"id": "s2", "name": "s2", "call": {"target": "V", "args": [
                    {"name": "x", "value": step_ref(&["s1", "out"])}
                ]}},
            ]
        }));

        assert!(g.can_create("s1", &HashSet::new()));
        assert!(!g.can_create("s2", &HashSet::new()));
        assert!(g.can_create("s2", &HashSet::from(["s1".to_string()])));
    }

    #[test]
    fn readiness_progression() {
        let g = graph(json!({
            "steps": [
                {"id": "a", "name": "a", "call": {"target": "V", "args": []}},
                {"id": "b", "name": "b", "call": {"target": "V", "args": []}},
                {"id": "c", "name": "c", "call": {"target": "V", "args": [
                    {"name": "x", "value": step_ref(&["a", "out"])},
                    {"name": "y", "value": step_ref(&["b", "out"])},
                ]}},
            ]
        }));

        let ready: HashSet<_> = g.get_ready(&HashSet::new()).iter().map(|s| s.id.clone()).collect();
        assert!(ready.contains("a"));
        assert!(ready.contains("b"));
        assert!(!ready.contains("c"));

        let ready: HashSet<_> = g
            .get_ready(&HashSet::from(["a".to_string()]))
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert!(ready.contains("b"));
        assert!(!ready.contains("c"));

        let ready: HashSet<_> = g
            .get_ready(&HashSet::from(["a".to_string(), "b".to_string()]))
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert!(ready.contains("c"));
    }

    #[test]
    fn topological_order_honors_dependencies() {
        let g = graph(json!({
            "steps": [
                {"id": "a", "name": "a", "call": {"target": "V", "args": []}},
                {"id": "b", "name": "b", "call": {"target": "V", "args": [
                    {"name": "x", "value": step_ref(&["a", "out"])}
                ]}},
                {"id": "c", "name": "c", "call": {"target": "V", "args": [
                    {"name": "x", "value": step_ref(&["b", "out"])}
                ]}},
            ]
        }));

        let order = g.topological_order();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn deps_inside_array_literal() {
        let g = graph(json!({
            "steps": [
                {"id": "a", "name": "a", "call": {"target": "V", "args": []}},
                {"id": "b", "name": "b", "call": {"target": "V", "args": [
                    {"name": "items", "value": {"type": "ArrayLiteral", "elements": [
                        step_ref(&["a", "out"]),
                        {"type": "Int", "value": 1},
                    ]}}
                ]}},
            ]
        }));
        assert!(g.dependencies("b").unwrap().contains("a"));
    }

    #[test]
    fn deps_inside_map_literal() {
        let g = graph(json!({
            "steps": [
                {"id": "a", "name": "a", "call": {"target": "V", "args": []}},
                {"id": "b", "name": "b", "call": {"target": "V", "args": [
                    {"name": "config", "value": {"type": "MapLiteral", "entries": [
                        {"key": "val", "value": step_ref(&["a", "out"])}
                    ]}}
                ]}},
            ]
        }));
        assert!(g.dependencies("b").unwrap().contains("a"));
    }

    #[test]
    fn deps_in_both_index_positions() {
        let g = graph(json!({
            "steps": [
                {"id": "a", "name": "a", "call": {"target": "V", "args": []}},
                {"id": "c", "name": "c", "call": {"target": "V", "args": []}},
                {"id": "b", "name": "b", "call": {"target": "V", "args": [
                    {"name": "item", "value": {"type": "IndexExpr",
                        "target": step_ref(&["a", "out"]),
                        "index": step_ref(&["c", "idx"]),
                    }}
                ]}},
            ]
        }));
        let deps = g.dependencies("b").unwrap();
        assert!(deps.contains("a"));
        assert!(deps.contains("c"));
    }

    #[test]
    fn input_refs_never_create_dependencies() {
        let g = graph(json!({
            "steps": [
                {"id": "a", "name": "a", "call": {"target": "V", "args": [
                    {"name": "items", "value": {"type": "ArrayLiteral", "elements": [
                        {"type": "InputRef", "path": ["x"]}
                    ]}}
                ]}},
            ]
        }));
        assert!(g.dependencies("a").unwrap().is_empty());
        assert!(g.free_inputs("a").unwrap().contains("x"));
    }
}
