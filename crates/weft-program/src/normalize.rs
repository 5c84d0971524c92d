//! Program normalization.
//!
//! Older compiler versions (and some external emitters) group declarations
//! under categorized keys (`workflows`, `facets`, `eventFacets`,
//! `implicits`, `schemas`, `namespaces`). Normalization folds everything
//! into a single `declarations` list per container so the rest of the
//! runtime only ever deals with one shape.

use serde_json::{Map, Value};

use crate::tags;

/// Categorized keys emitted under both the legacy and declarations formats.
const CATEGORIZED_KEYS: &[&str] = &[
    "namespaces",
    "facets",
    "eventFacets",
    "workflows",
    "implicits",
    "schemas",
];

/// Returns a copy of `program` with `declarations` as the single source of
/// truth for contained declarations.
///
/// - If `declarations` is present, categorized keys are stripped.
/// - If `declarations` is absent, it is built from the categorized keys,
///   in the fixed order `namespaces`, `facets`, `eventFacets`,
///   `workflows`, `implicits`, `schemas`.
/// - `Namespace` nodes inside `declarations` are normalized recursively.
/// - The input is not mutated, and the function is idempotent.
pub fn normalize_program(program: &Value) -> Value {
    let Some(obj) = program.as_object() else {
        return program.clone();
    };
    normalize_container(obj, CATEGORIZED_KEYS)
}

fn normalize_container(obj: &Map<String, Value>, keys: &[&str]) -> Value {
    let mut out: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !CATEGORIZED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match obj.get(tags::DECLARATIONS).and_then(|d| d.as_array()) {
        Some(declarations) => {
            let normalized: Vec<Value> = declarations.iter().map(normalize_node).collect();
            out.insert(tags::DECLARATIONS.to_string(), Value::Array(normalized));
        }
        None => {
            let mut decls: Vec<Value> = Vec::new();
            for key in keys {
                if let Some(items) = obj.get(*key).and_then(|v| v.as_array()) {
                    decls.extend(items.iter().map(normalize_node));
                }
            }
            if !decls.is_empty() {
                out.insert(tags::DECLARATIONS.to_string(), Value::Array(decls));
            }
        }
    }

    Value::Object(out)
}

/// Namespaces are the only declaration kind that nests further
/// declarations; everything else passes through untouched.
fn normalize_node(node: &Value) -> Value {
    if tags::node_type(node) != Some(tags::NAMESPACE) {
        return node.clone();
    }
    let Some(obj) = node.as_object() else {
        return node.clone();
    };
    // Nested namespaces only appear inside `declarations`, never under a
    // categorized key of another namespace.
    normalize_container(
        obj,
        &["facets", "eventFacets", "workflows", "implicits", "schemas"],
    )
}
