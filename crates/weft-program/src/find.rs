//! Declaration lookup in compiled programs.
//!
//! Lookup works on both normalized (declarations-only) and legacy
//! (categorized keys) program shapes, so callers never need to normalize
//! first just to read.

use serde_json::Value;

use crate::tags;

/// Kind of a facet declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetKind {
    /// A regular facet: invoked inline, never pauses the workflow.
    Regular,
    /// An event facet: invocation creates a task and pauses the workflow.
    Event,
}

/// Find a `WorkflowDecl` in `program` by name.
///
/// Supports simple names (`"MyWorkflow"`) and dotted qualified names
/// (`"ns.sub.MyWorkflow"`).
pub fn find_workflow<'a>(program: &'a Value, workflow_name: &str) -> Option<&'a Value> {
    if workflow_name.contains('.') {
        find_qualified(program, workflow_name)
    } else {
        find_simple(program, workflow_name)
    }
}

fn find_simple<'a>(program: &'a Value, name: &str) -> Option<&'a Value> {
    // Top-level categorized key
    for w in array(program, "workflows") {
        if tags::node_name(w) == Some(name) {
            return Some(w);
        }
    }

    // Categorized namespaces
    for ns in array(program, "namespaces") {
        if let Some(found) = search_namespace_workflows(ns, name) {
            return Some(found);
        }
    }

    // Declarations list
    for decl in array(program, tags::DECLARATIONS) {
        match tags::node_type(decl) {
            Some(tags::WORKFLOW_DECL) if tags::node_name(decl) == Some(name) => {
                return Some(decl);
            }
            Some(tags::NAMESPACE) => {
                if let Some(found) = search_namespace_workflows(decl, name) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }

    None
}

fn find_qualified<'a>(program: &'a Value, qualified_name: &str) -> Option<&'a Value> {
    let (ns_prefix, short_name) = qualified_name.rsplit_once('.')?;

    // Strategy 1: flat namespace whose dotted name equals the full prefix.
    for ns in array(program, "namespaces").chain(
        array(program, tags::DECLARATIONS)
            .filter(|d| tags::node_type(d) == Some(tags::NAMESPACE)),
    ) {
        if tags::node_name(ns) == Some(ns_prefix) {
            if let Some(found) = direct_workflow(ns, short_name) {
                return Some(found);
            }
        }
    }

    // Strategy 2: navigate nested namespaces segment by segment.
    let mut current = program;
    for segment in ns_prefix.split('.') {
        current = array(current, "namespaces")
            .chain(
                array(current, tags::DECLARATIONS)
                    .filter(|d| tags::node_type(d) == Some(tags::NAMESPACE)),
            )
            .find(|ns| tags::node_name(ns) == Some(segment))?;
    }

    direct_workflow(current, short_name)
}

/// Find a workflow declared directly on `container` (no recursion).
fn direct_workflow<'a>(container: &'a Value, name: &str) -> Option<&'a Value> {
    for w in array(container, "workflows") {
        if tags::node_name(w) == Some(name) {
            return Some(w);
        }
    }
    array(container, tags::DECLARATIONS).find(|d| {
        tags::node_type(d) == Some(tags::WORKFLOW_DECL) && tags::node_name(d) == Some(name)
    })
}

fn search_namespace_workflows<'a>(namespace: &'a Value, name: &str) -> Option<&'a Value> {
    for w in array(namespace, "workflows") {
        if tags::node_name(w) == Some(name) {
            return Some(w);
        }
    }
    for decl in array(namespace, tags::DECLARATIONS) {
        match tags::node_type(decl) {
            Some(tags::WORKFLOW_DECL) if tags::node_name(decl) == Some(name) => {
                return Some(decl);
            }
            Some(tags::NAMESPACE) => {
                if let Some(found) = search_namespace_workflows(decl, name) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    for ns in array(namespace, "namespaces") {
        if let Some(found) = search_namespace_workflows(ns, name) {
            return Some(found);
        }
    }
    None
}

/// Return every `WorkflowDecl` in `program`, including inside namespaces.
pub fn find_all_workflows(program: &Value) -> Vec<&Value> {
    let mut acc = Vec::new();
    collect_workflows(program, &mut acc);
    acc
}

fn collect_workflows<'a>(node: &'a Value, acc: &mut Vec<&'a Value>) {
    for w in array(node, "workflows") {
        acc.push(w);
    }
    for decl in array(node, tags::DECLARATIONS) {
        match tags::node_type(decl) {
            Some(tags::WORKFLOW_DECL) => {
                // Both keys can be present on unnormalized programs.
                if !acc.contains(&decl) {
                    acc.push(decl);
                }
            }
            Some(tags::NAMESPACE) => collect_workflows(decl, acc),
            _ => {}
        }
    }
    for ns in array(node, "namespaces") {
        collect_workflows(ns, acc);
    }
}

/// Find a facet declaration by simple or qualified name and report its
/// kind. The short-name form matches the first facet with that trailing
/// name, searching namespaces depth-first.
pub fn find_facet<'a>(program: &'a Value, facet_name: &str) -> Option<(&'a Value, FacetKind)> {
    let short = facet_name.rsplit('.').next().unwrap_or(facet_name);
    let ns_prefix = facet_name.rsplit_once('.').map(|(p, _)| p);

    search_facets(program, short, ns_prefix, None)
}

fn search_facets<'a>(
    node: &'a Value,
    short: &str,
    ns_prefix: Option<&str>,
    current_ns: Option<&str>,
) -> Option<(&'a Value, FacetKind)> {
    let ns_matches = match ns_prefix {
        Some(prefix) => current_ns == Some(prefix),
        None => true,
    };

    if ns_matches {
        for f in array(node, "facets") {
            if tags::node_name(f) == Some(short) {
                return Some((f, FacetKind::Regular));
            }
        }
        for f in array(node, "eventFacets") {
            if tags::node_name(f) == Some(short) {
                return Some((f, FacetKind::Event));
            }
        }
        for decl in array(node, tags::DECLARATIONS) {
            match tags::node_type(decl) {
                Some(tags::FACET_DECL) if tags::node_name(decl) == Some(short) => {
                    return Some((decl, FacetKind::Regular));
                }
                Some(tags::EVENT_FACET_DECL) if tags::node_name(decl) == Some(short) => {
                    return Some((decl, FacetKind::Event));
                }
                _ => {}
            }
        }
    }

    let namespaces = array(node, "namespaces").chain(
        array(node, tags::DECLARATIONS)
            .filter(|d| tags::node_type(d) == Some(tags::NAMESPACE)),
    );
    for ns in namespaces {
        let ns_name = match (current_ns, tags::node_name(ns)) {
            (Some(parent), Some(name)) => Some(format!("{parent}.{name}")),
            (None, Some(name)) => Some(name.to_string()),
            _ => None,
        };
        if let Some(found) = search_facets(ns, short, ns_prefix, ns_name.as_deref()) {
            return Some(found);
        }
    }

    None
}

/// Resolve a call target to its namespace-qualified facet name.
///
/// A target that already carries a dot is returned as-is; otherwise the
/// program is searched and the declaring namespace prepended. Targets the
/// program does not declare are returned unchanged (the dispatcher's
/// short-name fallback covers them).
pub fn qualify_facet_name(program: Option<&Value>, target: &str) -> String {
    if target.contains('.') {
        return target.to_string();
    }
    let Some(program) = program else {
        return target.to_string();
    };
    qualify_in(program, target, None).unwrap_or_else(|| target.to_string())
}

fn qualify_in(node: &Value, target: &str, current_ns: Option<&str>) -> Option<String> {
    let declared_here = array(node, "facets")
        .chain(array(node, "eventFacets"))
        .any(|f| tags::node_name(f) == Some(target))
        || array(node, tags::DECLARATIONS).any(|d| {
            matches!(
                tags::node_type(d),
                Some(tags::FACET_DECL) | Some(tags::EVENT_FACET_DECL)
            ) && tags::node_name(d) == Some(target)
        });

    if declared_here {
        return Some(match current_ns {
            Some(ns) => format!("{ns}.{target}"),
            None => target.to_string(),
        });
    }

    let namespaces = array(node, "namespaces").chain(
        array(node, tags::DECLARATIONS)
            .filter(|d| tags::node_type(d) == Some(tags::NAMESPACE)),
    );
    for ns in namespaces {
        let ns_name = match (current_ns, tags::node_name(ns)) {
            (Some(parent), Some(name)) => Some(format!("{parent}.{name}")),
            (None, Some(name)) => Some(name.to_string()),
            _ => None,
        };
        if let Some(found) = qualify_in(ns, target, ns_name.as_deref()) {
            return Some(found);
        }
    }
    None
}

fn array<'a>(node: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    node.get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter())
        .unwrap_or_default()
}
