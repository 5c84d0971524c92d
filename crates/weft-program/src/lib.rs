//! # Weft Program IR
//!
//! Utilities for compiled Weft programs. A compiled program is a tree of
//! tagged JSON nodes (every node carries a `type` tag); this crate keeps
//! the tree as [`serde_json::Value`] and layers typed views on top where
//! the runtime needs them:
//!
//! - [`normalize_program`] folds the compiler's legacy categorized keys
//!   (`workflows`, `facets`, `eventFacets`, …) into a single
//!   `declarations` list per container. Idempotent and non-mutating.
//! - [`find_workflow`] / [`find_all_workflows`] locate `WorkflowDecl`
//!   nodes by simple or dotted qualified name, on normalized and
//!   unnormalized programs alike.
//! - [`find_facet`] / [`qualify_facet_name`] resolve facet declarations
//!   and their namespace-qualified names.
//! - [`Expr`] is the typed expression tree deserialized from argument
//!   values inside `StepStmt` / `YieldStmt` nodes.

mod expr;
mod find;
mod normalize;

pub mod tags;

pub use expr::{Expr, MapEntry, PathSegment};
pub use find::{find_all_workflows, find_facet, find_workflow, qualify_facet_name, FacetKind};
pub use normalize::normalize_program;
