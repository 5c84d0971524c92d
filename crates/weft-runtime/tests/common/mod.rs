//! Shared builders for compiled-program JSON used across the
//! integration tests.

use serde_json::{json, Map, Value};

pub fn inputs(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

pub fn int(v: i64) -> Value {
    json!({"type": "Int", "value": v})
}

pub fn string(v: &str) -> Value {
    json!({"type": "String", "value": v})
}

pub fn input_ref(path: &[&str]) -> Value {
    json!({"type": "InputRef", "path": path})
}

pub fn step_ref(path: &[&str]) -> Value {
    json!({"type": "StepRef", "path": path})
}

pub fn add(left: Value, right: Value) -> Value {
    json!({"type": "BinaryExpr", "operator": "+", "left": left, "right": right})
}

pub fn arg(name: &str, value: Value) -> Value {
    json!({"type": "NamedArg", "name": name, "value": value})
}

pub fn step_stmt(id: &str, name: &str, target: &str, args: Vec<Value>) -> Value {
    json!({
        "type": "StepStmt",
        "id": id,
        "name": name,
        "call": {"type": "CallExpr", "target": target, "args": args},
    })
}

pub fn yield_stmt(id: &str, target: &str, args: Vec<Value>) -> Value {
    json!({
        "type": "YieldStmt",
        "id": id,
        "call": {"type": "CallExpr", "target": target, "args": args},
    })
}

/// `TestOne(input: Long = 1) => (output: Long)`:
/// `s1 = Value(input = $.input + 1); s2 = Value(input = s1.input + 1);
/// yield TestOne(output = s2.input + 1)`.
pub fn test_one_workflow() -> Value {
    json!({
        "type": "WorkflowDecl",
        "name": "TestOne",
        "params": [{"name": "input", "type": "Long", "default": int(1)}],
        "returns": [{"name": "output", "type": "Long"}],
        "body": {
            "type": "AndThenBlock",
            "steps": [
                step_stmt("step-s1", "s1", "Value", vec![
                    arg("input", add(input_ref(&["input"]), int(1))),
                ]),
                step_stmt("step-s2", "s2", "Value", vec![
                    arg("input", add(step_ref(&["s1", "input"]), int(1))),
                ]),
            ],
            "yield": yield_stmt("yield-1", "TestOne", vec![
                arg("output", add(step_ref(&["s2", "input"]), int(1))),
            ]),
        },
    })
}

/// `TestTwo(input: Long = 1) => (output: Long)`: parallel `a`, `b`,
/// fan-in `c`, yield `c.input`.
pub fn test_two_workflow() -> Value {
    json!({
        "type": "WorkflowDecl",
        "name": "TestTwo",
        "params": [{"name": "input", "type": "Long", "default": int(1)}],
        "returns": [{"name": "output", "type": "Long"}],
        "body": {
            "type": "AndThenBlock",
            "steps": [
                step_stmt("step-a", "a", "Value", vec![
                    arg("input", add(input_ref(&["input"]), int(1))),
                ]),
                step_stmt("step-b", "b", "Value", vec![
                    arg("input", add(input_ref(&["input"]), int(10))),
                ]),
                step_stmt("step-c", "c", "Value", vec![
                    arg("input", add(step_ref(&["a", "input"]), step_ref(&["b", "input"]))),
                ]),
            ],
            "yield": yield_stmt("yield-1", "TestTwo", vec![
                arg("output", step_ref(&["c", "input"])),
            ]),
        },
    })
}

/// Single-step workflow calling the event facet `Greet`.
pub fn greet_workflow() -> Value {
    json!({
        "type": "WorkflowDecl",
        "name": "TestThree",
        "params": [],
        "returns": [{"name": "greeting", "type": "String"}],
        "body": {
            "type": "AndThenBlock",
            "steps": [
                step_stmt("step-g", "g", "Greet", vec![
                    arg("name", string("World")),
                ]),
            ],
            "yield": yield_stmt("yield-1", "TestThree", vec![
                arg("greeting", step_ref(&["g", "message"])),
            ]),
        },
    })
}

/// Program declaring `Greet` as an event facet plus the greet workflow.
pub fn greet_program() -> Value {
    json!({
        "type": "Program",
        "eventFacets": [{
            "type": "EventFacetDecl",
            "name": "Greet",
            "params": [{"name": "name", "type": "String"}],
            "returns": [{"name": "message", "type": "String"}],
        }],
        "workflows": [greet_workflow()],
    })
}
