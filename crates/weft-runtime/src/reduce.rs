//! Pure expression reduction.
//!
//! `reduce(expr, env)` evaluates a compiled expression over the workflow's
//! input attributes, the returns of completed sibling steps, and — inside
//! foreach bodies — the loop-variable binding. Reduction is deterministic
//! and side-effect free; `CallExpr` nodes are never reduced (they mark a
//! step boundary).
//!
//! Numeric semantics: `/` is integer division when both operands are
//! integers; mixed-numeric arithmetic coerces to floating-point.
//! Comparison across unlike types fails. Missing references are
//! `ReferenceError`s; type mismatches, division by zero and out-of-range
//! indexing are `EvaluationError`s.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};
use weft_program::{Expr, PathSegment};

use crate::error::RuntimeError;

/// The environment a reduction runs against.
#[derive(Debug, Default)]
pub struct EvalEnv<'a> {
    /// Workflow input attributes.
    pub inputs: Option<&'a Map<String, Value>>,
    /// Completed sibling returns, keyed by statement binding name.
    pub steps: Option<&'a HashMap<String, Map<String, Value>>>,
    /// Foreach loop binding, `(var, element)`.
    pub binding: Option<(&'a str, &'a Value)>,
}

impl<'a> EvalEnv<'a> {
    fn input(&self, name: &str) -> Option<&'a Value> {
        if let Some(inputs) = self.inputs {
            if let Some(v) = inputs.get(name) {
                return Some(v);
            }
        }
        match self.binding {
            Some((var, value)) if var == name => Some(value),
            _ => None,
        }
    }

    fn step_returns(&self, name: &str) -> Option<&'a Map<String, Value>> {
        self.steps.and_then(|s| s.get(name))
    }
}

/// Reduce an expression to a value.
pub fn reduce(expr: &Expr, env: &EvalEnv<'_>) -> Result<Value, RuntimeError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Int { value } => Ok(Value::from(*value)),
        Expr::Float { value } => Ok(Value::from(*value)),
        Expr::Bool { value } => Ok(Value::Bool(*value)),
        Expr::Str { value } => Ok(Value::String(value.clone())),
        Expr::Null => Ok(Value::Null),

        Expr::InputRef { path } => {
            let root = key_root(path, "$")?;
            let base = env
                .input(root)
                .ok_or_else(|| RuntimeError::Reference(format!("$.{root}")))?;
            navigate(base, &path[1..], &format!("$.{root}"))
        }

        Expr::StepRef { path } => {
            let root = key_root(path, "step")?;
            // A loop binding shadows sibling names in the body.
            if let Some((var, value)) = env.binding {
                if var == root {
                    return navigate(value, &path[1..], root);
                }
            }
            let returns = env
                .step_returns(root)
                .ok_or_else(|| RuntimeError::Reference(root.to_string()))?;
            let base = Value::Object(returns.clone());
            navigate(&base, &path[1..], root)
        }

        Expr::BinaryExpr {
            operator,
            left,
            right,
        } => reduce_binary(operator, left, right, env),

        Expr::UnaryExpr { operator, operand } => {
            let value = reduce(operand, env)?;
            match (operator.as_str(), &value) {
                ("-", Value::Number(n)) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(-i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(Value::from(-f))
                    } else {
                        Err(type_error("unary -", &value))
                    }
                }
                ("!", Value::Bool(b)) => Ok(Value::Bool(!b)),
                _ => Err(type_error(&format!("unary {operator}"), &value)),
            }
        }

        Expr::ArrayLiteral { elements } => {
            let values: Result<Vec<Value>, _> = elements.iter().map(|e| reduce(e, env)).collect();
            Ok(Value::Array(values?))
        }

        Expr::MapLiteral { entries } => {
            let mut map = Map::new();
            for entry in entries {
                map.insert(entry.key.clone(), reduce(&entry.value, env)?);
            }
            Ok(Value::Object(map))
        }

        Expr::IndexExpr { target, index } => {
            let target = reduce(target, env)?;
            let index = reduce(index, env)?;
            index_value(&target, &index)
        }

        Expr::ConcatExpr { parts } => {
            let mut out = String::new();
            for part in parts {
                let value = reduce(part, env)?;
                out.push_str(&stringify(&value)?);
            }
            Ok(Value::String(out))
        }

        Expr::CallExpr => Err(RuntimeError::Evaluation(
            "call expressions mark a step boundary and are not reducible".into(),
        )),
    }
}

/// Reduce every named argument of a statement's call into `(name, value)`
/// pairs.
pub fn reduce_args(
    args: impl Iterator<Item = (String, Expr)>,
    env: &EvalEnv<'_>,
) -> Result<Vec<(String, Value)>, RuntimeError> {
    args.map(|(name, expr)| Ok((name, reduce(&expr, env)?)))
        .collect()
}

fn key_root<'p>(path: &'p [PathSegment], what: &str) -> Result<&'p str, RuntimeError> {
    match path.first() {
        Some(PathSegment::Key(root)) => Ok(root),
        _ => Err(RuntimeError::Reference(format!("empty {what} reference"))),
    }
}

fn navigate(base: &Value, rest: &[PathSegment], context: &str) -> Result<Value, RuntimeError> {
    let mut current = base;
    let mut trail = context.to_string();
    for segment in rest {
        match segment {
            PathSegment::Key(key) => {
                trail = format!("{trail}.{key}");
                current = current
                    .get(key)
                    .ok_or_else(|| RuntimeError::Reference(trail.clone()))?;
            }
            PathSegment::Index(i) => {
                trail = format!("{trail}[{i}]");
                current = current
                    .get(*i as usize)
                    .ok_or_else(|| RuntimeError::Reference(trail.clone()))?;
            }
        }
    }
    Ok(current.clone())
}

fn reduce_binary(
    operator: &str,
    left: &Expr,
    right: &Expr,
    env: &EvalEnv<'_>,
) -> Result<Value, RuntimeError> {
    // Logical operators short-circuit: the right side may not reduce.
    match operator {
        "&&" => {
            let l = expect_bool(&reduce(left, env)?, operator)?;
            if !l {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(expect_bool(&reduce(right, env)?, operator)?));
        }
        "||" => {
            let l = expect_bool(&reduce(left, env)?, operator)?;
            if l {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(expect_bool(&reduce(right, env)?, operator)?));
        }
        _ => {}
    }

    let l = reduce(left, env)?;
    let r = reduce(right, env)?;

    match operator {
        "+" => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => arithmetic(operator, &l, &r),
        },
        "-" | "*" | "/" | "%" => arithmetic(operator, &l, &r),
        "==" => Ok(Value::Bool(values_equal(&l, &r)?)),
        "!=" => Ok(Value::Bool(!values_equal(&l, &r)?)),
        "<" | "<=" | ">" | ">=" => compare(operator, &l, &r),
        _ => Err(RuntimeError::Evaluation(format!(
            "unknown operator '{operator}'"
        ))),
    }
}

fn arithmetic(operator: &str, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let (Value::Number(a), Value::Number(b)) = (l, r) else {
        return Err(RuntimeError::Evaluation(format!(
            "operator '{operator}' requires numeric operands, got {} and {}",
            kind(l),
            kind(r)
        )));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match operator {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" => {
                if y == 0 {
                    return Err(RuntimeError::Evaluation("division by zero".into()));
                }
                x.checked_div(y)
            }
            "%" => {
                if y == 0 {
                    return Err(RuntimeError::Evaluation("division by zero".into()));
                }
                x.checked_rem(y)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| RuntimeError::Evaluation("integer overflow".into()));
    }

    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    let result = match operator {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => {
            if y == 0.0 {
                return Err(RuntimeError::Evaluation("division by zero".into()));
            }
            x / y
        }
        "%" => {
            if y == 0.0 {
                return Err(RuntimeError::Evaluation("division by zero".into()));
            }
            x % y
        }
        _ => unreachable!(),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| RuntimeError::Evaluation("non-finite arithmetic result".into()))
}

fn values_equal(l: &Value, r: &Value) -> Result<bool, RuntimeError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                Ok(x == y)
            } else {
                Ok(a.as_f64() == b.as_f64())
            }
        }
        (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_))
        | (Value::Null, Value::Null)
        | (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_)) => Ok(l == r),
        _ => Err(RuntimeError::Evaluation(format!(
            "cannot compare {} with {}",
            kind(l),
            kind(r)
        ))),
    }
}

fn compare(operator: &str, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .ok_or_else(|| RuntimeError::Evaluation("incomparable numbers".into()))?,
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            return Err(RuntimeError::Evaluation(format!(
                "cannot compare {} with {}",
                kind(l),
                kind(r)
            )))
        }
    };

    let result = match operator {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn index_value(target: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .filter(|i| *i >= 0)
                .ok_or_else(|| RuntimeError::Evaluation("index must be a non-negative integer".into()))?;
            items
                .get(i as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::Evaluation(format!("index {i} out of range")))
        }
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::Evaluation(format!("key '{key}' not found"))),
        _ => Err(RuntimeError::Evaluation(format!(
            "cannot index {} with {}",
            kind(target),
            kind(index)
        ))),
    }
}

fn stringify(value: &Value) -> Result<String, RuntimeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
        Value::Array(_) | Value::Object(_) => Err(RuntimeError::Evaluation(
            "cannot interpolate a collection".into(),
        )),
    }
}

fn expect_bool(value: &Value, operator: &str) -> Result<bool, RuntimeError> {
    value
        .as_bool()
        .ok_or_else(|| type_error(operator, value))
}

fn type_error(operator: &str, value: &Value) -> RuntimeError {
    RuntimeError::Evaluation(format!("operator '{operator}' not defined for {}", kind(value)))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expr(v: Value) -> Expr {
        Expr::from_ir(&v).unwrap()
    }

    fn eval(v: Value) -> Result<Value, RuntimeError> {
        reduce(&expr(v), &EvalEnv::default())
    }

    fn eval_with<'a>(v: Value, env: &EvalEnv<'a>) -> Result<Value, RuntimeError> {
        reduce(&expr(v), env)
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(
            eval(json!({"type": "BinaryExpr", "operator": "+",
                "left": {"type": "Int", "value": 2}, "right": {"type": "Int", "value": 3}}))
            .unwrap(),
            json!(5)
        );
        assert_eq!(
            eval(json!({"type": "BinaryExpr", "operator": "/",
                "left": {"type": "Int", "value": 7}, "right": {"type": "Int", "value": 2}}))
            .unwrap(),
            json!(3)
        );
        assert_eq!(
            eval(json!({"type": "BinaryExpr", "operator": "%",
                "left": {"type": "Int", "value": 7}, "right": {"type": "Int", "value": 2}}))
            .unwrap(),
            json!(1)
        );
    }

    #[test]
    fn mixed_arithmetic_coerces_to_float() {
        let result = eval(json!({"type": "BinaryExpr", "operator": "*",
            "left": {"type": "Int", "value": 2}, "right": {"type": "Float", "value": 1.5}}))
        .unwrap();
        assert_eq!(result, json!(3.0));
    }

    #[test]
    fn division_by_zero_fails() {
        let err = eval(json!({"type": "BinaryExpr", "operator": "/",
            "left": {"type": "Int", "value": 1}, "right": {"type": "Int", "value": 0}}))
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Evaluation(_)));
    }

    #[test]
    fn string_concatenation_via_plus() {
        assert_eq!(
            eval(json!({"type": "BinaryExpr", "operator": "+",
                "left": {"type": "String", "value": "Hello, "},
                "right": {"type": "String", "value": "World!"}}))
            .unwrap(),
            json!("Hello, World!")
        );
    }

    #[test]
    fn comparison_and_logic() {
        assert_eq!(
            eval(json!({"type": "BinaryExpr", "operator": "<",
                "left": {"type": "Int", "value": 1}, "right": {"type": "Int", "value": 2}}))
            .unwrap(),
            json!(true)
        );
        assert_eq!(
            eval(json!({"type": "BinaryExpr", "operator": "&&",
                "left": {"type": "Bool", "value": true}, "right": {"type": "Bool", "value": false}}))
            .unwrap(),
            json!(false)
        );
    }

    #[test]
    fn logic_short_circuits() {
        // The right side would fail if reduced: unknown reference.
        let result = eval(json!({"type": "BinaryExpr", "operator": "||",
            "left": {"type": "Bool", "value": true},
            "right": {"type": "StepRef", "path": ["missing", "out"]}}))
        .unwrap();
        assert_eq!(result, json!(true));
    }

    #[test]
    fn unlike_type_comparison_fails() {
        let err = eval(json!({"type": "BinaryExpr", "operator": "<",
            "left": {"type": "Int", "value": 1}, "right": {"type": "String", "value": "x"}}))
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Evaluation(_)));
    }

    #[test]
    fn unary_operators() {
        assert_eq!(
            eval(json!({"type": "UnaryExpr", "operator": "-", "operand": {"type": "Int", "value": 4}}))
                .unwrap(),
            json!(-4)
        );
        assert_eq!(
            eval(json!({"type": "UnaryExpr", "operator": "!", "operand": {"type": "Bool", "value": false}}))
                .unwrap(),
            json!(true)
        );
    }

    #[test]
    fn input_reference_with_path() {
        let inputs = json!({"sample": {"uris": ["a.fastq", "b.fastq"]}});
        let inputs = inputs.as_object().unwrap();
        let env = EvalEnv {
            inputs: Some(inputs),
            ..Default::default()
        };

        assert_eq!(
            eval_with(json!({"type": "InputRef", "path": ["sample", "uris", 1]}), &env).unwrap(),
            json!("b.fastq")
        );

        let err = eval_with(json!({"type": "InputRef", "path": ["missing"]}), &env).unwrap_err();
        assert!(matches!(err, RuntimeError::Reference(_)));
    }

    #[test]
    fn step_reference_reads_sibling_returns() {
        let mut steps = HashMap::new();
        steps.insert(
            "s1".to_string(),
            json!({"input": 2}).as_object().unwrap().clone(),
        );
        let env = EvalEnv {
            steps: Some(&steps),
            ..Default::default()
        };

        assert_eq!(
            eval_with(json!({"type": "StepRef", "path": ["s1", "input"]}), &env).unwrap(),
            json!(2)
        );

        let err =
            eval_with(json!({"type": "StepRef", "path": ["unknown", "x"]}), &env).unwrap_err();
        assert!(matches!(err, RuntimeError::Reference(_)));
    }

    #[test]
    fn loop_binding_resolves_via_inputs() {
        let element = json!({"sample_id": "S1"});
        let env = EvalEnv {
            binding: Some(("sample", &element)),
            ..Default::default()
        };
        assert_eq!(
            eval_with(json!({"type": "InputRef", "path": ["sample", "sample_id"]}), &env).unwrap(),
            json!("S1")
        );
    }

    #[test]
    fn collections_and_indexing() {
        assert_eq!(
            eval(json!({"type": "ArrayLiteral", "elements": [
                {"type": "Int", "value": 1}, {"type": "Int", "value": 2}
            ]}))
            .unwrap(),
            json!([1, 2])
        );

        assert_eq!(
            eval(json!({"type": "IndexExpr",
                "target": {"type": "ArrayLiteral", "elements": [{"type": "Int", "value": 9}]},
                "index": {"type": "Int", "value": 0}}))
            .unwrap(),
            json!(9)
        );

        let err = eval(json!({"type": "IndexExpr",
            "target": {"type": "ArrayLiteral", "elements": []},
            "index": {"type": "Int", "value": 3}}))
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Evaluation(_)));
    }

    #[test]
    fn map_literal_and_missing_key() {
        assert_eq!(
            eval(json!({"type": "MapLiteral", "entries": [
                {"key": "a", "value": {"type": "Int", "value": 1}}
            ]}))
            .unwrap(),
            json!({"a": 1})
        );

        let err = eval(json!({"type": "IndexExpr",
            "target": {"type": "MapLiteral", "entries": []},
            "index": {"type": "String", "value": "nope"}}))
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Evaluation(_)));
    }

    #[test]
    fn concat_interpolates_scalars() {
        assert_eq!(
            eval(json!({"type": "ConcatExpr", "parts": [
                {"type": "String", "value": "n="},
                {"type": "Int", "value": 3}
            ]}))
            .unwrap(),
            json!("n=3")
        );
    }

    #[test]
    fn call_expr_is_not_reducible() {
        let err = eval(json!({"type": "CallExpr"})).unwrap_err();
        assert!(matches!(err, RuntimeError::Evaluation(_)));
    }
}
