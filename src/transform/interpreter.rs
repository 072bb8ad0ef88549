//! Transform Interpreter
//!
//! Executes a [`Script`] against a JSON value. The interpreter only manipulates
//! the value it is given: there is no stage that can reach the network, the
//! filesystem or the clock beyond the deadline check. Every element visited is
//! charged against a step budget and the wall-clock deadline is checked as the
//! budget is spent.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::time::{Duration, Instant};

use super::ast::{CompareOp, Projection, Script, Stage};
use super::TransformError;
use crate::value::{coerce_number, coerce_string, resolve_path};

/// Execution bounds for a transform run
#[derive(Debug, Clone, Copy)]
pub struct TransformLimits {
    /// Maximum element visits per run
    pub max_steps: u64,
    /// Wall-clock deadline per run
    pub timeout: Duration,
}

impl Default for TransformLimits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            timeout: Duration::from_millis(250),
        }
    }
}

/// A parsed script bound to its execution limits
#[derive(Debug, Clone)]
pub struct Transform {
    script: Script,
    limits: TransformLimits,
}

impl Transform {
    pub fn new(script: Script, limits: TransformLimits) -> Self {
        Self { script, limits }
    }

    /// Parse and bind a script
    pub fn compile(source: &str, limits: TransformLimits) -> Result<Self, TransformError> {
        Ok(Self::new(super::parse_script(source)?, limits))
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Run the pipeline over `input`
    pub fn apply(&self, input: Value) -> Result<Value, TransformError> {
        let mut budget = Budget::new(self.limits);
        self.script
            .stages
            .iter()
            .try_fold(input, |value, stage| run_stage(stage, value, &mut budget))
    }
}

struct Budget {
    remaining: u64,
    limits: TransformLimits,
    deadline: Instant,
}

impl Budget {
    fn new(limits: TransformLimits) -> Self {
        Self {
            remaining: limits.max_steps,
            limits,
            deadline: Instant::now() + limits.timeout,
        }
    }

    fn charge(&mut self, steps: u64) -> Result<(), TransformError> {
        if steps > self.remaining {
            return Err(TransformError::StepBudgetExceeded(self.limits.max_steps));
        }
        self.remaining -= steps;

        if Instant::now() >= self.deadline {
            return Err(TransformError::Timeout(self.limits.timeout.as_millis() as u64));
        }
        Ok(())
    }
}

fn run_stage(stage: &Stage, input: Value, budget: &mut Budget) -> Result<Value, TransformError> {
    budget.charge(1)?;

    match stage {
        Stage::Get(path) => Ok(resolve_path(&input, path).cloned().unwrap_or(Value::Null)),
        Stage::Pick(fields) => match input {
            Value::Array(items) => {
                budget.charge(items.len() as u64 * fields.len().max(1) as u64)?;
                Ok(Value::Array(
                    items.iter().map(|item| project(item, fields)).collect(),
                ))
            }
            other => {
                budget.charge(fields.len() as u64)?;
                Ok(project(&other, fields))
            }
        },
        Stage::Where { path, op, literal } => {
            let items = expect_array(input, "where")?;
            budget.charge(items.len() as u64)?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .filter(|item| compare(resolve_path(item, path), *op, literal))
                    .collect(),
            ))
        }
        Stage::Sort { path, descending } => {
            let mut items = expect_array(input, "sort")?;
            let n = items.len() as u64;
            let log_n = 64 - n.leading_zeros() as u64;
            budget.charge(n.saturating_mul(log_n.max(1)))?;

            items.sort_by(|a, b| {
                let ordering = order_values(resolve_path(a, path), resolve_path(b, path));
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(Value::Array(items))
        }
        Stage::Limit(n) => match input {
            Value::Array(mut items) => {
                items.truncate(*n);
                Ok(Value::Array(items))
            }
            other => Ok(other),
        },
        Stage::Flatten => {
            let items = expect_array(input, "flatten")?;
            let mut flat = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(inner) => {
                        budget.charge(inner.len() as u64)?;
                        flat.extend(inner);
                    }
                    other => {
                        budget.charge(1)?;
                        flat.push(other);
                    }
                }
            }
            Ok(Value::Array(flat))
        }
        Stage::Wrap(key) => {
            let mut map = Map::new();
            map.insert(key.clone(), input);
            Ok(Value::Object(map))
        }
        Stage::Count => {
            let items = expect_array(input, "count")?;
            Ok(Value::from(items.len()))
        }
    }
}

fn expect_array(value: Value, stage: &str) -> Result<Vec<Value>, TransformError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(TransformError::Type(format!(
            "'{}' expects an array, got {}",
            stage,
            crate::value::kind_of(&other)
        ))),
    }
}

fn project(item: &Value, fields: &[Projection]) -> Value {
    let mut map = Map::new();
    for field in fields {
        let value = resolve_path(item, &field.path)
            .cloned()
            .unwrap_or(Value::Null);
        map.insert(field.output_key().to_string(), value);
    }
    Value::Object(map)
}

fn compare(actual: Option<&Value>, op: CompareOp, literal: &Value) -> bool {
    let actual = match actual {
        Some(value) => value,
        None => return op == CompareOp::Ne,
    };

    match op {
        CompareOp::Eq => loosely_equal(actual, literal),
        CompareOp::Ne => !loosely_equal(actual, literal),
        CompareOp::Contains => coerce_string(actual)
            .to_lowercase()
            .contains(&coerce_string(literal).to_lowercase()),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            match (coerce_number(actual), coerce_number(literal)) {
                (Some(a), Some(b)) => match op {
                    CompareOp::Gt => a > b,
                    CompareOp::Gte => a >= b,
                    CompareOp::Lt => a < b,
                    _ => a <= b,
                },
                _ => false,
            }
        }
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (coerce_number(a), coerce_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => coerce_string(a) == coerce_string(b),
    }
}

/// Numbers before strings; missing values sort last
fn order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (coerce_number(a), coerce_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => coerce_string(a).cmp(&coerce_string(b)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, input: Value) -> Result<Value, TransformError> {
        Transform::compile(source, TransformLimits::default())
            .unwrap()
            .apply(input)
    }

    fn prices() -> Value {
        json!({"data": {"items": [
            {"symbol": "BTC", "price": 50000},
            {"symbol": "DOGE", "price": 0.1},
            {"symbol": "ETH", "price": 3000},
            {"symbol": "SOL", "price": "150"}
        ]}})
    }

    #[test]
    fn test_identity() {
        let out = run("", json!({"a": 1})).unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[test]
    fn test_pipeline() {
        let out = run(
            "get data.items | where price > 100 | sort price desc | pick symbol, price as p | limit 2",
            prices(),
        )
        .unwrap();

        assert_eq!(
            out,
            json!([
                {"symbol": "BTC", "p": 50000},
                {"symbol": "ETH", "p": 3000}
            ])
        );
    }

    #[test]
    fn test_where_contains_and_missing() {
        let out = run("get data.items | where symbol ~= 'o' | count", prices()).unwrap();
        assert_eq!(out, json!(2));

        let out = run("get data.items | where volume != 1 | count", prices()).unwrap();
        assert_eq!(out, json!(4));
    }

    #[test]
    fn test_flatten_and_wrap() {
        let out = run("flatten | wrap rows", json!([[1, 2], [3], 4])).unwrap();
        assert_eq!(out, json!({"rows": [1, 2, 3, 4]}));
    }

    #[test]
    fn test_type_error() {
        let err = run("where a == 1", json!({"a": 1})).unwrap_err();
        assert!(matches!(err, TransformError::Type(_)));
    }

    #[test]
    fn test_get_missing_is_null() {
        assert_eq!(run("get nope.nothing", prices()).unwrap(), Value::Null);
    }

    #[test]
    fn test_step_budget_exceeded() {
        let transform = Transform::compile(
            "where x > 1",
            TransformLimits {
                max_steps: 10,
                timeout: Duration::from_secs(5),
            },
        )
        .unwrap();

        let input = Value::Array((0..100).map(|i| json!({"x": i})).collect());
        let err = transform.apply(input).unwrap_err();
        assert!(matches!(err, TransformError::StepBudgetExceeded(10)));
    }

    #[test]
    fn test_deadline_exceeded() {
        let transform = Transform::compile(
            "count",
            TransformLimits {
                max_steps: 1_000,
                timeout: Duration::ZERO,
            },
        )
        .unwrap();

        let err = transform.apply(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, TransformError::Timeout(0)));
    }
}
