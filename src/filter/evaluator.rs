//! Filter Evaluator
//!
//! Pure evaluation of a [`FilterSet`] against a payload. A filter set is
//! compiled once when it is bound to a subscription so that regex patterns are
//! not rebuilt per event; [`evaluate`] and [`evaluate_rule`] compile on the fly
//! for one-shot callers such as the preview endpoint.

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tracing::{debug, warn};

use super::model::{Condition, FilterGroup, FilterRule, FilterSet, Operator};
use crate::value::{coerce_number, coerce_string, resolve_path};

/// Compiled regex size cap, bounds pattern compilation cost
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Result of filtering one payload
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Array payload: matching records in source order
    Records { matched: Vec<Value>, total: usize },
    /// Scalar or object payload that passed
    Matched(Value),
    /// Scalar or object payload that did not pass
    NoMatch,
}

impl FilterOutcome {
    pub fn match_count(&self) -> usize {
        match self {
            Self::Records { matched, .. } => matched.len(),
            Self::Matched(_) => 1,
            Self::NoMatch => 0,
        }
    }

    pub fn total_count(&self) -> usize {
        match self {
            Self::Records { total, .. } => *total,
            Self::Matched(_) | Self::NoMatch => 1,
        }
    }

    /// The filtered data, `None` for the no-match sentinel
    pub fn into_data(self) -> Option<Value> {
        match self {
            Self::Records { matched, .. } => Some(Value::Array(matched)),
            Self::Matched(value) => Some(value),
            Self::NoMatch => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Pattern {
    None,
    Valid(Regex),
    Invalid(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: FilterRule,
    pattern: Pattern,
}

impl CompiledRule {
    fn new(rule: FilterRule) -> Self {
        if rule.operator == Operator::Unknown {
            warn!(field = %rule.field, "Unknown filter operator, rule will pass all records");
        }

        let pattern = if rule.operator == Operator::Regex {
            let source = rule.value.as_scalar().map(coerce_string).unwrap_or_default();
            match RegexBuilder::new(&source)
                .case_insensitive(true)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
            {
                Ok(regex) => Pattern::Valid(regex),
                Err(e) => {
                    warn!(field = %rule.field, pattern = %source, error = %e, "Invalid regex in filter rule");
                    Pattern::Invalid(e.to_string())
                }
            }
        } else {
            Pattern::None
        };

        Self { rule, pattern }
    }

    fn matches(&self, record: &Value) -> bool {
        let rule = &self.rule;
        let actual = resolve_path(record, &rule.field);

        match rule.operator {
            Operator::Unknown => true,
            Operator::NotEquals => match (actual, rule.value.as_scalar()) {
                (None, _) => true,
                (Some(actual), Some(expected)) => !loosely_equal(actual, expected),
                (Some(_), None) => true,
            },
            _ => {
                let Some(actual) = actual else {
                    return false;
                };
                self.apply(actual)
            }
        }
    }

    fn apply(&self, actual: &Value) -> bool {
        let rule = &self.rule;

        if rule.operator == Operator::InRange {
            return match (coerce_number(actual), rule.value.as_range()) {
                (Some(x), Some((min, max))) => min <= x && x <= max,
                _ => false,
            };
        }

        if rule.operator == Operator::Regex {
            return match &self.pattern {
                Pattern::Valid(regex) => regex.is_match(&coerce_string(actual)),
                Pattern::Invalid(error) => {
                    debug!(field = %rule.field, error = %error, "Skipping rule with invalid regex");
                    false
                }
                Pattern::None => false,
            };
        }

        let Some(expected) = rule.value.as_scalar() else {
            return false;
        };

        match rule.operator {
            Operator::Equals => loosely_equal(actual, expected),
            Operator::Contains => lower(actual).contains(&lower(expected)),
            Operator::NotContains => !lower(actual).contains(&lower(expected)),
            Operator::StartsWith => lower(actual).starts_with(&lower(expected)),
            Operator::EndsWith => lower(actual).ends_with(&lower(expected)),
            Operator::GreaterThan => numeric(actual, expected, |a, b| a > b),
            Operator::LessThan => numeric(actual, expected, |a, b| a < b),
            Operator::GreaterThanOrEqual => numeric(actual, expected, |a, b| a >= b),
            Operator::LessThanOrEqual => numeric(actual, expected, |a, b| a <= b),
            Operator::NotEquals | Operator::InRange | Operator::Regex | Operator::Unknown => {
                false
            }
        }
    }
}

fn lower(value: &Value) -> String {
    coerce_string(value).to_lowercase()
}

fn numeric(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (coerce_number(actual), coerce_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Numeric equality when both sides are numeric, string equality otherwise
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (coerce_number(a), coerce_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => coerce_string(a) == coerce_string(b),
    }
}

#[derive(Debug, Clone)]
struct CompiledGroup {
    condition: Condition,
    rules: Vec<CompiledRule>,
}

impl CompiledGroup {
    fn new(group: &FilterGroup) -> Self {
        Self {
            condition: group.condition,
            rules: group
                .rules
                .iter()
                .filter(|rule| rule.enabled)
                .cloned()
                .map(CompiledRule::new)
                .collect(),
        }
    }

    fn matches(&self, record: &Value) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        match self.condition {
            Condition::And => self.rules.iter().all(|rule| rule.matches(record)),
            Condition::Or => self.rules.iter().any(|rule| rule.matches(record)),
        }
    }
}

/// A filter set ready for repeated evaluation
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    id: String,
    name: String,
    enabled: bool,
    group_condition: Condition,
    groups: Vec<CompiledGroup>,
}

impl CompiledFilter {
    /// Compile a filter set. Disabled groups and rules are dropped here.
    pub fn compile(set: &FilterSet) -> Self {
        Self {
            id: set.id.clone(),
            name: set.name.clone(),
            enabled: set.enabled,
            group_condition: set.group_condition,
            groups: set
                .groups
                .iter()
                .filter(|group| group.enabled)
                .map(CompiledGroup::new)
                .collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Master switch; a disabled filter is bypassed by the hub
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether one record passes the group combination
    pub fn matches(&self, record: &Value) -> bool {
        if self.groups.is_empty() {
            return true;
        }
        match self.group_condition {
            Condition::And => self.groups.iter().all(|group| group.matches(record)),
            Condition::Or => self.groups.iter().any(|group| group.matches(record)),
        }
    }

    /// Filter a payload: arrays per record, anything else as a whole
    pub fn evaluate(&self, data: &Value) -> FilterOutcome {
        match data {
            Value::Array(records) => FilterOutcome::Records {
                matched: records
                    .iter()
                    .filter(|record| self.matches(record))
                    .cloned()
                    .collect(),
                total: records.len(),
            },
            other if self.matches(other) => FilterOutcome::Matched(other.clone()),
            _ => FilterOutcome::NoMatch,
        }
    }
}

/// Evaluate a filter set against a payload
pub fn evaluate(set: &FilterSet, data: &Value) -> FilterOutcome {
    CompiledFilter::compile(set).evaluate(data)
}

/// Combine the enabled groups with `condition`; no enabled groups passes
pub fn evaluate_groups(groups: &[FilterGroup], condition: Condition, record: &Value) -> bool {
    let mut enabled = groups.iter().filter(|group| group.enabled).peekable();
    if enabled.peek().is_none() {
        return true;
    }
    match condition {
        Condition::And => enabled.all(|group| evaluate_group(group, record)),
        Condition::Or => enabled.any(|group| evaluate_group(group, record)),
    }
}

/// Combine a group's enabled rules with its condition; no enabled rules passes
pub fn evaluate_group(group: &FilterGroup, record: &Value) -> bool {
    CompiledGroup::new(group).matches(record)
}

/// Evaluate one rule. Never panics; invalid patterns yield `false`.
pub fn evaluate_rule(rule: &FilterRule, record: &Value) -> bool {
    CompiledRule::new(rule.clone()).matches(record)
}
