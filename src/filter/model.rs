//! Filter Model
//!
//! Persisted filter definitions. A [`FilterSet`] holds ordered groups of rules;
//! each group combines its rules with its own condition and the set combines
//! the group results with `groupCondition`.
//!
//! ```json
//! {
//!   "id": "big-movers",
//!   "name": "Big movers",
//!   "groupCondition": "and",
//!   "groups": [
//!     {"condition": "and", "rules": [
//!       {"field": "changePercent24h", "operator": "greater_than", "value": 3}
//!     ]}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{FilterError, FilterResult};
use crate::value::coerce_number;

/// Boolean combinator for rules in a group, or groups in a set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    #[default]
    And,
    Or,
}

/// Rule operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    InRange,
    Regex,
    /// Any operator this version does not know; evaluates as a pass
    #[serde(other)]
    Unknown,
}

impl Operator {
    /// Whether the operator compares numerically
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::GreaterThan
                | Self::LessThan
                | Self::GreaterThanOrEqual
                | Self::LessThanOrEqual
                | Self::InRange
        )
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::GreaterThanOrEqual => "greater_than_or_equal",
            Self::LessThanOrEqual => "less_than_or_equal",
            Self::InRange => "in_range",
            Self::Regex => "regex",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Rule comparison value: a scalar, or an inclusive `{min, max}` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Range { min: Value, max: Value },
    Scalar(Value),
}

impl Default for RuleValue {
    fn default() -> Self {
        Self::Scalar(Value::Null)
    }
}

impl RuleValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn range(min: f64, max: f64) -> Self {
        Self::Range {
            min: Value::from(min),
            max: Value::from(max),
        }
    }

    /// The scalar value, if this is not a range
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Range { .. } => None,
        }
    }

    /// Numeric bounds, if this is a range with numeric bounds
    pub fn as_range(&self) -> Option<(f64, f64)> {
        match self {
            Self::Range { min, max } => Some((coerce_number(min)?, coerce_number(max)?)),
            Self::Scalar(_) => None,
        }
    }
}

/// A single field/operator/value test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Dot path into the record
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: RuleValue,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl FilterRule {
    pub fn new(field: impl Into<String>, operator: Operator, value: RuleValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Rules combined with the group's condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub condition: Condition,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl FilterGroup {
    pub fn new(condition: Condition, rules: Vec<FilterRule>) -> Self {
        Self {
            condition,
            enabled: true,
            rules,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A named, reusable filter definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSet {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<FilterGroup>,
    #[serde(default)]
    pub group_condition: Condition,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl FilterSet {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            groups: Vec::new(),
            group_condition: Condition::And,
            enabled: true,
        }
    }

    pub fn with_group(mut self, group: FilterGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_group_condition(mut self, condition: Condition) -> Self {
        self.group_condition = condition;
        self
    }

    /// Save-time validation.
    ///
    /// Disabled rules are still checked so that re-enabling one cannot
    /// activate a malformed range.
    pub fn validate(&self) -> FilterResult<()> {
        for (group_index, group) in self.groups.iter().enumerate() {
            for (rule_index, rule) in group.rules.iter().enumerate() {
                if rule.enabled && rule.field.trim().is_empty() {
                    return Err(FilterError::EmptyField {
                        group: group_index,
                        rule: rule_index,
                    });
                }

                if rule.operator == Operator::InRange {
                    match &rule.value {
                        RuleValue::Scalar(_) => {
                            return Err(FilterError::MissingRange(rule.field.clone()))
                        }
                        RuleValue::Range { .. } => {
                            let (min, max) = rule
                                .value
                                .as_range()
                                .ok_or_else(|| FilterError::NonNumericRange(rule.field.clone()))?;
                            if min > max {
                                return Err(FilterError::InvalidRange {
                                    field: rule.field.clone(),
                                    min,
                                    max,
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
