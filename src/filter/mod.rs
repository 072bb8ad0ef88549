//! Filter Engine
//!
//! Boolean rule groups evaluated against feed payloads.
//!
//! - [`model`]: persisted filter definitions and save-time validation
//! - [`evaluator`]: compiled evaluation of a filter set against a payload
//! - [`introspect`]: field discovery for filter editors

pub mod error;
pub mod evaluator;
pub mod introspect;
pub mod model;

pub use error::{FilterError, FilterResult};
pub use evaluator::{
    evaluate, evaluate_group, evaluate_groups, evaluate_rule, CompiledFilter, FilterOutcome,
};
pub use introspect::{available_fields, FieldInfo};
pub use model::{Condition, FilterGroup, FilterRule, FilterSet, Operator, RuleValue};
