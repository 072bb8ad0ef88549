//! Transform Scripts
//!
//! HTTP polling feeds may post-process the extracted payload with a small
//! pipeline language. Scripts are parsed when a feed is saved or activated and
//! executed on every tick under a step budget and deadline.
//!
//! ```rust,ignore
//! use feedhub::transform::{Transform, TransformLimits};
//!
//! let transform = Transform::compile(
//!     "get data.items | where price > 100 | pick symbol, price",
//!     TransformLimits::default(),
//! )?;
//! let records = transform.apply(body)?;
//! ```

mod ast;
mod interpreter;
mod parser;

pub use ast::{CompareOp, Projection, Script, Stage};
pub use interpreter::{Transform, TransformLimits};
pub use parser::parse_script;

use thiserror::Error;

/// Errors from parsing or running a transform script
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Step budget of {0} exceeded")]
    StepBudgetExceeded(u64),

    #[error("Deadline of {0}ms exceeded")]
    Timeout(u64),

    #[error("Type error: {0}")]
    Type(String),
}
