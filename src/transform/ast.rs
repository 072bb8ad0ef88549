//! Transform Script AST
//!
//! A transform script is a pipeline of stages separated by `|`, applied left to
//! right to the value extracted from a polled response:
//!
//! ```text
//! get data.items | where price > 100 | sort price desc | pick symbol, price as p | limit 5
//! ```

use serde_json::Value;

/// A parsed transform script
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    pub stages: Vec<Stage>,
}

impl Script {
    /// A script with no stages returns its input unchanged
    pub fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Select a sub-value by dot path
    Get(String),
    /// Project fields from an object, or from every object in an array
    Pick(Vec<Projection>),
    /// Keep array elements whose field matches
    Where {
        path: String,
        op: CompareOp,
        literal: Value,
    },
    /// Order array elements by a field
    Sort { path: String, descending: bool },
    /// Keep the first n array elements
    Limit(usize),
    /// Concatenate nested arrays one level deep
    Flatten,
    /// Wrap the value in an object under the given key
    Wrap(String),
    /// Replace an array with its length
    Count,
}

/// A projected field in a `pick` stage
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub path: String,
    pub alias: Option<String>,
}

impl Projection {
    /// Output key: the alias, or the last path segment
    pub fn output_key(&self) -> &str {
        match &self.alias {
            Some(alias) => alias,
            None => self.path.rsplit('.').next().unwrap_or(&self.path),
        }
    }
}

/// Comparison operators available in `where`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive substring match
    Contains,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eq => write!(f, "=="),
            Self::Ne => write!(f, "!="),
            Self::Gt => write!(f, ">"),
            Self::Gte => write!(f, ">="),
            Self::Lt => write!(f, "<"),
            Self::Lte => write!(f, "<="),
            Self::Contains => write!(f, "~="),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_output_key() {
        let plain = Projection {
            path: "quote.last.price".into(),
            alias: None,
        };
        assert_eq!(plain.output_key(), "price");

        let aliased = Projection {
            path: "quote.last.price".into(),
            alias: Some("p".into()),
        };
        assert_eq!(aliased.output_key(), "p");
    }

    #[test]
    fn test_identity_script() {
        assert!(Script::default().is_identity());
    }
}
