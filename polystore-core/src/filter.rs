//! Structured query predicates.
//!
//! A [`Filter`] is a small serializable condition tree built through a
//! fluent API. Engine bindings render it to parameterized SQL or to a
//! BSON document; the canonical JSON form feeds cache keys, so two
//! structurally identical filters with different literal values never
//! share a key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DalResult, DataAccessError};

/// Comparison operators supported by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// SQL `LIKE` pattern (`%`/`_` wildcards); translated for the
    /// document engine.
    Like,
    /// Membership; the value must be an array.
    In,
    IsNull,
    NotNull,
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cond {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Cond {
    fn new(field: impl Into<String>, op: Op, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Eq, value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Ne, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Gt, value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Ge, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Lt, value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Le, value.into())
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, Op::Like, Value::String(pattern.into()))
    }

    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(field, Op::In, Value::Array(values))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, Op::IsNull, Value::Null)
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self::new(field, Op::NotNull, Value::Null)
    }
}

/// Node of the condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Cond(Cond),
    And(Vec<Node>),
    Or(Vec<Node>),
}

/// Serializable condition tree. An empty filter matches everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub root: Option<Node>,
}

impl Filter {
    /// Empty filter (matches all rows).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter with a single condition.
    pub fn by(cond: Cond) -> Self {
        Self {
            root: Some(Node::Cond(cond)),
        }
    }

    /// Conjunction of conditions.
    pub fn all(conds: impl IntoIterator<Item = Cond>) -> Self {
        let nodes: Vec<Node> = conds.into_iter().map(Node::Cond).collect();
        match nodes.len() {
            0 => Self::new(),
            1 => Self {
                root: nodes.into_iter().next(),
            },
            _ => Self {
                root: Some(Node::And(nodes)),
            },
        }
    }

    /// Disjunction of sub-filters; empty branches are dropped.
    pub fn any(branches: impl IntoIterator<Item = Filter>) -> Self {
        let nodes: Vec<Node> = branches.into_iter().filter_map(|f| f.root).collect();
        match nodes.len() {
            0 => Self::new(),
            1 => Self {
                root: nodes.into_iter().next(),
            },
            _ => Self {
                root: Some(Node::Or(nodes)),
            },
        }
    }

    /// AND another condition onto this filter.
    pub fn and(self, cond: Cond) -> Self {
        let node = Node::Cond(cond);
        let root = match self.root {
            None => node,
            Some(Node::And(mut nodes)) => {
                nodes.push(node);
                Node::And(nodes)
            }
            Some(existing) => Node::And(vec![existing, node]),
        };
        Self { root: Some(root) }
    }

    /// OR an entire filter onto this one.
    pub fn or(self, other: Filter) -> Self {
        let Some(other_root) = other.root else {
            return self;
        };
        let root = match self.root {
            None => other_root,
            Some(Node::Or(mut nodes)) => {
                nodes.push(other_root);
                Node::Or(nodes)
            }
            Some(existing) => Node::Or(vec![existing, other_root]),
        };
        Self { root: Some(root) }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Canonical serialization used for cache keys. Includes every
    /// literal value, so differing constants yield differing keys.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }

    /// Validate every field name in the tree (engine bindings call this
    /// before rendering).
    pub fn validate_fields(&self) -> DalResult<()> {
        fn walk(node: &Node) -> DalResult<()> {
            match node {
                Node::Cond(c) => ensure_valid_identifier(&c.field),
                Node::And(nodes) | Node::Or(nodes) => nodes.iter().try_for_each(walk),
            }
        }
        match &self.root {
            Some(node) => walk(node),
            None => Ok(()),
        }
    }
}

/// Field and order-by names must be plain identifiers; anything else is
/// rejected before it can reach a statement.
pub fn ensure_valid_identifier(name: &str) -> DalResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(DataAccessError::validation(format!(
            "'{name}' is not a valid field name"
        )))
    }
}
