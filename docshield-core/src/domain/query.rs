use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::document::Document;

/// Comparison operator of a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    /// Evaluates `left <op> right`. Range operators only match values of
    /// comparable kinds (both numbers, both strings, both booleans).
    pub fn evaluate(&self, left: &Value, right: &Value) -> bool {
        match self {
            FilterOp::Eq => values_equal(left, right),
            FilterOp::Ne => !values_equal(left, right),
            FilterOp::Lt => compare_values(left, right) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_values(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(left, right) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_values(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A single query constraint understood by every document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryConstraint {
    Filter {
        field: String,
        op: FilterOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: SortDirection,
    },
    Limit(usize),
}

impl QueryConstraint {
    pub fn filter(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::Filter {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(field: impl Into<String>, direction: SortDirection) -> Self {
        Self::OrderBy {
            field: field.into(),
            direction,
        }
    }

    pub fn limit(count: usize) -> Self {
        Self::Limit(count)
    }
}

/// Applies constraints to an in-memory document set: filters first, then the
/// last `OrderBy`, then the smallest `Limit`.
pub fn apply_constraints(mut documents: Vec<Document>, constraints: &[QueryConstraint]) -> Vec<Document> {
    for constraint in constraints {
        if let QueryConstraint::Filter { field, op, value } = constraint {
            documents.retain(|doc| {
                doc.field(field)
                    .map(|actual| op.evaluate(actual, value))
                    .unwrap_or(false)
            });
        }
    }

    let order = constraints.iter().rev().find_map(|c| match c {
        QueryConstraint::OrderBy { field, direction } => Some((field, *direction)),
        _ => None,
    });
    if let Some((field, direction)) = order {
        documents.sort_by(|a, b| {
            // Documents without the field sort last in both directions.
            match (a.field(field), b.field(field)) {
                (Some(x), Some(y)) => {
                    let ordering = compare_values(x, y).unwrap_or(Ordering::Equal);
                    match direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }

    let limit = constraints
        .iter()
        .filter_map(|c| match c {
            QueryConstraint::Limit(n) => Some(*n),
            _ => None,
        })
        .min();
    if let Some(limit) = limit {
        documents.truncate(limit);
    }

    documents
}

/// Canonical textual form of a constraint list, used in cache keys.
pub fn canonical_params(constraints: &[QueryConstraint]) -> String {
    serde_json::to_string(constraints).unwrap_or_default()
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
