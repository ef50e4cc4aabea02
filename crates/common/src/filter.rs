//! The small filter language the Repository's `*_get_all_sorted_by_filters`
//! operations accept (spec §6): equality, or a `{op, border}` comparison on
//! timestamp fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldFilter {
    Equals(String),
    Compare { op: ComparisonOp, border: DateTime<Utc> },
}

impl FieldFilter {
    pub fn eq(value: impl Into<String>) -> Self {
        Self::Equals(value.into())
    }

    pub fn time(op: ComparisonOp, border: DateTime<Utc>) -> Self {
        Self::Compare { op, border }
    }

    pub fn matches_time(&self, value: DateTime<Utc>) -> bool {
        match self {
            Self::Equals(_) => false,
            Self::Compare { op, border } => match op {
                ComparisonOp::Lt => value < *border,
                ComparisonOp::Le => value <= *border,
                ComparisonOp::Gt => value > *border,
                ComparisonOp::Ge => value >= *border,
            },
        }
    }
}

pub type Filters = std::collections::HashMap<String, FieldFilter>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}
