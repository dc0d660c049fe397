//! Label selection shared by the scheduler and the flow controller
//!
//! A filter or preference stanza matches a cluster when all of its
//! `match_labels` are present with equal values AND every entry of
//! `match_expressions` evaluates true. Stanzas within one list compose
//! disjunctively; that composition lives with the callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Operators accepted in a match expression
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum LabelOperator {
    /// The label value must be one of `values`
    In,
    /// The label must be absent or its value outside `values`
    NotIn,
}

/// A single expression over one label key
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MatchExpression {
    /// Label key the expression inspects
    pub key: String,
    /// Operator applied to the label value
    pub operator: LabelOperator,
    /// Candidate values for the operator
    #[serde(default)]
    pub values: Vec<String>,
}

impl MatchExpression {
    /// Evaluate this expression against a label set
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            LabelOperator::In => labels
                .get(&self.key)
                .map(|v| self.values.iter().any(|c| c == v))
                .unwrap_or(false),
            LabelOperator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.iter().any(|c| c == v))
                .unwrap_or(true),
        }
    }
}

/// Returns true if every `wanted` label is present in `labels` with an equal value
pub fn match_labels(labels: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted
        .iter()
        .all(|(k, v)| labels.get(k).map(|have| have == v).unwrap_or(false))
}

/// Returns true if all expressions hold for `labels`
pub fn match_expressions(labels: &BTreeMap<String, String>, exprs: &[MatchExpression]) -> bool {
    exprs.iter().all(|e| e.matches(labels))
}
