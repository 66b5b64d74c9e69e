use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;

/// Where a matcher clause looks up its field: in the event metadata map or
/// on the (object) payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Metadata,
    Payload,
}

/// Comparison applied by a matcher clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Equals,
    NotEquals,
    Lower,
    LowerEquals,
    Greater,
    GreaterEquals,
    In,
    NotIn,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MatchClause {
    field: String,
    value: Value,
    operation: Operation,
    field_type: FieldType,
}

/// Conjunctive predicate over event metadata and payload fields.
///
/// A matcher is an ordered list of clauses joined by logical AND. Evaluation
/// is pure and total: a missing field, a type mismatch or an invalid regex
/// pattern makes the clause false, never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataMatcher {
    clauses: Vec<MatchClause>,
}

impl MetadataMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a clause looked up in the event metadata.
    #[must_use]
    pub fn match_field(self, field: impl Into<String>, operation: Operation, value: Value) -> Self {
        self.clause(FieldType::Metadata, field, operation, value)
    }

    /// Adds a clause looked up on the payload object.
    #[must_use]
    pub fn match_payload(self, field: impl Into<String>, operation: Operation, value: Value) -> Self {
        self.clause(FieldType::Payload, field, operation, value)
    }

    #[must_use]
    fn clause(
        mut self,
        field_type: FieldType,
        field: impl Into<String>,
        operation: Operation,
        value: Value,
    ) -> Self {
        self.clauses.push(MatchClause {
            field: field.into(),
            value,
            operation,
            field_type,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.clauses.iter().all(|clause| {
            let field = match clause.field_type {
                FieldType::Metadata => event.metadata().get(&clause.field),
                FieldType::Payload => event.payload().get(&clause.field),
            };
            match field {
                Some(field) => evaluate(field, clause.operation, &clause.value),
                None => false,
            }
        })
    }
}

fn evaluate(field: &Value, operation: Operation, operand: &Value) -> bool {
    match operation {
        Operation::Equals => field == operand,
        Operation::NotEquals => field != operand,
        Operation::Lower => compare(field, operand) == Some(Ordering::Less),
        Operation::LowerEquals => {
            matches!(compare(field, operand), Some(Ordering::Less | Ordering::Equal))
        }
        Operation::Greater => compare(field, operand) == Some(Ordering::Greater),
        Operation::GreaterEquals => {
            matches!(compare(field, operand), Some(Ordering::Greater | Ordering::Equal))
        }
        Operation::In => operand.as_array().is_some_and(|set| set.contains(field)),
        Operation::NotIn => operand.as_array().is_some_and(|set| !set.contains(field)),
        Operation::Regex => match (field.as_str(), operand.as_str()) {
            (Some(field), Some(pattern)) => Regex::new(pattern)
                .map(|regex| regex.is_match(field))
                .unwrap_or(false),
            _ => false,
        },
    }
}

/// Ordering over JSON scalars: numbers compare numerically, strings
/// lexicographically. Booleans and composites only support equality, so any
/// ordered comparison over them is `None`, as is a mixed-type comparison.
fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(lhs), Value::Number(rhs)) => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
        (Value::String(lhs), Value::String(rhs)) => Some(lhs.cmp(rhs)),
        _ => None,
    }
}
