//! Boolean condition trees
//!
//! On the wire a condition is `{"op", "field", "value", "conditions"}`. The
//! operators are `AND` and `OR` over a non-empty list of sub-conditions, and
//! `equals` and `contains` over a context field and a JSON value:
//!
//! ```json
//! {"op": "AND", "conditions": [
//!   {"op": "equals", "field": "ctx-method", "value": "POST"},
//!   {"op": "contains", "field": "ctx-host", "value": "example"}
//! ]}
//! ```
//!
//! Decoding rejects trees that break those shapes, so a [`Condition`] that
//! exists is always well formed.

use super::context::{EvaluationContext, EvaluationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;

/// Condition operator names as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
  /// `AND`
  And,
  /// `OR`
  Or,
  /// `equals`
  Equals,
  /// `contains`
  Contains,
}

impl Operator {
  /// Wire name of the operator
  pub fn as_str(&self) -> &'static str {
    match self {
      Operator::And => "AND",
      Operator::Or => "OR",
      Operator::Equals => "equals",
      Operator::Contains => "contains",
    }
  }
}

impl fmt::Display for Operator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Operator {
  type Err = ConditionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "AND" => Ok(Operator::And),
      "OR" => Ok(Operator::Or),
      "equals" => Ok(Operator::Equals),
      "contains" => Ok(Operator::Contains),
      other => Err(ConditionError::UnknownOperator(other.to_string())),
    }
  }
}

/// A malformed condition tree
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
  /// `op` is not one of the known operators
  #[error("unknown operator: {0}")]
  UnknownOperator(String),
  /// `AND`/`OR` without sub-conditions
  #[error("{0} requires at least one sub-condition")]
  EmptyChildren(Operator),
  /// `equals`/`contains` without a field
  #[error("{0} requires a field")]
  MissingField(Operator),
  /// `equals`/`contains` without a value
  #[error("{0} requires a value")]
  MissingValue(Operator),
  /// `equals`/`contains` carrying sub-conditions
  #[error("{0} does not take sub-conditions")]
  UnexpectedChildren(Operator),
}

/// A validated condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub enum Condition {
  /// All sub-conditions hold
  And(Vec<Condition>),
  /// At least one sub-condition holds
  Or(Vec<Condition>),
  /// The field's value equals `value`
  Equals {
    /// context field name
    field: String,
    /// value to compare with
    value: Value,
  },
  /// The field's value equals or contains `value`
  Contains {
    /// context field name
    field: String,
    /// value looked up in the field's value
    value: Value,
  },
}

impl Condition {
  /// Conjunction of `conditions`; the list must not be empty
  pub fn and(conditions: Vec<Condition>) -> Result<Self, ConditionError> {
    if conditions.is_empty() {
      return Err(ConditionError::EmptyChildren(Operator::And));
    }
    Ok(Condition::And(conditions))
  }

  /// Disjunction of `conditions`; the list must not be empty
  pub fn or(conditions: Vec<Condition>) -> Result<Self, ConditionError> {
    if conditions.is_empty() {
      return Err(ConditionError::EmptyChildren(Operator::Or));
    }
    Ok(Condition::Or(conditions))
  }

  /// `field` equals `value`
  pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Condition::Equals {
      field: field.into(),
      value: value.into(),
    }
  }

  /// `field` contains `value`
  pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Condition::Contains {
      field: field.into(),
      value: value.into(),
    }
  }

  /// Operator at the root of this tree
  pub fn operator(&self) -> Operator {
    match self {
      Condition::And(_) => Operator::And,
      Condition::Or(_) => Operator::Or,
      Condition::Equals { .. } => Operator::Equals,
      Condition::Contains { .. } => Operator::Contains,
    }
  }

  /// Evaluate the tree against `ctx`
  ///
  /// `AND` stops at the first false or failing child, `OR` at the first true
  /// one; an error met before the deciding child is returned as is.
  pub fn evaluate(&self, ctx: &EvaluationContext) -> Result<bool, EvaluationError> {
    match self {
      Condition::And(conditions) => {
        for condition in conditions {
          if !condition.evaluate(ctx)? {
            return Ok(false);
          }
        }
        Ok(true)
      }
      Condition::Or(conditions) => {
        for condition in conditions {
          if condition.evaluate(ctx)? {
            return Ok(true);
          }
        }
        Ok(false)
      }
      Condition::Equals { field, value } => Ok(ctx.get(field)? == *value),
      Condition::Contains { field, value } => contains_value(field, &ctx.get(field)?, value),
    }
  }
}

/// Containment test used by `contains`
///
/// Equal values always contain each other. Otherwise text is searched for a
/// substring, lists for a member and objects for a key.
pub fn contains_value(field: &str, haystack: &Value, needle: &Value) -> Result<bool, EvaluationError> {
  if haystack == needle {
    return Ok(true);
  }
  match (haystack, needle) {
    (Value::String(text), Value::String(sub)) => Ok(text.contains(sub.as_str())),
    (Value::Array(items), _) => Ok(items.contains(needle)),
    (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
    _ => Err(EvaluationError::TypeMismatch {
      field: field.to_string(),
      found: json_type(haystack),
      expected: json_type(needle),
    }),
  }
}

fn json_type(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

#[derive(Serialize, Deserialize)]
struct RawCondition {
  op: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  field: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  value: Option<Value>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  conditions: Vec<RawCondition>,
}

impl TryFrom<RawCondition> for Condition {
  type Error = ConditionError;

  fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
    let op: Operator = raw.op.parse()?;
    match op {
      Operator::And | Operator::Or => {
        let children = raw
          .conditions
          .into_iter()
          .map(Condition::try_from)
          .collect::<Result<Vec<_>, _>>()?;
        if op == Operator::And {
          Condition::and(children)
        } else {
          Condition::or(children)
        }
      }
      Operator::Equals | Operator::Contains => {
        if !raw.conditions.is_empty() {
          return Err(ConditionError::UnexpectedChildren(op));
        }
        let field = raw
          .field
          .filter(|f| !f.is_empty())
          .ok_or(ConditionError::MissingField(op))?;
        let value = raw.value.ok_or(ConditionError::MissingValue(op))?;
        Ok(if op == Operator::Equals {
          Condition::Equals { field, value }
        } else {
          Condition::Contains { field, value }
        })
      }
    }
  }
}

impl From<Condition> for RawCondition {
  fn from(condition: Condition) -> Self {
    let op = condition.operator().as_str().to_string();
    match condition {
      Condition::And(children) | Condition::Or(children) => RawCondition {
        op,
        field: None,
        value: None,
        conditions: children.into_iter().map(RawCondition::from).collect(),
      },
      Condition::Equals { field, value } | Condition::Contains { field, value } => RawCondition {
        op,
        field: Some(field),
        value: Some(value),
        conditions: Vec::new(),
      },
    }
  }
}
