//! Rule-based request policy
//!
//! A [`Rule`] pairs a [`Trigger`] with a [`Condition`] tree and an
//! [`Action`]. For each request the proxy builds an [`EvaluationContext`],
//! asks the [`PolicyEngine`] for a decision and enforces the first matching
//! rule's action.

mod condition;
mod context;
mod engine;
mod rule;

pub use condition::{Condition, ConditionError, Operator};
pub use context::{EvaluationContext, EvaluationError, RequestAttributes};
pub use engine::PolicyEngine;
pub use rule::{Action, Rule, Trigger};
