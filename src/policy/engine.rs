use super::context::EvaluationContext;
use super::rule::{Action, Rule, Trigger};
use crate::store::Store;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides which action, if any, applies to a request
#[derive(Clone)]
pub struct PolicyEngine {
  store: Arc<dyn Store>,
}

impl PolicyEngine {
  /// Engine reading its rules from `store`
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// The rule source
  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  /// Action of the first matching rule across `triggers`, checked in order
  ///
  /// A store failure leaves the request unaffected.
  pub async fn decide(&self, triggers: &[Trigger], ctx: &EvaluationContext) -> Option<Action> {
    for trigger in triggers {
      let rules = match self.store.rules_for_trigger(*trigger).await {
        Ok(rules) => rules,
        Err(e) => {
          warn!(%trigger, "policy skipped, rules unavailable: {}", e);
          return None;
        }
      };
      if let Some(rule) = first_match(&rules, ctx) {
        debug!(%trigger, rule = %rule.id, title = %rule.title, action = ?rule.action, "rule matched");
        return Some(rule.action.clone());
      }
    }
    None
  }
}

/// First in-effect rule in `rules` whose condition holds
///
/// A condition that cannot be evaluated counts as not holding.
pub fn first_match<'a>(rules: &'a [Rule], ctx: &EvaluationContext) -> Option<&'a Rule> {
  rules.iter().filter(|rule| rule.in_effect).find(|rule| {
    match rule.condition.evaluate(ctx) {
      Ok(matched) => matched,
      Err(e) => {
        debug!(rule = %rule.id, "condition not evaluable: {}", e);
        false
      }
    }
  })
}
