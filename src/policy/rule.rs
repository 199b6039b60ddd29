use super::condition::Condition;
use crate::errors::{Error, Result};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Point in request handling at which a rule is considered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
  /// Any request reaching the proxy: plain HTTP, CONNECT, or a request
  /// decrypted inside an intercepted tunnel
  IncomingRequest,
  /// A request decrypted inside an intercepted tunnel
  MitmHandled,
}

impl Trigger {
  /// Wire name of the trigger
  pub fn as_str(&self) -> &'static str {
    match self {
      Trigger::IncomingRequest => "incoming_request",
      Trigger::MitmHandled => "mitm_handled",
    }
  }
}

impl fmt::Display for Trigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Trigger {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "incoming_request" => Ok(Trigger::IncomingRequest),
      "mitm_handled" => Ok(Trigger::MitmHandled),
      other => Err(Error::Store(format!("unknown trigger: {}", other))),
    }
  }
}

/// What to do with a request a rule matched
///
/// Serialized as `{"type": "block_request"}`, `{"type": "block_ip"}` or
/// `{"type": "redirect", "data": "https://..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Action {
  /// Refuse this request
  BlockRequest,
  /// Refuse this request and drop the client connection
  BlockIp,
  /// Answer with a redirect to the given URL
  Redirect(String),
}

impl Action {
  /// Check the action can be turned into a response
  pub fn validate(&self) -> Result<()> {
    if let Action::Redirect(target) = self {
      if target.is_empty() || HeaderValue::from_str(target).is_err() {
        return Err(Error::store_error(format!(
          "redirect target is not a valid Location: {:?}",
          target
        )));
      }
    }
    Ok(())
  }
}

/// A stored policy rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
  /// Rule id
  pub id: Uuid,
  /// Owning user
  pub user_id: Uuid,
  /// Human readable title
  pub title: String,
  /// When the rule is considered
  pub trigger: Trigger,
  /// When the rule matches
  pub condition: Condition,
  /// What happens on a match
  #[serde(alias = "rule_action")]
  pub action: Action,
  /// Disabled rules are never evaluated
  #[serde(default = "default_in_effect")]
  pub in_effect: bool,
}

fn default_in_effect() -> bool {
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn action_wire_shape() {
    assert_eq!(
      serde_json::to_value(Action::Redirect("https://example.org/".into())).unwrap(),
      json!({"type": "redirect", "data": "https://example.org/"})
    );
    let action: Action = serde_json::from_value(json!({"type": "block_ip"})).unwrap();
    assert_eq!(action, Action::BlockIp);
    assert!(serde_json::from_value::<Action>(json!({"type": "explode"})).is_err());
  }

  #[test]
  fn redirect_needs_a_target() {
    assert!(Action::Redirect(String::new()).validate().is_err());
    assert!(Action::Redirect("bad\nvalue".into()).validate().is_err());
    assert!(Action::Redirect("/elsewhere".into()).validate().is_ok());
    assert!(Action::BlockRequest.validate().is_ok());
  }

  #[test]
  fn trigger_names() {
    assert_eq!(
      "mitm_handled".parse::<Trigger>().unwrap(),
      Trigger::MitmHandled
    );
    assert!(matches!(
      "on_response".parse::<Trigger>(),
      Err(Error::Store(msg)) if msg.contains("on_response")
    ));
    assert_eq!(Trigger::IncomingRequest.to_string(), "incoming_request");
  }

  #[test]
  fn decodes_stored_rule() {
    let rule: Rule = serde_json::from_value(json!({
      "id": "6f1c1f5e-2a54-4a8e-9d4e-0c1d2e3f4a5b",
      "user_id": "00000000-0000-0000-0000-000000000001",
      "title": "no uploads",
      "trigger": "incoming_request",
      "condition": {"op": "equals", "field": "ctx-method", "value": "PUT"},
      "rule_action": {"type": "block_request"}
    }))
    .unwrap();
    assert!(rule.in_effect);
    assert_eq!(rule.action, Action::BlockRequest);
    assert_eq!(rule.trigger, Trigger::IncomingRequest);
  }
}
