//! Read side of the users, devices and rules the proxy enforces
//!
//! The proxy only ever reads from its [`Store`]. [`MemoryStore`] keeps
//! everything in memory and can be seeded from a JSON snapshot:
//!
//! ```json
//! {
//!   "users": [{"id": "…", "username": "alice"}],
//!   "devices": [{"id": "…", "user_id": "…", "name": "laptop"}],
//!   "rules": [{"id": "…", "user_id": "…", "title": "no uploads",
//!              "trigger": "incoming_request",
//!              "condition": {"op": "equals", "field": "ctx-method", "value": "PUT"},
//!              "action": {"type": "block_request"}}]
//! }
//! ```

use crate::errors::{Error, Result};
use crate::policy::{Rule, Trigger};
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// An account owning devices and rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  /// User id
  pub id: Uuid,
  /// Login name
  pub username: String,
  /// Creation time
  #[serde(default, with = "time::serde::rfc3339::option")]
  pub created_at: Option<OffsetDateTime>,
}

/// A client machine registered to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
  /// Device id, presented by the client as its proxy user name
  pub id: Uuid,
  /// Owning user
  pub user_id: Uuid,
  /// Display name
  pub name: String,
  /// Creation time
  #[serde(default, with = "time::serde::rfc3339::option")]
  pub created_at: Option<OffsetDateTime>,
}

/// Lookups the proxy needs from persistence
///
/// Rule listings come back in a stable order; the policy engine evaluates
/// them in that order.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
  /// In-effect rules for `trigger`
  async fn rules_for_trigger(&self, trigger: Trigger) -> Result<Vec<Rule>>;
  /// A rule by id
  async fn rule_by_id(&self, id: Uuid) -> Result<Option<Rule>>;
  /// All rules of a user, in effect or not
  async fn rules_by_user(&self, user_id: Uuid) -> Result<Vec<Rule>>;
  /// A device by id
  async fn device_by_id(&self, id: Uuid) -> Result<Option<Device>>;
  /// All devices of a user
  async fn devices_by_user(&self, user_id: Uuid) -> Result<Vec<Device>>;
  /// A user by id
  async fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;
  /// A user by login name
  async fn user_by_username(&self, username: &str) -> Result<Option<User>>;
}

/// Serialized contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
  /// Users
  #[serde(default)]
  pub users: Vec<User>,
  /// Devices
  #[serde(default)]
  pub devices: Vec<Device>,
  /// Rules, in evaluation order
  #[serde(default)]
  pub rules: Vec<Rule>,
}

/// In-memory [`Store`]; rules keep their insertion order
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: RwLock<Snapshot>,
}

impl MemoryStore {
  /// An empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// A store holding `snapshot`, after checking every rule's action
  pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
    for rule in &snapshot.rules {
      rule.action.validate()?;
    }
    Ok(Self {
      inner: RwLock::new(snapshot),
    })
  }

  /// Load a JSON snapshot from `path`
  pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = tokio::fs::read(path)
      .await
      .map_err(|e| Error::config_error(format!("read store file {}: {}", path.display(), e)))?;
    let snapshot: Snapshot = serde_json::from_slice(&raw)
      .map_err(|e| Error::config_error(format!("parse store file {}: {}", path.display(), e)))?;
    info!(
      users = snapshot.users.len(),
      devices = snapshot.devices.len(),
      rules = snapshot.rules.len(),
      "store loaded from {}",
      path.display()
    );
    Self::from_snapshot(snapshot)
  }

  /// Add a user
  pub async fn insert_user(&self, user: User) {
    self.inner.write().await.users.push(user);
  }

  /// Add a device
  pub async fn insert_device(&self, device: Device) {
    self.inner.write().await.devices.push(device);
  }

  /// Append a rule; it is evaluated after every rule already present
  pub async fn insert_rule(&self, rule: Rule) -> Result<()> {
    rule.action.validate()?;
    self.inner.write().await.rules.push(rule);
    Ok(())
  }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
  async fn rules_for_trigger(&self, trigger: Trigger) -> Result<Vec<Rule>> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .rules
        .iter()
        .filter(|rule| rule.in_effect && rule.trigger == trigger)
        .cloned()
        .collect(),
    )
  }

  async fn rule_by_id(&self, id: Uuid) -> Result<Option<Rule>> {
    let inner = self.inner.read().await;
    Ok(inner.rules.iter().find(|rule| rule.id == id).cloned())
  }

  async fn rules_by_user(&self, user_id: Uuid) -> Result<Vec<Rule>> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .rules
        .iter()
        .filter(|rule| rule.user_id == user_id)
        .cloned()
        .collect(),
    )
  }

  async fn device_by_id(&self, id: Uuid) -> Result<Option<Device>> {
    let inner = self.inner.read().await;
    Ok(inner.devices.iter().find(|device| device.id == id).cloned())
  }

  async fn devices_by_user(&self, user_id: Uuid) -> Result<Vec<Device>> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .devices
        .iter()
        .filter(|device| device.user_id == user_id)
        .cloned()
        .collect(),
    )
  }

  async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
    let inner = self.inner.read().await;
    Ok(inner.users.iter().find(|user| user.id == id).cloned())
  }

  async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .users
        .iter()
        .find(|user| user.username == username)
        .cloned(),
    )
  }
}
