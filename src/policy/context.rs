use crate::store::Device;
use bytes::Bytes;
use http::Request;
use serde_json::Value;
use thiserror::Error as ThisError;

const DEVICE_PREFIX: &str = "device-";
const REQUEST_PREFIX: &str = "ctx-";

/// A condition could not be evaluated
///
/// These never leave the policy layer: a rule whose condition fails to
/// evaluate simply does not match.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
  /// The field name is not known
  #[error("unknown field: {0}")]
  UnknownField(String),
  /// The field is known but the context lacks the data behind it
  #[error("value not available for field: {0}")]
  Unavailable(String),
  /// `contains` was asked about values it cannot relate
  #[error("cannot test whether {found} field {field} contains a {expected}")]
  TypeMismatch {
    /// field name
    field: String,
    /// JSON type of the field's value
    found: &'static str,
    /// JSON type of the condition's value
    expected: &'static str,
  },
}

/// The parts of an HTTP request conditions can look at
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes {
  host: String,
  method: String,
  path: String,
  body: Bytes,
}

impl RequestAttributes {
  /// Attributes from their parts; `host` carries no port
  pub fn new(
    host: impl Into<String>,
    method: impl Into<String>,
    path: impl Into<String>,
    body: impl Into<Bytes>,
  ) -> Self {
    Self {
      host: host.into(),
      method: method.into(),
      path: path.into(),
      body: body.into(),
    }
  }

  /// Attributes of `request` addressed to `host`
  pub fn from_request(request: &Request<Bytes>, host: &str) -> Self {
    Self {
      host: host.to_string(),
      method: request.method().as_str().to_string(),
      path: request.uri().path().to_string(),
      body: request.body().clone(),
    }
  }
}

/// What a condition is evaluated against
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
  device: Option<Device>,
  request: Option<RequestAttributes>,
}

impl EvaluationContext {
  /// A context with neither a device nor a request
  pub fn new() -> Self {
    Self::default()
  }

  /// Attach the device the request came from
  pub fn with_device(mut self, device: Option<Device>) -> Self {
    self.device = device;
    self
  }

  /// Attach the request being handled
  pub fn with_request(mut self, request: RequestAttributes) -> Self {
    self.request = Some(request);
    self
  }

  /// Device the request came from, if identified
  pub fn device(&self) -> Option<&Device> {
    self.device.as_ref()
  }

  /// Resolve a field name to its current value
  ///
  /// `device-*` fields need a device and `ctx-*` fields need a request; that
  /// is checked before the name itself.
  pub fn get(&self, field: &str) -> Result<Value, EvaluationError> {
    if field.starts_with(REQUEST_PREFIX) && self.request.is_none() {
      return Err(EvaluationError::Unavailable(field.to_string()));
    }
    if field.starts_with(DEVICE_PREFIX) && self.device.is_none() {
      return Err(EvaluationError::Unavailable(field.to_string()));
    }
    match (field, &self.device, &self.request) {
      ("device-id", Some(device), _) => Ok(Value::String(device.id.to_string())),
      ("ctx-host", _, Some(request)) => Ok(Value::String(request.host.clone())),
      ("ctx-method", _, Some(request)) => Ok(Value::String(request.method.clone())),
      ("ctx-path", _, Some(request)) => Ok(Value::String(request.path.clone())),
      ("ctx-body", _, Some(request)) => Ok(Value::String(
        String::from_utf8_lossy(&request.body).into_owned(),
      )),
      _ => Err(EvaluationError::UnknownField(field.to_string())),
    }
  }
}
