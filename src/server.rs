//! Proxy server: connection dispatch, forwarding and the MITM session loop

use crate::ca::CertificateAuthority;
use crate::connector::{Connector, Target};
use crate::errors::{Error, Result};
use crate::http1::{read_request, response_to_raw, strip_proxy_headers, wants_close};
use crate::policy::{Action, EvaluationContext, PolicyEngine, RequestAttributes, Trigger};
use crate::store::{Device, MemoryStore, Store};
use crate::tunnel::tunnel;
use base64::prelude::*;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, LOCATION, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Written to the client once a CONNECT tunnel is accepted
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// What happens to a client connection after a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
  KeepOpen,
  Close,
}

/// Builder for `ProxyServer`.
#[derive(Default)]
pub struct ProxyServerBuilder {
  certificates: Option<Arc<CertificateAuthority>>,
  store: Option<Arc<dyn Store>>,
  connector: Option<Connector>,
}

impl ProxyServerBuilder {
  /// Certificate authority used to intercept CONNECT tunnels
  pub fn certificates(mut self, certificates: Arc<CertificateAuthority>) -> Self {
    self.certificates = Some(certificates);
    self
  }

  /// Source of devices and rules; defaults to an empty in-memory store
  pub fn store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  /// Connector used to reach origin servers; defaults to one trusting the
  /// platform's roots
  pub fn connector(mut self, connector: Connector) -> Self {
    self.connector = Some(connector);
    self
  }

  /// Build the server
  pub fn build(self) -> Result<ProxyServer> {
    let certificates = self
      .certificates
      .ok_or_else(|| Error::config_error("proxy server needs a certificate authority"))?;
    let store = self
      .store
      .unwrap_or_else(|| Arc::new(MemoryStore::new()));
    let connector = match self.connector {
      Some(connector) => connector,
      None => Connector::new()?,
    };
    Ok(ProxyServer {
      certificates,
      policy: PolicyEngine::new(store),
      connector,
    })
  }
}

/// Proxy server implementation
#[derive(Clone)]
pub struct ProxyServer {
  certificates: Arc<CertificateAuthority>,
  policy: PolicyEngine,
  connector: Connector,
}

impl ProxyServer {
  /// Builder
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// Certificate authority in use
  pub fn certificates(&self) -> &Arc<CertificateAuthority> {
    &self.certificates
  }

  /// Serve connections from `listener` forever
  pub async fn run(&self, listener: TcpListener) -> Result<()> {
    self.serve_until(listener, std::future::pending()).await
  }

  /// Serve connections from `listener` until `shutdown` completes
  ///
  /// Each connection gets its own task; a failing connection is logged and
  /// does not affect the others.
  pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    info!(addr = %listener.local_addr()?, "proxy listening");
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("proxy shutting down");
          return Ok(());
        }
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let server = self.clone();
            tokio::spawn(async move {
              if let Err(e) = server.handle_connection(stream, peer).await {
                warn!(%peer, "connection ended with error: {}", e);
              }
            });
          }
          Err(e) => warn!("failed to accept connection: {}", e),
        }
      }
    }
  }

  /// Handle a client connection
  async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    trace!(%peer, "connection accepted");
    let mut reader = BufReader::new(stream);
    let mut device = None;
    loop {
      let Some(request) = next_request(&mut reader).await? else {
        return Ok(());
      };
      if let Some(found) = self.identify_device(request.headers()).await {
        device = Some(found);
      }
      if request.method() == Method::CONNECT {
        return self.handle_connect(reader, request, device).await;
      }
      let close = wants_close(request.version(), request.headers());
      let target = match Target::from_request(&request) {
        Ok(target) => target,
        Err(e) => {
          write_response(reader.get_mut(), status_response(StatusCode::BAD_REQUEST, true)).await?;
          return Err(e);
        }
      };
      let ctx = EvaluationContext::new()
        .with_device(device.clone())
        .with_request(RequestAttributes::from_request(&request, target.host()));
      let disposition = self
        .serve_request(
          reader.get_mut(),
          request,
          &ctx,
          &[Trigger::IncomingRequest],
          &target,
          close,
        )
        .await?;
      if disposition == Disposition::Close {
        reader.get_mut().shutdown().await?;
        return Ok(());
      }
    }
  }

  /// Accept or refuse a CONNECT, then relay or intercept the tunnel
  async fn handle_connect(
    &self,
    mut client: BufReader<TcpStream>,
    request: Request<Bytes>,
    device: Option<Device>,
  ) -> Result<()> {
    let target = match Target::from_connect(request.uri()) {
      Ok(target) => target,
      Err(e) => {
        write_response(client.get_mut(), status_response(StatusCode::BAD_REQUEST, true)).await?;
        return Err(e);
      }
    };
    let ctx = EvaluationContext::new()
      .with_device(device.clone())
      .with_request(RequestAttributes::from_request(&request, target.host()));
    if let Some(action) = self.policy.decide(&[Trigger::IncomingRequest], &ctx).await {
      debug!(%target, ?action, "CONNECT refused by policy");
      write_response(client.get_mut(), action_response(&action, true)?).await?;
      return Ok(());
    }

    client.get_mut().write_all(CONNECT_ESTABLISHED).await?;
    client.get_mut().flush().await?;

    if self.certificates.is_enabled() {
      self.intercept(client, target, device).await
    } else {
      debug!(%target, "relaying tunnel without interception");
      tunnel(&self.connector, client, &target).await.map(|_| ())
    }
  }

  /// Terminate TLS with a forged certificate and serve requests from inside
  async fn intercept<S>(&self, client: S, target: Target, device: Option<Device>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let tls = self
      .certificates
      .wrap_as_server(client, target.host())
      .await
      .inspect_err(|e| debug!(%target, "client TLS handshake failed: {}", e))?;
    debug!(%target, "intercepting tunnel");
    let mut reader = BufReader::new(tls);
    loop {
      let Some(request) = next_request(&mut reader).await? else {
        return Ok(());
      };
      let close = wants_close(request.version(), request.headers());
      let ctx = EvaluationContext::new()
        .with_device(device.clone())
        .with_request(RequestAttributes::from_request(&request, target.host()));
      let disposition = self
        .serve_request(
          reader.get_mut(),
          request,
          &ctx,
          &[Trigger::IncomingRequest, Trigger::MitmHandled],
          &target,
          close,
        )
        .await?;
      if disposition == Disposition::Close {
        reader.get_mut().shutdown().await?;
        return Ok(());
      }
    }
  }

  /// Apply policy to one request, then answer it locally or forward it
  async fn serve_request<W>(
    &self,
    client: &mut W,
    mut request: Request<Bytes>,
    ctx: &EvaluationContext,
    triggers: &[Trigger],
    target: &Target,
    close: bool,
  ) -> Result<Disposition>
  where
    W: AsyncWrite + Unpin,
  {
    if let Some(action) = self.policy.decide(triggers, ctx).await {
      debug!(%target, path = request.uri().path(), ?action, "request answered by policy");
      let close = close || action == Action::BlockIp;
      write_response(client, action_response(&action, close)?).await?;
      return Ok(if close {
        Disposition::Close
      } else {
        Disposition::KeepOpen
      });
    }

    let version = request.version();
    strip_proxy_headers(request.headers_mut());
    let response = match self.connector.send(target, request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(%target, "forwarding failed: {}", e);
        status_response(StatusCode::BAD_GATEWAY, close)
      }
    };
    write_response(client, for_client(response, version, close)).await?;
    Ok(if close {
      Disposition::Close
    } else {
      Disposition::KeepOpen
    })
  }

  /// Device named by a `Proxy-Authorization: Basic` header, if registered
  ///
  /// The user name part of the credentials is the device id.
  async fn identify_device(&self, headers: &HeaderMap) -> Option<Device> {
    let id = device_id(headers)?;
    match self.policy.store().device_by_id(id).await {
      Ok(device) => {
        if device.is_none() {
          debug!(%id, "unknown device");
        }
        device
      }
      Err(e) => {
        warn!(%id, "device lookup failed: {}", e);
        None
      }
    }
  }
}

/// Read the next request, answering `400 Bad Request` to garbage
async fn next_request<S>(reader: &mut BufReader<S>) -> Result<Option<Request<Bytes>>>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match read_request(reader).await {
    Err(e @ (Error::InvalidRequest(_) | Error::Http(_))) => {
      write_response(reader.get_mut(), status_response(StatusCode::BAD_REQUEST, true)).await?;
      Err(e)
    }
    other => other,
  }
}

fn device_id(headers: &HeaderMap) -> Option<Uuid> {
  let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
  let (scheme, credentials) = value.trim().split_once(' ')?;
  if !scheme.eq_ignore_ascii_case("basic") {
    return None;
  }
  let decoded = BASE64_STANDARD.decode(credentials.trim()).ok()?;
  let decoded = String::from_utf8(decoded).ok()?;
  let username = decoded.split(':').next()?;
  Uuid::parse_str(username).ok()
}

/// Response enforcing a policy action
fn action_response(action: &Action, close: bool) -> Result<Response<Bytes>> {
  let mut response = match action {
    Action::BlockRequest | Action::BlockIp => status_response(StatusCode::FORBIDDEN, close),
    Action::Redirect(location) => {
      let mut response = status_response(StatusCode::FOUND, close);
      response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_str(location)?);
      response
    }
  };
  if matches!(action, Action::BlockIp) {
    response
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
  }
  Ok(response)
}

/// Empty-bodied response with just a status
fn status_response(status: StatusCode, close: bool) -> Response<Bytes> {
  let mut response = Response::new(Bytes::new());
  *response.status_mut() = status;
  response
    .headers_mut()
    .insert(CONTENT_LENGTH, HeaderValue::from(0));
  if close {
    response
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
  }
  response
}

/// Replace the origin's connection management with ours
fn for_client(mut response: Response<Bytes>, client_version: Version, close: bool) -> Response<Bytes> {
  *response.version_mut() = Version::HTTP_11;
  let headers = response.headers_mut();
  headers.remove(CONNECTION);
  headers.remove("keep-alive");
  headers.remove("proxy-connection");
  if close {
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
  } else if client_version == Version::HTTP_10 {
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
  }
  response
}

async fn write_response<W>(client: &mut W, response: Response<Bytes>) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  client.write_all(&response_to_raw(&response)).await?;
  client.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn auth(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(value).unwrap());
    headers
  }

  #[test]
  fn device_id_from_basic_credentials() {
    let id = Uuid::new_v4();
    let encoded = BASE64_STANDARD.encode(format!("{}:secret", id));
    assert_eq!(device_id(&auth(&format!("Basic {}", encoded))), Some(id));
    assert_eq!(device_id(&auth(&format!("basic {}", encoded))), Some(id));
    assert_eq!(device_id(&auth("Bearer abc")), None);
    let not_uuid = BASE64_STANDARD.encode("alice:pw");
    assert_eq!(device_id(&auth(&format!("Basic {}", not_uuid))), None);
    assert_eq!(device_id(&HeaderMap::new()), None);
  }

  #[test]
  fn action_responses() {
    let blocked = action_response(&Action::BlockRequest, false).unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);
    assert!(blocked.headers().get(CONNECTION).is_none());

    let banned = action_response(&Action::BlockIp, false).unwrap();
    assert_eq!(banned.status(), StatusCode::FORBIDDEN);
    assert_eq!(banned.headers()[CONNECTION], "close");

    let moved = action_response(&Action::Redirect("https://example.org/".into()), false).unwrap();
    assert_eq!(moved.status(), StatusCode::FOUND);
    assert_eq!(moved.headers()[LOCATION], "https://example.org/");
  }

  #[test]
  fn client_response_connection_headers() {
    let origin = || {
      let mut response = status_response(StatusCode::OK, true);
      response
        .headers_mut()
        .insert("keep-alive", HeaderValue::from_static("timeout=5"));
      response
    };
    let kept = for_client(origin(), Version::HTTP_11, false);
    assert!(kept.headers().get(CONNECTION).is_none());
    assert!(kept.headers().get("keep-alive").is_none());
    let legacy = for_client(origin(), Version::HTTP_10, false);
    assert_eq!(legacy.headers()[CONNECTION], "keep-alive");
    let closing = for_client(origin(), Version::HTTP_11, true);
    assert_eq!(closing.headers()[CONNECTION], "close");
  }
}
