use crate::errors::{Error, Result};
use crate::http1::{read_response, request_to_raw};
use crate::socket::MaybeTlsStream;
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::uri::{Authority, Scheme};
use http::{HeaderValue, Request, Response, Uri};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

/// Origin server a request or tunnel is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  tls: bool,
  host: String,
  port: u16,
}

impl Target {
  /// Target from its parts; `host` may be a name or an IP literal without brackets
  pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
    let host = host.into();
    let host = host
      .strip_prefix('[')
      .and_then(|h| h.strip_suffix(']'))
      .map(str::to_string)
      .unwrap_or(host);
    Self { tls, host, port }
  }

  /// Target of a `CONNECT host:port` request; the port defaults to 443
  pub fn from_connect(uri: &Uri) -> Result<Self> {
    let authority = uri
      .authority()
      .ok_or_else(|| Error::invalid_request(format!("CONNECT target is not host:port: {}", uri)))?;
    Ok(Self::new(
      authority.host(),
      authority.port_u16().unwrap_or(443),
      true,
    ))
  }

  /// Target of a forwarded request, from its absolute URI or its `Host` header
  pub fn from_request<B>(request: &Request<B>) -> Result<Self> {
    let uri = request.uri();
    let tls = uri.scheme() == Some(&Scheme::HTTPS);
    if let Some(scheme) = uri.scheme() {
      if *scheme != Scheme::HTTP && *scheme != Scheme::HTTPS {
        return Err(Error::invalid_request(format!("unsupported scheme: {}", scheme)));
      }
    }
    let default_port = if tls { 443 } else { 80 };
    if let Some(authority) = uri.authority() {
      return Ok(Self::new(
        authority.host(),
        authority.port_u16().unwrap_or(default_port),
        tls,
      ));
    }
    let host = request
      .headers()
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .and_then(|h| h.parse::<Authority>().ok())
      .ok_or_else(|| Error::invalid_request("request names no host"))?;
    Ok(Self::new(
      host.host(),
      host.port_u16().unwrap_or(default_port),
      tls,
    ))
  }

  /// Host name or IP literal, without a port
  pub fn host(&self) -> &str {
    &self.host
  }

  /// TCP port
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Whether the origin is spoken to over TLS
  pub fn is_tls(&self) -> bool {
    self.tls
  }

  /// `host:port`, bracketing IPv6 literals
  pub fn addr(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  fn host_header(&self) -> String {
    let default_port = if self.tls { 443 } else { 80 };
    if self.port == default_port {
      if self.host.contains(':') {
        format!("[{}]", self.host)
      } else {
        self.host.clone()
      }
    } else {
      self.addr()
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let scheme = if self.tls { "https" } else { "http" };
    write!(f, "{}://{}", scheme, self.addr())
  }
}

/// ConnectorBuilder
#[derive(Clone, Default)]
pub struct ConnectorBuilder {
  skip_native_roots: bool,
  certificate: Vec<CertificateDer<'static>>,
}

impl ConnectorBuilder {
  /// Adds a certificate to the set of roots that the connector will trust.
  pub fn certificate(mut self, value: CertificateDer<'static>) -> ConnectorBuilder {
    self.certificate.push(value);
    self
  }

  /// Leave the platform's trust store out of the root set.
  ///
  /// Default is to load it.
  pub fn native_roots(mut self, value: bool) -> ConnectorBuilder {
    self.skip_native_roots = !value;
    self
  }

  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if !self.skip_native_roots {
      let native = rustls_native_certs::load_native_certs();
      for e in &native.errors {
        warn!("loading native root certificates: {}", e);
      }
      let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
      debug!(added, ignored, "native root certificates loaded");
    }
    for cert in &self.certificate {
      root_cert_store.add(cert.clone())?;
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ClientConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()?
      .with_root_certificates(root_cert_store)
      .with_no_client_auth();
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Connector {
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Dials origin servers and forwards requests to them
#[derive(Clone)]
pub struct Connector {
  tls: TlsConnector,
}

impl Connector {
  /// Connector trusting the platform's root certificates
  pub fn new() -> Result<Self> {
    ConnectorBuilder::default().build()
  }

  /// Connector builder
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Open a connection to `target`, with TLS when the target asks for it
  pub async fn connect(&self, target: &Target) -> Result<MaybeTlsStream> {
    let addr = target.addr();
    let tcp = TcpStream::connect(&addr)
      .await
      .map_err(|e| Error::dial_error(&addr, e))?;
    if !target.is_tls() {
      return Ok(MaybeTlsStream::Tcp(tcp));
    }
    let domain = ServerName::try_from(target.host().to_string())
      .map_err(|e| Error::invalid_request(format!("invalid server name {}: {}", target.host(), e)))?;
    let tls = MaybeTlsStream::Tls(Box::new(self.tls.connect(domain, tcp).await?));
    if let Some(cert) = tls.peer_certificate() {
      trace!(%target, cert_len = cert.len(), "origin presented certificate");
    }
    Ok(tls)
  }

  /// Send `request` to `target` over a fresh connection and read the response
  pub async fn send(&self, target: &Target, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
    debug!(method = %request.method(), %target, path = request.uri().path(), "forwarding request");
    if !request.headers().contains_key(HOST) {
      request
        .headers_mut()
        .insert(HOST, HeaderValue::from_str(&target.host_header())?);
    }
    // one request per upstream connection
    request
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));

    let mut stream = self.connect(target).await?;
    stream.write_all(&request_to_raw(&request)).await?;
    stream.flush().await?;
    let mut reader = BufReader::new(stream);
    read_response(&mut reader, request.method()).await
  }
}
