//! Process environment: the listening socket and the certificate authority

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::server::ProxyServer;
use crate::store::Store;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Everything the proxy holds for its whole lifetime
///
/// Built once by [`Environment::initialize`], consumed by
/// [`Environment::serve`]; dropping it closes the listener.
pub struct Environment {
  listener: TcpListener,
  certificates: Arc<CertificateAuthority>,
  connector: Option<Connector>,
}

impl Environment {
  /// Bind the listener and load the certificate authority
  pub async fn initialize(config: &Config) -> Result<Self> {
    let listener = TcpListener::bind(config.addr)
      .await
      .map_err(|e| Error::config_error(format!("listen on {}: {}", config.addr, e)))?;
    info!(addr = %config.addr, "listening");

    let certificates = CertificateAuthority::from_files(
      &config.mitm.certificate_file,
      &config.mitm.key_file,
      config.certificate_lifetime(),
    )
    .await?;
    certificates.set_enabled(config.mitm.enabled);
    info!(
      interception = config.mitm.enabled,
      lifetime_hours = config.mitm.certificate_lifetime,
      "certificate service initialized"
    );

    Ok(Self {
      listener,
      certificates: Arc::new(certificates),
      connector: None,
    })
  }

  /// Use `connector` instead of one trusting the platform's roots
  pub fn with_connector(mut self, connector: Connector) -> Self {
    self.connector = Some(connector);
    self
  }

  /// Address the listener is bound to
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Certificate authority shared by every connection
  pub fn certificates(&self) -> &Arc<CertificateAuthority> {
    &self.certificates
  }

  /// Serve until `shutdown` completes, then release the listener
  pub async fn serve<F>(self, store: Arc<dyn Store>, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    let mut builder = ProxyServer::builder()
      .certificates(self.certificates)
      .store(store);
    if let Some(connector) = self.connector {
      builder = builder.connector(connector);
    }
    builder.build()?.serve_until(self.listener, shutdown).await
  }
}
