//! Certificate Authority (CA) service for the MITM path
//!
//! Loads a locally trusted root certificate and key once, forges short-lived
//! leaf certificates per host on demand and terminates client TLS sessions
//! with them.
//!
//! Leaf certificates are cached by host. A cached entry whose `not_after` is
//! less than a minute away is dropped on lookup and a fresh certificate is
//! issued on that same call; nothing sweeps the cache in the background.
//! Two concurrent misses for the same host may both issue a certificate, the
//! last one stored wins.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
  KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{version, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

/// Cached leaf certificates closer than this to expiry are regenerated
const EXPIRY_MARGIN: Duration = Duration::minutes(1);
/// Offset for not_before timestamp to handle clock skew
const NOT_BEFORE_OFFSET: Duration = Duration::hours(1);

/// The CA's parsed certificate and private key
struct RootCredential {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
}

/// A forged certificate and key for one host
pub struct LeafCertificate {
  host: String,
  not_after: OffsetDateTime,
  cert_pem: String,
  key_pem: String,
  chain: Vec<CertificateDer<'static>>,
  certified_key: Arc<CertifiedKey>,
}

impl LeafCertificate {
  /// Host the certificate was issued for
  pub fn host(&self) -> &str {
    &self.host
  }

  /// End of the validity window
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// PEM encoded leaf certificate
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// PEM encoded PKCS#8 private key of the leaf
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }

  /// Certificate chain presented to clients: `[leaf, root]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// Certificate and signing key in the form rustls serves
  pub fn certified_key(&self) -> Arc<CertifiedKey> {
    self.certified_key.clone()
  }

  fn expires_within(&self, margin: Duration) -> bool {
    self.not_after - OffsetDateTime::now_utc() < margin
  }
}

impl fmt::Debug for LeafCertificate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafCertificate")
      .field("host", &self.host)
      .field("not_after", &self.not_after)
      .finish()
  }
}

/// Always offers the same certificate, whatever the client hello says
#[derive(Debug)]
struct FixedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertificate {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.0.clone())
  }
}

/// Certificate Authority issuing per-host leaf certificates
pub struct CertificateAuthority {
  root: RootCredential,
  lifetime: Duration,
  cache: Cache<String, Arc<LeafCertificate>>,
  provider: Arc<CryptoProvider>,
  enabled: AtomicBool,
}

impl CertificateAuthority {
  /// Load the root certificate and key from disk
  ///
  /// The certificate must be a PEM encoded X.509 certificate and the key a
  /// PEM encoded PKCS#8 private key. Any missing file or unparseable material
  /// is a [`Error::Config`]. The returned service has interception enabled.
  pub async fn from_files(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    lifetime: Duration,
  ) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::config_error(format!("read cert file {}: {}", cert_path.display(), e))
    })?;
    let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
      Error::config_error(format!("read key file {}: {}", key_path.display(), e))
    })?;
    let authority = Self::from_pem(&cert_pem, &key_pem, lifetime)?;
    info!(cert = %cert_path.display(), "certificate authority loaded");
    Ok(authority)
  }

  /// Build the service from PEM strings already in memory
  pub fn from_pem(cert_pem: &str, key_pem: &str, lifetime: Duration) -> Result<Self> {
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::config_error("decode cert file: no PEM certificate found"))?
      .map_err(|e| Error::config_error(format!("decode cert file: {}", e)))?;
    // only PKCS#8 keys are accepted for the root
    rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::config_error("decode key file: no PEM PKCS#8 private key found"))?
      .map_err(|e| Error::config_error(format!("decode key file: {}", e)))?;

    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::config_error(format!("parse key file: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::config_error(format!("parse cert file: {}", e)))?;

    Ok(Self {
      root: RootCredential {
        issuer,
        cert_der,
        cert_pem: cert_pem.to_string(),
      },
      lifetime,
      cache: Cache::builder().build(),
      provider: Arc::new(crypto_provider()),
      enabled: AtomicBool::new(true),
    })
  }

  /// Whether CONNECT tunnels are intercepted
  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::Relaxed)
  }

  /// Turn interception on or off
  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.store(enabled, Ordering::Relaxed);
  }

  /// Lifetime given to newly issued leaf certificates
  pub fn lifetime(&self) -> Duration {
    self.lifetime
  }

  /// Root certificate in DER form
  pub fn root_cert_der(&self) -> &CertificateDer<'static> {
    &self.root.cert_der
  }

  /// Root certificate in PEM form, for client installation
  pub fn root_cert_pem(&self) -> &str {
    &self.root.cert_pem
  }

  /// Get a live leaf certificate for `host`, issuing one when needed
  pub async fn obtain_leaf_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let key = host.to_ascii_lowercase();
    if let Some(cached) = self.cache.get(&key).await {
      if cached.expires_within(EXPIRY_MARGIN) {
        debug!(host = %key, not_after = %cached.not_after, "evicting leaf certificate close to expiry");
        self.cache.invalidate(&key).await;
      } else {
        trace!(host = %key, "leaf certificate cache hit");
        return Ok(cached);
      }
    }
    let leaf = Arc::new(self.issue(&key)?);
    self.cache.insert(key, leaf.clone()).await;
    Ok(leaf)
  }

  /// Sign a new leaf certificate for `host` with the root key
  fn issue(&self, host: &str) -> Result<LeafCertificate> {
    debug!(host, "issuing leaf certificate");
    let mut params = CertificateParams::default();

    let mut serial = [0u8; 16];
    rand::thread_rng().fill(&mut serial[..]);
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::OrganizationName, "N/A");
    params.distinguished_name = dn;
    params.subject_alt_names = vec![subject_alt_name(host)?];

    // whole seconds, the granularity X.509 stores
    let now = OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
      .map_err(|e| Error::crypto_error(format!("read clock: {}", e)))?;
    let not_after = now
      .checked_add(self.lifetime)
      .ok_or_else(|| {
        Error::crypto_error(format!("lifetime {} overflows not_after", self.lifetime))
      })?;
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = not_after;

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::crypto_error(format!("generate ecdsa key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.root.issuer)
      .map_err(|e| Error::crypto_error(format!("sign leaf certificate for {}: {}", host, e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    self.assemble(host, not_after, cert_pem, key_pem)
  }

  /// Turn the PEM pair back into what rustls needs to serve it
  fn assemble(
    &self,
    host: &str,
    not_after: OffsetDateTime,
    cert_pem: String,
    key_pem: String,
  ) -> Result<LeafCertificate> {
    let leaf_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::crypto_error("encode leaf certificate: empty PEM"))?
      .map_err(|e| Error::crypto_error(format!("decode leaf certificate: {}", e)))?;
    let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
      .map_err(|e| Error::crypto_error(format!("decode leaf key: {}", e)))?
      .ok_or_else(|| Error::crypto_error("encode leaf key: empty PEM"))?;
    let signing_key = self
      .provider
      .key_provider
      .load_private_key(key_der)
      .map_err(|e| Error::crypto_error(format!("load leaf key: {}", e)))?;

    let chain = vec![leaf_der, self.root.cert_der.clone()];
    let certified_key = Arc::new(CertifiedKey::new(chain.clone(), signing_key));
    Ok(LeafCertificate {
      host: host.to_string(),
      not_after,
      cert_pem,
      key_pem,
      chain,
      certified_key,
    })
  }

  /// TLS server configuration offering `leaf`
  pub fn server_config(&self, leaf: &LeafCertificate) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(self.provider.clone())
      .with_protocol_versions(&[&version::TLS12, &version::TLS13])?
      .with_no_client_auth()
      .with_cert_resolver(Arc::new(FixedCertificate(leaf.certified_key())));
    // the session loop speaks HTTP/1.x only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }

  /// Terminate the client's TLS session on `io` using a certificate for `host`
  pub async fn wrap_as_server<IO>(&self, io: IO, host: &str) -> Result<TlsStream<IO>>
  where
    IO: AsyncRead + AsyncWrite + Unpin,
  {
    let leaf = self.obtain_leaf_certificate(host).await?;
    let acceptor = TlsAcceptor::from(Arc::new(self.server_config(&leaf)?));
    let stream = acceptor.accept(io).await?;
    trace!(host, "client TLS handshake complete");
    Ok(stream)
  }
}

/// ring provider with X25519 preferred over P-256 for key exchange
fn crypto_provider() -> CryptoProvider {
  let mut provider = ring::default_provider();
  provider.kx_groups = vec![ring::kx_group::X25519, ring::kx_group::SECP256R1];
  provider
}

fn subject_alt_name(host: &str) -> Result<SanType> {
  if let Ok(ip) = host.parse::<IpAddr>() {
    return Ok(SanType::IpAddress(ip));
  }
  Ok(SanType::DnsName(host.try_into().map_err(|_| {
    Error::crypto_error(format!("invalid domain name: {}", host))
  })?))
}
