//! Shared fixtures: a throwaway root CA on disk and a running proxy

#![allow(dead_code)]

use bytes::Bytes;
use hat::{CertificateAuthority, Connector, ProxyServer, Store};
use http::{Method, Response};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const ROOT_CN: &str = "hat test root";

pub struct TestCa {
  _dir: TempDir,
  pub cert_path: PathBuf,
  pub key_path: PathBuf,
  pub cert_pem: String,
  pub cert_der: CertificateDer<'static>,
  issuer: Issuer<'static, KeyPair>,
}

impl TestCa {
  pub fn new() -> Self {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_CN);
    dn.push(DnType::OrganizationName, "hat");
    params.distinguished_name = dn;

    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = params.self_signed(&key).unwrap();
    let cert_pem = cert.pem();
    let key_pem = key.serialize_pem();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, &key_pem).unwrap();

    Self {
      _dir: dir,
      cert_path,
      key_path,
      cert_pem,
      cert_der: cert.der().clone(),
      issuer: Issuer::new(params, key),
    }
  }

  /// Certificate authority service over this root
  pub async fn authority(&self, lifetime: time::Duration) -> CertificateAuthority {
    CertificateAuthority::from_files(&self.cert_path, &self.key_path, lifetime)
      .await
      .unwrap()
  }

  /// Server certificate for `host` signed by this root, for fake origins
  pub fn origin_identity(
    &self,
    host: &str,
  ) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let params = CertificateParams::new(vec![host.to_string()]).unwrap();
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = params.signed_by(&key, &self.issuer).unwrap();
    (
      vec![cert.der().clone(), self.cert_der.clone()],
      PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
    )
  }

  /// Connector trusting only this root
  pub fn connector(&self) -> Connector {
    Connector::builder()
      .native_roots(false)
      .certificate(self.cert_der.clone())
      .build()
      .unwrap()
  }

  /// Client TLS configuration trusting only this root
  pub fn client_config(&self) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(self.cert_der.clone()).unwrap();
    rustls::ClientConfig::builder_with_provider(Arc::new(
      rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth()
  }
}

pub struct RunningProxy {
  pub addr: SocketAddr,
  pub certificates: Arc<CertificateAuthority>,
  _shutdown: oneshot::Sender<()>,
}

/// Start a proxy on an ephemeral port; it stops when the handle is dropped
pub async fn start_proxy(ca: &TestCa, store: Arc<dyn Store>, mitm: bool) -> RunningProxy {
  let certificates = Arc::new(ca.authority(time::Duration::hours(1)).await);
  certificates.set_enabled(mitm);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = ProxyServer::builder()
    .certificates(certificates.clone())
    .store(store)
    .connector(ca.connector())
    .build()
    .unwrap();
  let (tx, rx) = oneshot::channel::<()>();
  tokio::spawn(async move {
    server
      .serve_until(listener, async {
        let _ = rx.await;
      })
      .await
  });
  RunningProxy {
    addr,
    certificates,
    _shutdown: tx,
  }
}

/// Send raw bytes to the proxy and read one response
pub async fn roundtrip(proxy: SocketAddr, raw: &[u8]) -> (Response<Bytes>, BufReader<TcpStream>) {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(raw).await.unwrap();
  let mut reader = BufReader::new(stream);
  let response = hat::http1::read_response(&mut reader, &Method::GET)
    .await
    .unwrap();
  (response, reader)
}

/// Plain HTTP origin answering every request with `body`; received requests
/// are reported on the returned channel
pub async fn plain_origin(
  body: &'static str,
) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<http::Request<Bytes>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        if let Ok(Some(request)) = hat::http1::read_request(&mut reader).await {
          let _ = tx.send(request);
          let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
          );
          let _ = reader.get_mut().write_all(reply.as_bytes()).await;
        }
      });
    }
  });
  (addr, rx)
}

/// TCP server echoing back whatever it receives
pub async fn echo_server() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
          match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
              if stream.write_all(&buf[..n]).await.is_err() {
                break;
              }
            }
          }
        }
      });
    }
  });
  addr
}

/// Address with nothing listening on it
pub async fn closed_port() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap()
}
