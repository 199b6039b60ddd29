//! Certificate authority service behaviour

mod common;

use common::{TestCa, ROOT_CN};
use hat::{CertificateAuthority, Error};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

#[tokio::test]
async fn missing_files_are_config_errors() {
  let ca = TestCa::new();
  let result =
    CertificateAuthority::from_files("/nonexistent/ca.pem", &ca.key_path, Duration::hours(1)).await;
  assert!(matches!(result, Err(Error::Config(_))));
  let result =
    CertificateAuthority::from_files(&ca.cert_path, "/nonexistent/ca.key", Duration::hours(1)).await;
  assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn bad_pem_is_a_config_error() {
  let ca = TestCa::new();
  let dir = tempfile::tempdir().unwrap();
  let garbage = dir.path().join("garbage.pem");
  std::fs::write(&garbage, "-----BEGIN CERTIFICATE-----\nnot base64!\n").unwrap();
  let result = CertificateAuthority::from_files(&garbage, &ca.key_path, Duration::hours(1)).await;
  assert!(matches!(result, Err(Error::Config(_))));

  // a certificate where the key should be
  let result = CertificateAuthority::from_files(&ca.cert_path, &ca.cert_path, Duration::hours(1)).await;
  assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn leaf_matches_host_and_root() {
  let ca = TestCa::new();
  let authority = ca.authority(Duration::hours(24)).await;
  assert!(authority.is_enabled());

  let before = OffsetDateTime::now_utc().unix_timestamp();
  let leaf = authority.obtain_leaf_certificate("example.com").await.unwrap();
  assert_eq!(leaf.host(), "example.com");
  assert_eq!(leaf.chain().len(), 2);
  assert_eq!(leaf.chain()[1], ca.cert_der);
  assert!(leaf.cert_pem().contains("BEGIN CERTIFICATE"));
  assert!(leaf.key_pem().contains("BEGIN PRIVATE KEY"));

  let (_, cert) = parse_x509_certificate(leaf.chain()[0].as_ref()).expect("parse x509");
  let san = cert
    .subject_alternative_name()
    .expect("san extension parse")
    .expect("san extension present");
  assert_eq!(san.value.general_names.len(), 1);
  assert!(matches!(san.value.general_names[0], GeneralName::DNSName("example.com")));

  let issuer_cn = cert
    .issuer()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok());
  assert_eq!(issuer_cn, Some(ROOT_CN));

  let not_before = cert.validity().not_before.timestamp();
  let not_after = cert.validity().not_after.timestamp();
  assert!((not_before - (before - 3600)).abs() <= 5);
  assert_eq!(not_after, leaf.not_after().unix_timestamp());
  assert!((not_after - (before + 24 * 3600)).abs() <= 5);

  let key_usage = cert.key_usage().unwrap().expect("key usage present");
  assert!(key_usage.value.digital_signature());
  let eku = cert
    .extended_key_usage()
    .unwrap()
    .expect("extended key usage present");
  assert!(eku.value.server_auth);
  assert!(eku.value.client_auth);

  // 128-bit serial, possibly with a sign byte
  let serial = cert.tbs_certificate.raw_serial();
  assert!(!serial.is_empty() && serial.len() <= 17);
}

#[tokio::test]
async fn lifetime_past_the_calendar_is_a_crypto_error() {
  let ca = TestCa::new();
  let authority = ca.authority(Duration::hours(100_000_000_000_000)).await;
  let result = authority.obtain_leaf_certificate("example.com").await;
  assert!(matches!(result, Err(Error::Crypto(_))));
}

#[tokio::test]
async fn ip_hosts_get_ip_sans() {
  let ca = TestCa::new();
  let authority = ca.authority(Duration::hours(1)).await;
  let leaf = authority.obtain_leaf_certificate("127.0.0.1").await.unwrap();
  let (_, cert) = parse_x509_certificate(leaf.chain()[0].as_ref()).expect("parse x509");
  let san = cert.subject_alternative_name().unwrap().unwrap();
  assert!(san
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == [127, 0, 0, 1])));
}

#[tokio::test]
async fn fresh_certificates_are_cached() {
  let ca = TestCa::new();
  let authority = ca.authority(Duration::hours(1)).await;
  let first = authority.obtain_leaf_certificate("example.com").await.unwrap();
  let second = authority.obtain_leaf_certificate("EXAMPLE.com").await.unwrap();
  assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn certificates_near_expiry_are_reissued() {
  let ca = TestCa::new();
  // shorter than the one minute margin: never served from the cache
  let authority = ca.authority(Duration::seconds(30)).await;
  let first = authority.obtain_leaf_certificate("example.com").await.unwrap();
  let second = authority.obtain_leaf_certificate("example.com").await.unwrap();
  assert!(!Arc::ptr_eq(&first, &second));
  assert_ne!(first.chain()[0], second.chain()[0]);
}

#[tokio::test]
async fn serials_differ_within_one_second() {
  let ca = TestCa::new();
  let authority = ca.authority(Duration::hours(1)).await;
  let a = authority.obtain_leaf_certificate("a.example.com").await.unwrap();
  let b = authority.obtain_leaf_certificate("b.example.com").await.unwrap();
  let (_, a) = parse_x509_certificate(a.chain()[0].as_ref()).unwrap();
  let (_, b) = parse_x509_certificate(b.chain()[0].as_ref()).unwrap();
  assert_ne!(a.tbs_certificate.raw_serial(), b.tbs_certificate.raw_serial());
}

#[tokio::test]
async fn concurrent_requests_all_get_valid_certificates() {
  let ca = TestCa::new();
  let authority = Arc::new(ca.authority(Duration::hours(1)).await);
  let tasks = (0..16).map(|i| {
    let authority = authority.clone();
    async move {
      let host = if i % 2 == 0 {
        "shared.example.com".to_string()
      } else {
        format!("host{}.example.com", i)
      };
      let leaf = authority.obtain_leaf_certificate(&host).await.unwrap();
      (host, leaf)
    }
  });
  for (host, leaf) in futures::future::join_all(tasks).await {
    assert_eq!(leaf.host(), host);
    let (_, cert) = parse_x509_certificate(leaf.chain()[0].as_ref()).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(matches!(san.value.general_names[0], GeneralName::DNSName(name) if name == host));
  }
}

#[tokio::test]
async fn wraps_a_stream_as_tls_server() {
  let ca = TestCa::new();
  let authority = Arc::new(ca.authority(Duration::hours(1)).await);
  let (client_io, server_io) = tokio::io::duplex(16 * 1024);

  let server = {
    let authority = authority.clone();
    tokio::spawn(async move {
      let mut tls = authority
        .wrap_as_server(server_io, "example.com")
        .await
        .unwrap();
      let mut buf = [0u8; 5];
      tls.read_exact(&mut buf).await.unwrap();
      tls.write_all(&buf).await.unwrap();
      tls.flush().await.unwrap();
    })
  };

  let mut config = ca.client_config();
  config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
  let connector = TlsConnector::from(Arc::new(config));
  let mut tls = connector
    .connect(ServerName::try_from("example.com").unwrap(), client_io)
    .await
    .unwrap();
  assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));
  tls.write_all(b"hello").await.unwrap();
  let mut echoed = [0u8; 5];
  tls.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"hello");
  server.await.unwrap();
}

#[tokio::test]
async fn interception_can_be_toggled() {
  let ca = TestCa::new();
  let authority = ca.authority(Duration::hours(1)).await;
  authority.set_enabled(false);
  assert!(!authority.is_enabled());
  authority.set_enabled(true);
  assert!(authority.is_enabled());
  assert_eq!(authority.root_cert_der(), &ca.cert_der);
  assert_eq!(authority.root_cert_pem(), ca.cert_pem);
}
