#![deny(missing_docs)]

//! # hat
//!
//! A forward HTTP(S) proxy that can see inside TLS.
//!
//! Plain HTTP requests are forwarded to their origin. `CONNECT` tunnels are
//! either relayed blind or, when interception is enabled, terminated with a
//! per-host certificate forged on the fly and signed by a locally trusted
//! root, so the requests inside can be inspected.
//!
//! Every request goes through a [`PolicyEngine`]: user-defined [`Rule`]s
//! match on the requesting device and the request itself, and the first
//! match decides whether the request is blocked, the client dropped, or the
//! request redirected.
//!
//! ## Running a proxy
//!
//! ```no_run
//! use hat::{Config, Environment, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> hat::Result<()> {
//! let config = Config::load(Config::default_path()?)?;
//! let env = Environment::initialize(&config).await?;
//! let store = Arc::new(MemoryStore::new());
//! env.serve(store, async {
//!   let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Certificates
//!
//! The root certificate and its PKCS#8 key are read once at startup. Leaf
//! certificates are ECDSA P-256, valid from one hour in the past for the
//! configured lifetime, and cached per host until they are about to expire.
//! See [`CertificateAuthority`].

pub mod ca;
pub mod config;
/// Origin dialing and request forwarding
pub mod connector;
pub mod errors;
pub mod http1;
pub mod policy;
pub mod proxy;
pub mod server;
/// Plain or TLS origin streams
pub mod socket;
pub mod store;
pub mod tunnel;

pub use ca::{CertificateAuthority, LeafCertificate};
pub use config::Config;
pub use connector::{Connector, ConnectorBuilder, Target};
pub use errors::{Error, Result};
pub use policy::{Action, Condition, EvaluationContext, PolicyEngine, Rule, Trigger};
pub use proxy::Environment;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use store::{Device, MemoryStore, Store, User};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
