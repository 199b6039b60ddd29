//! Blind byte relay between a client and an origin

use crate::connector::{Connector, Target};
use crate::errors::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Byte counts moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
  /// client to origin
  pub sent: u64,
  /// origin to client
  pub received: u64,
}

/// Copy bytes both ways until each side has finished sending
///
/// Each direction runs until EOF or an error on its reader, then shuts down
/// the opposite writer so the peer sees the close. The relay ends only once
/// both directions are done.
pub async fn relay<C, O>(client: C, origin: O) -> RelayStats
where
  C: AsyncRead + AsyncWrite + Unpin,
  O: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut origin_read, mut origin_write) = tokio::io::split(origin);

  let client_to_origin = async {
    let sent = tokio::io::copy(&mut client_read, &mut origin_write).await;
    let _ = origin_write.shutdown().await;
    sent
  };
  let origin_to_client = async {
    let received = tokio::io::copy(&mut origin_read, &mut client_write).await;
    let _ = client_write.shutdown().await;
    received
  };
  let (sent, received) = tokio::join!(client_to_origin, origin_to_client);

  RelayStats {
    sent: sent.unwrap_or_else(|e| {
      trace!("client to origin copy ended: {}", e);
      0
    }),
    received: received.unwrap_or_else(|e| {
      trace!("origin to client copy ended: {}", e);
      0
    }),
  }
}

/// Dial `target` in the clear and relay `client` to it
pub async fn tunnel<C>(connector: &Connector, client: C, target: &Target) -> Result<RelayStats>
where
  C: AsyncRead + AsyncWrite + Unpin,
{
  let plain = Target::new(target.host(), target.port(), false);
  let origin = connector.connect(&plain).await?;
  let stats = relay(client, origin).await;
  debug!(
    target = %plain.addr(),
    sent = stats.sent,
    received = stats.received,
    "tunnel closed"
  );
  Ok(stats)
}
