// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional splicing of two byte streams

use std::{
  fmt,
  io,
  time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BRIDGE_BUFFER_CAPACITY: usize = 1024 * 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
  /// Bytes copied from `src` to `dest`
  pub sent: u64,
  /// Bytes copied from `dest` to `src`
  pub received: u64,
  pub duration: Duration,
}

/// Several I/O errors reported together
#[derive(Debug, Default)]
pub struct IoErrors(pub Vec<io::Error>);

impl IoErrors {
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &io::Error> {
    self.0.iter()
  }

  fn into_result(self) -> Result<(), Self> {
    if self.is_empty() {
      Ok(())
    } else {
      Err(self)
    }
  }
}

impl fmt::Display for IoErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (index, error) in self.0.iter().enumerate() {
      if index > 0 {
        f.write_str("; ")?;
      }
      write!(f, "{}", error)?;
    }
    Ok(())
  }
}

impl std::error::Error for IoErrors {}

#[derive(thiserror::Error, Debug)]
#[error("Bridge failed after sending {} and receiving {} bytes: {errors}", .stats.sent, .stats.received)]
pub struct BridgeError {
  pub stats: Stats,
  pub errors: IoErrors,
}

#[derive(thiserror::Error, Debug)]
#[error("Failed to close bridge: {0}")]
pub struct CloseError(pub IoErrors);

/// Errors expected during routine teardown of a connection
pub fn is_benign_teardown(error: &io::Error) -> bool {
  matches!(
    error.kind(),
    io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::BrokenPipe
      | io::ErrorKind::NotConnected
  )
}

/// Splices `src` and `dest` until both directions end or the bridge is cancelled
pub struct Bridge<A, B> {
  src: A,
  dest: B,
}

impl<A, B> Bridge<A, B>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  pub fn new(src: A, dest: B) -> Self {
    Self { src, dest }
  }

  /// Copies both directions concurrently, then closes both sides
  ///
  /// A direction reaching EOF half-closes its destination and the other
  /// direction keeps running. A copy error in either direction, or
  /// cancellation, tears the whole bridge down: the other direction stops
  /// at its next suspension point, and whatever error it already hit is
  /// collected too. Reset-class errors are treated as ordinary teardown;
  /// everything else is reported together with the byte counts moved so far.
  pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Stats, BridgeError> {
    let started = Instant::now();
    let teardown = cancel.child_token();
    let mut sent = 0u64;
    let mut received = 0u64;
    let (outbound, inbound) = {
      let (mut src_reader, mut src_writer) = tokio::io::split(&mut self.src);
      let (mut dest_reader, mut dest_writer) = tokio::io::split(&mut self.dest);
      futures::join!(
        pump(&mut src_reader, &mut dest_writer, &mut sent, &teardown),
        pump(&mut dest_reader, &mut src_writer, &mut received, &teardown),
      )
    };
    if cancel.is_cancelled() {
      tracing::debug!("bridge_cancelled");
    }
    let mut errors: Vec<io::Error> = outbound.err().into_iter().chain(inbound.err()).collect();
    if let Err(CloseError(IoErrors(close_errors))) = self.close().await {
      errors.extend(close_errors);
    }
    errors.retain(|error| !is_benign_teardown(error));

    let stats = Stats {
      sent,
      received,
      duration: started.elapsed(),
    };
    tracing::trace!(?stats, "bridge_finished");
    match IoErrors(errors).into_result() {
      Ok(()) => Ok(stats),
      Err(errors) => Err(BridgeError { stats, errors }),
    }
  }

  /// Shuts down both sides concurrently, reporting every failure
  pub async fn close(&mut self) -> Result<(), CloseError> {
    let (src, dest) = futures::join!(self.src.shutdown(), self.dest.shutdown());
    IoErrors(src.err().into_iter().chain(dest.err()).collect())
      .into_result()
      .map_err(CloseError)
  }
}

/// Copies one direction until EOF, an error, or `teardown`
///
/// An error cancels `teardown` so the opposite direction winds down as well.
/// Operations that are already complete win over `teardown`, so an error the
/// opposite side has already hit is still returned.
async fn pump<R, W>(
  reader: &mut R,
  writer: &mut W,
  moved: &mut u64,
  teardown: &CancellationToken,
) -> io::Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let res = copy_until_teardown(reader, writer, moved, teardown).await;
  if let Err(error) = &res {
    tracing::debug!(?error, "bridge_copy_failed");
    teardown.cancel();
  }
  res
}

async fn copy_until_teardown<R, W>(
  reader: &mut R,
  writer: &mut W,
  moved: &mut u64,
  teardown: &CancellationToken,
) -> io::Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; BRIDGE_BUFFER_CAPACITY];
  loop {
    let read = tokio::select! {
      biased;
      read = reader.read(&mut buffer) => read?,
      _ = teardown.cancelled() => return Ok(()),
    };
    if read == 0 {
      return writer.shutdown().await;
    }
    let mut offset = 0;
    while offset < read {
      let written = tokio::select! {
        biased;
        written = writer.write(&buffer[offset..read]) => written?,
        _ = teardown.cancelled() => return Ok(()),
      };
      if written == 0 {
        return Err(io::ErrorKind::WriteZero.into());
      }
      offset += written;
      *moved += written as u64;
    }
    writer.flush().await?;
  }
}

#[cfg(test)]
mod tests {
  use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
  };

  use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
  use tokio_util::sync::CancellationToken;

  use super::{Bridge, CloseError};

  const PATIENCE: Duration = Duration::from_secs(5);

  /// Reads fail with `read_error` if set, or EOF
  ///
  /// Writes are swallowed, up to `write_budget` bytes when one is set; past
  /// the budget they fail.
  #[derive(Default)]
  struct ScriptedStream {
    read_error: Option<io::ErrorKind>,
    write_budget: Option<usize>,
    fail_shutdown: bool,
  }

  impl AsyncRead for ScriptedStream {
    fn poll_read(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
      Poll::Ready(match self.read_error {
        Some(kind) => Err(io::Error::new(kind, "scripted read failure")),
        None => Ok(()),
      })
    }
  }

  impl AsyncWrite for ScriptedStream {
    fn poll_write(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      buf: &[u8],
    ) -> Poll<io::Result<usize>> {
      let this = self.get_mut();
      Poll::Ready(match this.write_budget.as_mut() {
        None => Ok(buf.len()),
        Some(0) => Err(io::Error::new(io::ErrorKind::Other, "scripted write failure")),
        Some(budget) => {
          let accepted = buf.len().min(*budget);
          *budget -= accepted;
          Ok(accepted)
        }
      })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Ready(if self.fail_shutdown {
        Err(io::Error::new(io::ErrorKind::Other, "scripted shutdown failure"))
      } else {
        Ok(())
      })
    }
  }

  #[tokio::test]
  async fn copies_both_directions_until_clean_eof() {
    let (mut client, bridge_src) = duplex(1024);
    let (bridge_dest, mut server) = duplex(1024);
    let request = b"request".repeat(1000);
    let response = b"response".repeat(500);

    let bridge = tokio::spawn(async move {
      Bridge::new(bridge_src, bridge_dest)
        .run(&CancellationToken::new())
        .await
    });
    let client_side = {
      let request = request.clone();
      async move {
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        echoed
      }
    };
    let server_side = {
      let response = response.clone();
      async move {
        let mut seen = Vec::new();
        server.read_to_end(&mut seen).await.unwrap();
        server.write_all(&response).await.unwrap();
        server.shutdown().await.unwrap();
        seen
      }
    };
    let (from_server, at_server) = tokio::time::timeout(PATIENCE, async {
      futures::join!(client_side, server_side)
    })
    .await
    .unwrap();
    assert_eq!(at_server, request);
    assert_eq!(from_server, response);

    let stats = tokio::time::timeout(PATIENCE, bridge)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(stats.sent, request.len() as u64);
    assert_eq!(stats.received, response.len() as u64);
  }

  #[tokio::test]
  async fn cancellation_closes_both_sides() {
    let (mut client, bridge_src) = duplex(64);
    let (bridge_dest, mut server) = duplex(64);
    let cancel = CancellationToken::new();
    let bridge = tokio::spawn({
      let cancel = cancel.clone();
      async move { Bridge::new(bridge_src, bridge_dest).run(&cancel).await }
    });
    tokio::task::yield_now().await;
    cancel.cancel();
    let stats = tokio::time::timeout(PATIENCE, bridge)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!((stats.sent, stats.received), (0, 0));

    let mut buf = Vec::new();
    assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn copy_failure_is_reported() {
    let (bridge_dest, _server) = duplex(64);
    let src = ScriptedStream {
      read_error: Some(io::ErrorKind::InvalidData),
      ..Default::default()
    };
    let err = tokio::time::timeout(
      PATIENCE,
      Bridge::new(src, bridge_dest).run(&CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.errors.len(), 1);
    assert_eq!(
      err.errors.iter().next().unwrap().kind(),
      io::ErrorKind::InvalidData
    );
    assert_eq!(err.stats.sent, 0);
  }

  #[tokio::test]
  async fn reset_is_not_a_failure() {
    let (bridge_dest, _server) = duplex(64);
    let src = ScriptedStream {
      read_error: Some(io::ErrorKind::ConnectionReset),
      ..Default::default()
    };
    let res = tokio::time::timeout(
      PATIENCE,
      Bridge::new(src, bridge_dest).run(&CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(res.is_ok());
  }

  #[tokio::test]
  async fn close_joins_every_failure() {
    let failing = || ScriptedStream {
      fail_shutdown: true,
      ..Default::default()
    };
    let mut bridge = Bridge::new(failing(), failing());
    let CloseError(errors) = bridge.close().await.unwrap_err();
    assert_eq!(errors.len(), 2);
    let rendered = errors.to_string();
    assert_eq!(rendered.matches("scripted shutdown failure").count(), 2);
  }

  #[tokio::test]
  async fn failures_in_both_directions_are_all_reported() {
    let src = ScriptedStream {
      read_error: Some(io::ErrorKind::InvalidData),
      ..Default::default()
    };
    let dest = ScriptedStream {
      read_error: Some(io::ErrorKind::PermissionDenied),
      ..Default::default()
    };
    let err = tokio::time::timeout(
      PATIENCE,
      Bridge::new(src, dest).run(&CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    let mut kinds: Vec<_> = err.errors.iter().map(io::Error::kind).collect();
    kinds.sort_by_key(|kind| format!("{:?}", kind));
    assert_eq!(
      kinds,
      vec![io::ErrorKind::InvalidData, io::ErrorKind::PermissionDenied]
    );
  }

  #[tokio::test]
  async fn partial_write_before_failure_is_counted() {
    let (mut client, bridge_src) = duplex(64);
    let dest = ScriptedStream {
      write_budget: Some(3),
      ..Default::default()
    };
    client.write_all(b"hello").await.unwrap();
    let err = tokio::time::timeout(
      PATIENCE,
      Bridge::new(bridge_src, dest).run(&CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.stats.sent, 3);
    assert_eq!(err.errors.len(), 1);
    assert_eq!(
      err.errors.iter().next().unwrap().kind(),
      io::ErrorKind::Other
    );
  }
}
