// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream that can be rendezvoused and bridged by the exchange
///
/// Implemented for anything that is readable, writable, sendable, and [Unpin];
/// in practice TCP sockets on the wire and `tokio::io::DuplexStream` in tests.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized {}

#[cfg(test)]
mod tests {
  use super::TunnelStream;

  fn assert_tunnel_stream<T: TunnelStream + ?Sized>(_: &T) {}

  #[test]
  fn duplex_and_boxed_streams_are_tunnel_streams() {
    let (a, _b) = tokio::io::duplex(64);
    assert_tunnel_stream(&a);
    let boxed: Box<dyn TunnelStream> = Box::new(a);
    assert_tunnel_stream(&boxed);
  }
}
