// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A minimal dial front: one framed `service.namespace` request, one status byte, then raw bytes

use std::time::Duration;

use tokio::{io::AsyncWriteExt, net::TcpListener};
use tokio_util::sync::CancellationToken;

use super::serve_listener;
use crate::{
  common::{
    exchange::{Exchange, ExchangeError, InMemoryRegistry, RegistrationStore},
    protocol::address::{AddressError, ServiceAddress},
  },
  util::{
    bridge::{Bridge, BridgeError, Stats},
    framed::{read_frame, ReadError},
    tunnel_stream::TunnelStream,
  },
};

pub const FRONT_STATUS_CONNECTED: u8 = 0;
pub const FRONT_STATUS_REFUSED: u8 = 1;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest address frame accepted from a client
const MAX_ADDRESS_LENGTH: usize = 512;

#[derive(thiserror::Error, Debug)]
pub enum FrontError {
  #[error("Failed to read dial request: {0}")]
  Request(#[from] ReadError),
  #[error("Front shut down before the dial request arrived")]
  Shutdown,
  #[error("Dial request was not valid UTF-8")]
  Encoding,
  #[error(transparent)]
  Address(#[from] AddressError),
  #[error("Dial to {address} failed: {error}")]
  Dial {
    address: ServiceAddress,
    #[source]
    error: ExchangeError,
  },
  #[error("Dial to {0} timed out")]
  DialTimeout(ServiceAddress),
  #[error("Failed to acknowledge dial: {0}")]
  Reply(#[source] std::io::Error),
  #[error(transparent)]
  Bridge(#[from] BridgeError),
}

/// Accepts dial requests for `service.namespace` and splices them with dialed-back connections
pub struct ProxyFront<TStream, TRegistry: ?Sized = InMemoryRegistry> {
  exchange: Exchange<TStream, TRegistry>,
  dial_timeout: Duration,
}

impl<TStream, TRegistry: ?Sized> Clone for ProxyFront<TStream, TRegistry> {
  fn clone(&self) -> Self {
    Self {
      exchange: self.exchange.clone(),
      dial_timeout: self.dial_timeout,
    }
  }
}

impl<TStream, TRegistry> ProxyFront<TStream, TRegistry>
where
  TStream: TunnelStream + 'static,
  TRegistry: RegistrationStore + ?Sized + 'static,
{
  pub fn new(exchange: Exchange<TStream, TRegistry>) -> Self {
    Self {
      exchange,
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
    }
  }

  pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
    self.dial_timeout = dial_timeout;
    self
  }

  pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) {
    tracing::info!(
      addr = ?listener.local_addr().ok(),
      dial_timeout = ?self.dial_timeout,
      "proxy_front_listening"
    );
    serve_listener(listener, &shutdown, None, |stream| {
      let this = self.clone();
      let shutdown = shutdown.clone();
      async move {
        match this.serve_client(stream, &shutdown).await {
          Ok(stats) => tracing::info!(
            sent = stats.sent,
            received = stats.received,
            duration = ?stats.duration,
            "proxy_session_finished"
          ),
          Err(error) => tracing::warn!(%error, "proxy_session_failed"),
        }
      }
    })
    .await;
    tracing::info!("proxy_front_stopped");
  }

  /// Serves one client: parse its request, dial through the exchange, reply, then bridge
  #[tracing::instrument(level = "debug", skip(self, client, shutdown), err)]
  pub async fn serve_client<C>(&self, mut client: C, shutdown: &CancellationToken) -> Result<Stats, FrontError>
  where
    C: TunnelStream,
  {
    let requested = tokio::select! {
      requested = read_address(&mut client) => requested,
      _ = shutdown.cancelled() => return Err(FrontError::Shutdown),
    };
    let address = match requested {
      Ok(address) => address,
      Err(error) => {
        refuse(&mut client).await;
        return Err(error);
      }
    };

    let dial = shutdown.child_token();
    let dialed = tokio::time::timeout(
      self.dial_timeout,
      self.exchange.new_connection(&dial, &address),
    )
    .await;
    let connection = match dialed {
      Ok(Ok(connection)) => connection,
      Ok(Err(error)) => {
        refuse(&mut client).await;
        return Err(FrontError::Dial { address, error });
      }
      Err(_elapsed) => {
        refuse(&mut client).await;
        return Err(FrontError::DialTimeout(address));
      }
    };

    client
      .write_all(&[FRONT_STATUS_CONNECTED])
      .await
      .map_err(FrontError::Reply)?;
    client.flush().await.map_err(FrontError::Reply)?;
    tracing::debug!(%address, "dial_connected");

    Ok(Bridge::new(client, connection).run(shutdown).await?)
  }
}

async fn read_address<C: TunnelStream>(client: &mut C) -> Result<ServiceAddress, FrontError> {
  let frame = read_frame(&mut *client, Some(MAX_ADDRESS_LENGTH)).await?;
  let address = std::str::from_utf8(&frame).map_err(|_| FrontError::Encoding)?;
  Ok(address.parse()?)
}

async fn refuse<C: TunnelStream>(client: &mut C) {
  if let Err(error) = client.write_all(&[FRONT_STATUS_REFUSED]).await {
    tracing::debug!(?error, "refusal_not_delivered");
    return;
  }
  if let Err(error) = client.flush().await {
    tracing::debug!(?error, "refusal_not_delivered");
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::{TcpListener, TcpStream},
  };
  use tokio_util::sync::CancellationToken;

  use super::{FrontError, ProxyFront, FRONT_STATUS_CONNECTED, FRONT_STATUS_REFUSED};
  use crate::{
    common::exchange::{Exchange, InMemoryRegistry, PendingRequests},
    util::framed::write_frame,
  };

  const PATIENCE: Duration = Duration::from_secs(5);

  fn exchange() -> Exchange<DuplexStream> {
    Exchange::new(
      Arc::new(InMemoryRegistry::new()),
      Arc::new(PendingRequests::new()),
    )
  }

  #[tokio::test]
  async fn unknown_namespace_is_refused() {
    let front = ProxyFront::new(exchange());
    let (mut client, front_side) = duplex(256);
    write_frame(&mut client, b"svc1.missing:80").await.unwrap();
    let res = front
      .serve_client(front_side, &CancellationToken::new())
      .await;
    assert!(matches!(res, Err(FrontError::Dial { .. })));
    assert_eq!(client.read_u8().await.unwrap(), FRONT_STATUS_REFUSED);
  }

  #[tokio::test]
  async fn malformed_address_is_refused() {
    let front = ProxyFront::new(exchange());
    let (mut client, front_side) = duplex(256);
    write_frame(&mut client, b"no-namespace").await.unwrap();
    let res = front
      .serve_client(front_side, &CancellationToken::new())
      .await;
    assert!(matches!(res, Err(FrontError::Address(_))));
    assert_eq!(client.read_u8().await.unwrap(), FRONT_STATUS_REFUSED);
  }

  #[tokio::test]
  async fn unanswered_dial_times_out() {
    let exchange = exchange();
    let registration = exchange.register_rev_proxy("example", ["svc1"]).unwrap();
    registration.start(&CancellationToken::new()).unwrap();
    // Nobody drains the command stream, so the dial never progresses
    let _commands = registration.command_stream().unwrap();
    let front = ProxyFront::new(exchange.clone()).with_dial_timeout(Duration::from_millis(50));
    let (mut client, front_side) = duplex(256);
    write_frame(&mut client, b"svc1.example").await.unwrap();
    let res = tokio::time::timeout(
      PATIENCE,
      front.serve_client(front_side, &CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(matches!(res, Err(FrontError::DialTimeout(_))));
    assert_eq!(client.read_u8().await.unwrap(), FRONT_STATUS_REFUSED);
    assert!(exchange.pending().is_empty());
  }

  #[tokio::test]
  async fn connected_dial_is_bridged() {
    let exchange = exchange();
    let registration = exchange.register_rev_proxy("example", ["svc1"]).unwrap();
    registration.start(&CancellationToken::new()).unwrap();
    let mut commands = registration.command_stream().unwrap();
    let front = ProxyFront::new(exchange.clone());
    let (mut client, front_side) = duplex(256);
    let served = tokio::spawn(async move {
      front
        .serve_client(front_side, &CancellationToken::new())
        .await
    });

    write_frame(&mut client, b"svc1.example").await.unwrap();
    let command = tokio::time::timeout(PATIENCE, commands.next())
      .await
      .unwrap()
      .unwrap();
    let (dialed_back, mut service) = duplex(256);
    exchange
      .add_connection(command.correlation_id, dialed_back)
      .unwrap();
    assert_eq!(client.read_u8().await.unwrap(), FRONT_STATUS_CONNECTED);

    client.write_all(b"hello").await.unwrap();
    client.shutdown().await.unwrap();
    let mut seen = Vec::new();
    service.read_to_end(&mut seen).await.unwrap();
    assert_eq!(seen, b"hello");
    service.write_all(b"bye").await.unwrap();
    service.shutdown().await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"bye");

    let stats = tokio::time::timeout(PATIENCE, served)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!((stats.sent, stats.received), (5, 3));
  }

  #[tokio::test]
  async fn shutdown_interrupts_a_pending_request() {
    let front = ProxyFront::new(exchange());
    let (_client, front_side) = duplex(256);
    let shutdown = CancellationToken::new();
    let served = tokio::spawn({
      let shutdown = shutdown.clone();
      async move { front.serve_client(front_side, &shutdown).await }
    });
    tokio::task::yield_now().await;

    shutdown.cancel();
    let res = tokio::time::timeout(PATIENCE, served).await.unwrap().unwrap();
    assert!(matches!(res, Err(FrontError::Shutdown)));
  }

  #[tokio::test]
  async fn listener_stops_despite_a_silent_client() {
    let front = ProxyFront::new(exchange());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
      let shutdown = shutdown.clone();
      async move { front.run(listener, shutdown).await }
    });

    let _silent = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    tokio::time::timeout(PATIENCE, server).await.unwrap().unwrap();
  }
}
