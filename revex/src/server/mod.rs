// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Exchange-side listeners: the control plane, the data plane, and the proxy front

use std::{future::Future, time::Duration};

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  exchange::{CorrelationId, Exchange, InMemoryRegistry, PendingRequestError, RegistrationStore},
  protocol::handshake::{self, HandshakeError, HandshakeFlavor},
};

pub mod control;
pub mod front;

pub use control::ControlServer;
pub use front::ProxyFront;

/// In-flight data-plane handshakes admitted at once
pub const DEFAULT_DATA_PLANE_CONCURRENCY: usize = 25;

/// Time a dialed-back socket gets to complete its handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts until `shutdown`, running `handler` as its own task per connection
///
/// At most `concurrency` handlers run at once when a limit is given. Accept
/// errors are logged and retried after a back-off. Returns once shutdown is
/// requested and every running handler has finished.
pub(crate) async fn serve_listener<F, Fut>(
  listener: TcpListener,
  shutdown: &CancellationToken,
  concurrency: Option<usize>,
  handler: F,
) where
  F: Fn(TcpStream) -> Fut,
  Fut: Future<Output = ()> + Send + 'static,
{
  TcpListenerStream::new(listener)
    .take_until(shutdown.cancelled())
    .filter_map(|accepted| async move {
      match accepted {
        Ok(stream) => Some(stream),
        Err(error) => {
          tracing::warn!(?error, "accept_failed");
          tokio::time::sleep(ACCEPT_BACKOFF).await;
          None
        }
      }
    })
    .for_each_concurrent(concurrency, |stream| {
      let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
      let task = handler(stream).instrument(tracing::info_span!("connection", %peer));
      async move {
        if let Err(error) = tokio::task::spawn(task).await {
          tracing::error!(?error, "connection_task_failed");
        }
      }
    })
    .await;
}

#[derive(thiserror::Error, Debug)]
pub enum DataPlaneError {
  #[error("Data-plane handshake failed: {0}")]
  Handshake(#[from] HandshakeError),
  #[error("Data-plane connection could not be delivered: {0}")]
  Rendezvous(#[from] PendingRequestError),
  #[error("Data-plane handshake did not complete within {0:?}")]
  HandshakeTimeout(Duration),
  #[error("Listener shut down before the handshake completed")]
  Shutdown,
}

/// Binds dialed-back connections to the requests waiting on them
pub struct DataPlaneServer<TRegistry: ?Sized = InMemoryRegistry> {
  exchange: Exchange<TcpStream, TRegistry>,
  flavor: HandshakeFlavor,
  concurrency: usize,
  handshake_timeout: Duration,
}

impl<TRegistry> DataPlaneServer<TRegistry>
where
  TRegistry: RegistrationStore + ?Sized + 'static,
{
  pub fn new(exchange: Exchange<TcpStream, TRegistry>, flavor: HandshakeFlavor) -> Self {
    Self {
      exchange,
      flavor,
      concurrency: DEFAULT_DATA_PLANE_CONCURRENCY,
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
    }
  }

  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
    self.handshake_timeout = handshake_timeout;
    self
  }

  pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) {
    tracing::info!(
      addr = ?listener.local_addr().ok(),
      flavor = %self.flavor,
      concurrency = self.concurrency,
      "data_plane_listening"
    );
    serve_listener(listener, &shutdown, Some(self.concurrency), |stream| {
      let exchange = self.exchange.clone();
      let flavor = self.flavor;
      let handshake_timeout = self.handshake_timeout;
      let shutdown = shutdown.clone();
      async move {
        let binding = tokio::time::timeout(handshake_timeout, bind_connection(&exchange, flavor, stream));
        let bound = tokio::select! {
          bound = binding => bound.unwrap_or(Err(DataPlaneError::HandshakeTimeout(handshake_timeout))),
          _ = shutdown.cancelled() => Err(DataPlaneError::Shutdown),
        };
        match bound {
          Ok(id) => tracing::debug!(%id, "data_plane_connection_delivered"),
          // Dropping the stream closes it
          Err(error) => tracing::warn!(%error, "data_plane_connection_dropped"),
        }
      }
    })
    .await;
    tracing::info!("data_plane_stopped");
  }
}

async fn bind_connection<TRegistry>(
  exchange: &Exchange<TcpStream, TRegistry>,
  flavor: HandshakeFlavor,
  mut stream: TcpStream,
) -> Result<CorrelationId, DataPlaneError>
where
  TRegistry: RegistrationStore + ?Sized,
{
  let id = handshake::accept(&mut stream, flavor).await?;
  exchange.add_connection(id, stream)?;
  Ok(id)
}
