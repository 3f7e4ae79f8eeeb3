// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use revex::{
  common::exchange::{Exchange, InMemoryRegistry, PendingRequests},
  server::{ControlServer, DataPlaneServer, ProxyFront},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::ExchangeSettings;

async fn bind(role: &str, addr: &str) -> Result<TcpListener> {
  TcpListener::bind(addr)
    .await
    .with_context(|| format!("Failed to bind {} listener on {}", role, addr))
}

/// Runs the control plane, data plane, and proxy front until `shutdown`
pub async fn exchange_main(settings: ExchangeSettings, shutdown: CancellationToken) -> Result<()> {
  let (control, data_plane, front) = futures::join!(
    bind("control", &settings.control_addr),
    bind("data-plane", &settings.data_plane_addr),
    bind("proxy front", &settings.front_addr),
  );
  let (control, data_plane, front) = match (control, data_plane, front) {
    (Ok(control), Ok(data_plane), Ok(front)) => (control, data_plane, front),
    (control, data_plane, front) => {
      let failures = [control.err(), data_plane.err(), front.err()]
        .into_iter()
        .flatten()
        .map(|error| format!("{:#}", error))
        .collect::<Vec<_>>();
      anyhow::bail!(failures.join("; "));
    }
  };

  let exchange: Exchange<TcpStream> = Exchange::new(
    Arc::new(InMemoryRegistry::new()),
    Arc::new(PendingRequests::new()),
  );
  let control_server = ControlServer::new(exchange.clone());
  let data_plane_server =
    DataPlaneServer::new(exchange.clone(), settings.flavor).with_concurrency(settings.concurrency);
  let proxy_front = ProxyFront::new(exchange).with_dial_timeout(settings.dial_timeout);

  futures::join!(
    control_server.run(control, shutdown.clone()),
    data_plane_server.run(data_plane, shutdown.clone()),
    proxy_front.run(front, shutdown.clone()),
  );
  Ok(())
}
