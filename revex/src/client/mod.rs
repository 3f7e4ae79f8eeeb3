// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The registered party: offers local services to an exchange and dials back on demand

use std::collections::BTreeMap;

use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    exchange::{CorrelationId, RoutingCommand},
    protocol::{
      control::{ControlMessage, RegisterRequest},
      handshake::{self, HandshakeError, HandshakeFlavor},
    },
  },
  util::{
    bridge::{Bridge, BridgeError, Stats},
    framed::{read_framed_json, write_framed_json, JsonReadError, JsonWriteError, MAX_CONTROL_FRAME_LENGTH},
  },
};

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
  #[error("No services configured")]
  NoServices,
  #[error("Failed to connect to control plane at {addr}: {error}")]
  ControlConnect {
    addr: String,
    #[source]
    error: std::io::Error,
  },
  #[error("Failed to send registration: {0}")]
  Register(#[from] JsonWriteError),
  #[error("Control plane read failed: {0}")]
  ControlRead(#[from] JsonReadError),
  #[error("Registration rejected: {0}")]
  Rejected(String),
  #[error("Unexpected reply to registration: {0:?}")]
  UnexpectedReply(ControlMessage),
}

#[derive(thiserror::Error, Debug)]
pub enum DialBackError {
  #[error("Failed to reach local service {service} at {addr}: {error}")]
  Target {
    service: String,
    addr: String,
    #[source]
    error: std::io::Error,
  },
  #[error("Failed to reach data plane at {addr}: {error}")]
  DataPlane {
    addr: String,
    #[source]
    error: std::io::Error,
  },
  #[error("Data-plane handshake failed: {0}")]
  Handshake(#[from] HandshakeError),
  #[error(transparent)]
  Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
  pub namespace: String,
  pub control_addr: String,
  pub data_plane_addr: String,
  pub flavor: HandshakeFlavor,
  /// Service name to the `host:port` it is reachable at locally
  pub services: BTreeMap<String, String>,
}

/// Opens data-plane connections bound to a correlation ID
#[derive(Debug, Clone)]
pub struct DataPlaneConnector {
  addr: String,
  flavor: HandshakeFlavor,
}

impl DataPlaneConnector {
  pub fn new(addr: impl Into<String>, flavor: HandshakeFlavor) -> Self {
    Self {
      addr: addr.into(),
      flavor,
    }
  }

  pub async fn connect(&self, id: CorrelationId) -> Result<TcpStream, DialBackError> {
    let mut stream =
      TcpStream::connect(&self.addr)
        .await
        .map_err(|error| DialBackError::DataPlane {
          addr: self.addr.clone(),
          error,
        })?;
    handshake::initiate(&mut stream, self.flavor, id).await?;
    Ok(stream)
  }
}

pub struct Agent {
  config: AgentConfig,
  connector: DataPlaneConnector,
}

impl Agent {
  pub fn new(config: AgentConfig) -> Self {
    let connector = DataPlaneConnector::new(config.data_plane_addr.clone(), config.flavor);
    Self { config, connector }
  }

  pub fn config(&self) -> &AgentConfig {
    &self.config
  }

  /// Connects to the control plane and serves commands until it closes or `shutdown` is cancelled
  pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
    if self.config.services.is_empty() {
      return Err(AgentError::NoServices);
    }
    let control = TcpStream::connect(&self.config.control_addr)
      .await
      .map_err(|error| AgentError::ControlConnect {
        addr: self.config.control_addr.clone(),
        error,
      })?;
    tracing::info!(addr = %self.config.control_addr, "control_plane_connected");
    self.serve(control, shutdown).await
  }

  /// Registers over an established control connection, then dispatches its commands
  #[tracing::instrument(skip(self, control, shutdown), fields(namespace = %self.config.namespace))]
  pub async fn serve<S>(&self, control: S, shutdown: CancellationToken) -> Result<(), AgentError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin,
  {
    // The write half stays open for the session; the exchange treats its closure as departure
    let (mut reader, mut writer) = tokio::io::split(control);
    let request = RegisterRequest {
      namespace: self.config.namespace.clone(),
      services: self.config.services.keys().cloned().collect(),
    };
    write_framed_json(&mut writer, &request).await?;
    match read_framed_json::<_, ControlMessage>(&mut reader, Some(MAX_CONTROL_FRAME_LENGTH)).await? {
      ControlMessage::Registered { .. } => tracing::info!("registered"),
      ControlMessage::Rejected { reason } => return Err(AgentError::Rejected(reason)),
      other => return Err(AgentError::UnexpectedReply(other)),
    }

    loop {
      let message = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        message = read_framed_json::<_, ControlMessage>(&mut reader, Some(MAX_CONTROL_FRAME_LENGTH)) => message,
      };
      match message {
        Ok(ControlMessage::Connect(command)) => self.dispatch(command, &shutdown),
        Ok(other) => tracing::warn!(message = ?other, "unexpected_control_message"),
        Err(JsonReadError::Read(error)) if error.is_clean_close() => {
          tracing::info!("control_plane_closed");
          return Ok(());
        }
        Err(error) => return Err(error.into()),
      }
    }
  }

  fn dispatch(&self, command: RoutingCommand, shutdown: &CancellationToken) {
    if command.namespace != self.config.namespace {
      tracing::warn!(namespace = %command.namespace, "ignoring_command_for_foreign_namespace");
      return;
    }
    let target = match self.config.services.get(&command.service_name) {
      Some(target) => target.clone(),
      None => {
        tracing::warn!(service = %command.service_name, "ignoring_command_for_unknown_service");
        return;
      }
    };
    let span = tracing::info_span!(
      "dial_back",
      id = %command.correlation_id,
      service = %command.service_name
    );
    let connector = self.connector.clone();
    let cancel = shutdown.child_token();
    tokio::task::spawn(
      async move {
        match dial_back(&connector, &command, &target, &cancel).await {
          Ok(stats) => tracing::debug!(?stats, "dial_back_finished"),
          Err(error) => tracing::warn!(%error, "dial_back_failed"),
        }
      }
      .instrument(span),
    );
  }
}

/// Dials the local target first so a dead target never consumes the correlation ID
async fn dial_back(
  connector: &DataPlaneConnector,
  command: &RoutingCommand,
  target: &str,
  cancel: &CancellationToken,
) -> Result<Stats, DialBackError> {
  let local = TcpStream::connect(target)
    .await
    .map_err(|error| DialBackError::Target {
      service: command.service_name.clone(),
      addr: target.to_string(),
      error,
    })?;
  let tunnel = connector.connect(command.correlation_id).await?;
  Ok(Bridge::new(tunnel, local).run(cancel).await?)
}
