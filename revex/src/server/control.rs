// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Control-plane sessions: one registration per connection, fed with routing commands

use std::sync::Arc;

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::serve_listener;
use crate::{
  common::{
    exchange::{Exchange, ExchangeError, InMemoryRegistry, Registration, RegistrationError, RegistrationStore},
    protocol::control::{ControlMessage, RegisterRequest},
  },
  util::framed::{read_framed_json, write_framed_json, JsonReadError, JsonWriteError, MAX_CONTROL_FRAME_LENGTH},
};

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
  #[error("Failed to read registration request: {0}")]
  Request(#[from] JsonReadError),
  #[error("Registration rejected: {0}")]
  Rejected(#[source] ExchangeError),
  #[error("Registration lifecycle failure: {0}")]
  Lifecycle(#[from] RegistrationError),
  #[error("Failed to write control message: {0}")]
  Write(#[from] JsonWriteError),
}

pub struct ControlServer<TStream, TRegistry: ?Sized = InMemoryRegistry> {
  exchange: Exchange<TStream, TRegistry>,
}

impl<TStream, TRegistry: ?Sized> Clone for ControlServer<TStream, TRegistry> {
  fn clone(&self) -> Self {
    Self {
      exchange: self.exchange.clone(),
    }
  }
}

impl<TStream, TRegistry> ControlServer<TStream, TRegistry>
where
  TStream: Send + 'static,
  TRegistry: RegistrationStore + ?Sized + 'static,
{
  pub fn new(exchange: Exchange<TStream, TRegistry>) -> Self {
    Self { exchange }
  }

  pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) {
    tracing::info!(addr = ?listener.local_addr().ok(), "control_plane_listening");
    serve_listener(listener, &shutdown, None, |stream| {
      let this = self.clone();
      let session = shutdown.child_token();
      async move {
        match this.serve_session(stream, session).await {
          Ok(()) => tracing::info!("control_session_ended"),
          Err(error) => tracing::warn!(%error, "control_session_failed"),
        }
      }
    })
    .await;
    tracing::info!("control_plane_stopped");
  }

  /// Runs one registered party's session until it disconnects, is displaced, or `session` is cancelled
  ///
  /// The registration is started under `session` before it becomes visible
  /// to dialers, and is stopped and unregistered on every exit. Cancelling
  /// `session` before the request arrives ends the session without registering.
  #[tracing::instrument(skip(self, stream, session), fields(session_id = %Uuid::new_v4()))]
  pub async fn serve_session<S>(&self, stream: S, session: CancellationToken) -> Result<(), ControlError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin,
  {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let request: RegisterRequest = tokio::select! {
      request = read_framed_json::<_, RegisterRequest>(&mut reader, Some(MAX_CONTROL_FRAME_LENGTH)) => request?,
      _ = session.cancelled() => {
        tracing::debug!("control_session_cancelled_before_registration");
        return Ok(());
      }
    };
    tracing::debug!(namespace = %request.namespace, services = ?request.services, "registration_requested");

    let registration = match self
      .exchange
      .start_rev_proxy(request.namespace, request.services, &session)
    {
      Ok(registration) => registration,
      Err(error) => {
        let rejection = ControlMessage::Rejected {
          reason: error.to_string(),
        };
        write_framed_json(&mut writer, &rejection).await?;
        if let Err(error) = writer.shutdown().await {
          tracing::debug!(?error, "rejection_shutdown_failed");
        }
        return Err(ControlError::Rejected(error));
      }
    };
    tracing::info!(namespace = registration.namespace(), "registered");

    let res = Self::relay_commands(&registration, &mut reader, &mut writer, &session).await;
    registration.stop();
    self.exchange.unregister_rev_proxy(&registration);
    tracing::info!(namespace = registration.namespace(), "unregistered");
    res
  }

  async fn relay_commands<R, W>(
    registration: &Arc<Registration>,
    reader: &mut R,
    writer: &mut W,
    session: &CancellationToken,
  ) -> Result<(), ControlError>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut commands = registration.command_stream()?;
    write_framed_json(
      &mut *writer,
      &ControlMessage::Registered {
        namespace: registration.namespace().to_string(),
      },
    )
    .await?;

    // Registered parties send nothing after their request; any read completion means they left
    let peer_gone = async {
      let mut scratch = [0u8; 1];
      let _ = reader.read(&mut scratch).await;
    };
    tokio::pin!(peer_gone);
    loop {
      tokio::select! {
        _ = session.cancelled() => return Ok(()),
        _ = &mut peer_gone => {
          tracing::debug!("control_peer_disconnected");
          return Ok(());
        }
        command = commands.next() => match command {
          Some(command) => {
            tracing::debug!(id = %command.correlation_id, service = %command.service_name, "routing_command");
            write_framed_json(&mut *writer, &ControlMessage::Connect(command)).await?;
          }
          // Stopped elsewhere, typically displaced by a newer registration
          None => return Ok(()),
        },
      }
    }
  }
}
