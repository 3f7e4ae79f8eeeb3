// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Binds a freshly dialed data-plane socket to a [CorrelationId]
//!
//! Two flavors exist, and both sides of a connection must agree on one:
//!
//! - [HandshakeFlavor::Forward]: the client writes `[version][auth]` then the
//!   8-byte big-endian ID. The server never answers; a mismatch closes the socket.
//! - [HandshakeFlavor::Reverse]: the client writes `[version][auth]`, the server
//!   answers `[version][auth]` on acceptance or `[version][0xFF]` on an
//!   unsupported auth method, then the client writes `[version][id; 8]`.

use std::{fmt, str::FromStr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::exchange::id::CorrelationId;

pub const PROTOCOL_VERSION: u8 = 1;
pub const AUTH_METHOD_NONE: u8 = 0;
pub const AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

const PREAMBLE_LENGTH: usize = 2;
const ID_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeFlavor {
  Forward,
  #[default]
  Reverse,
}

impl FromStr for HandshakeFlavor {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "forward" => Ok(Self::Forward),
      "reverse" => Ok(Self::Reverse),
      other => Err(format!(
        "Unknown handshake flavor {:?}; expected \"forward\" or \"reverse\"",
        other
      )),
    }
  }
}

impl fmt::Display for HandshakeFlavor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Forward => "forward",
      Self::Reverse => "reverse",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
  ReadPreamble,
  WritePreamble,
  ReadReply,
  WriteReply,
  ReadId,
  WriteId,
}

impl fmt::Display for HandshakeStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::ReadPreamble => "reading version and auth method",
      Self::WritePreamble => "writing version and auth method",
      Self::ReadReply => "reading handshake reply",
      Self::WriteReply => "writing handshake reply",
      Self::ReadId => "reading correlation id",
      Self::WriteId => "writing correlation id",
    })
  }
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("Handshake failed while {stage}")]
  Io {
    stage: HandshakeStage,
    #[source]
    error: std::io::Error,
  },
  #[error("Unsupported protocol version {0}")]
  UnsupportedVersion(u8),
  #[error("Unsupported authentication method {0}")]
  UnsupportedAuthMethod(u8),
  #[error("Remote found no acceptable authentication method")]
  NotAcceptable,
}

trait StageExt<T> {
  fn at(self, stage: HandshakeStage) -> Result<T, HandshakeError>;
}

impl<T> StageExt<T> for std::io::Result<T> {
  fn at(self, stage: HandshakeStage) -> Result<T, HandshakeError> {
    self.map_err(|error| HandshakeError::Io { stage, error })
  }
}

fn check_version(version: u8) -> Result<(), HandshakeError> {
  if version != PROTOCOL_VERSION {
    return Err(HandshakeError::UnsupportedVersion(version));
  }
  Ok(())
}

/// Server side: validates the preamble and reads the ID the peer wants to bind to
///
/// On error the caller must drop the stream; for the reverse flavor an
/// unsupported auth method has already been answered with a rejection.
pub async fn accept<S>(stream: &mut S, flavor: HandshakeFlavor) -> Result<CorrelationId, HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut preamble = [0u8; PREAMBLE_LENGTH];
  stream
    .read_exact(&mut preamble)
    .await
    .at(HandshakeStage::ReadPreamble)?;
  let [version, auth_method] = preamble;
  check_version(version)?;

  match flavor {
    HandshakeFlavor::Forward => {
      if auth_method != AUTH_METHOD_NONE {
        return Err(HandshakeError::UnsupportedAuthMethod(auth_method));
      }
      let mut id = [0u8; ID_LENGTH];
      stream.read_exact(&mut id).await.at(HandshakeStage::ReadId)?;
      Ok(CorrelationId::from_be_bytes(id))
    }
    HandshakeFlavor::Reverse => {
      if auth_method != AUTH_METHOD_NONE {
        stream
          .write_all(&[PROTOCOL_VERSION, AUTH_METHOD_NOT_ACCEPTABLE])
          .await
          .at(HandshakeStage::WriteReply)?;
        stream.flush().await.at(HandshakeStage::WriteReply)?;
        return Err(HandshakeError::UnsupportedAuthMethod(auth_method));
      }
      stream
        .write_all(&[PROTOCOL_VERSION, AUTH_METHOD_NONE])
        .await
        .at(HandshakeStage::WriteReply)?;
      stream.flush().await.at(HandshakeStage::WriteReply)?;

      let mut frame = [0u8; 1 + ID_LENGTH];
      stream
        .read_exact(&mut frame)
        .await
        .at(HandshakeStage::ReadId)?;
      check_version(frame[0])?;
      let mut id = [0u8; ID_LENGTH];
      id.copy_from_slice(&frame[1..]);
      Ok(CorrelationId::from_be_bytes(id))
    }
  }
}

/// Client side: announces itself and binds the stream to `id`
pub async fn initiate<S>(
  stream: &mut S,
  flavor: HandshakeFlavor,
  id: CorrelationId,
) -> Result<(), HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match flavor {
    HandshakeFlavor::Forward => {
      let mut frame = [0u8; PREAMBLE_LENGTH + ID_LENGTH];
      frame[0] = PROTOCOL_VERSION;
      frame[1] = AUTH_METHOD_NONE;
      frame[PREAMBLE_LENGTH..].copy_from_slice(&id.to_be_bytes());
      stream.write_all(&frame).await.at(HandshakeStage::WriteId)?;
      stream.flush().await.at(HandshakeStage::WriteId)?;
    }
    HandshakeFlavor::Reverse => {
      stream
        .write_all(&[PROTOCOL_VERSION, AUTH_METHOD_NONE])
        .await
        .at(HandshakeStage::WritePreamble)?;
      stream.flush().await.at(HandshakeStage::WritePreamble)?;

      let mut reply = [0u8; PREAMBLE_LENGTH];
      stream
        .read_exact(&mut reply)
        .await
        .at(HandshakeStage::ReadReply)?;
      let [version, auth_method] = reply;
      check_version(version)?;
      match auth_method {
        AUTH_METHOD_NONE => {}
        AUTH_METHOD_NOT_ACCEPTABLE => return Err(HandshakeError::NotAcceptable),
        other => return Err(HandshakeError::UnsupportedAuthMethod(other)),
      }

      let mut frame = [0u8; 1 + ID_LENGTH];
      frame[0] = PROTOCOL_VERSION;
      frame[1..].copy_from_slice(&id.to_be_bytes());
      stream.write_all(&frame).await.at(HandshakeStage::WriteId)?;
      stream.flush().await.at(HandshakeStage::WriteId)?;
    }
  }
  Ok(())
}
