// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames: a big-endian `u32` length followed by that many bytes

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for control-plane frames read from a peer
pub const MAX_CONTROL_FRAME_LENGTH: usize = 64 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
}

impl ReadError {
  /// True when the peer closed cleanly before sending any part of a new frame
  pub fn is_clean_close(&self) -> bool {
    matches!(
      self,
      ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      } if error.kind() == std::io::ErrorKind::UnexpectedEof
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Frame of {0} bytes does not fit a u32 length prefix")]
  Oversized(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Failure writing JSON into frame: {0}")]
  Write(#[from] WriteError),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(&mut buffer)
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

/// Writes and flushes a single frame
pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), WriteError> {
  let length = u32::try_from(buffer.len()).map_err(|_| WriteError::Oversized(buffer.len()))?;
  s.write_u32(length).await?;
  s.write_all(buffer).await?;
  s.flush().await?;
  Ok(())
}

pub async fn read_framed_json<TStream, TOutput>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError>
where
  TStream: AsyncRead + Unpin,
  TOutput: serde::de::DeserializeOwned,
{
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

pub async fn write_framed_json<TStream, TInput>(s: TStream, value: &TInput) -> Result<(), JsonWriteError>
where
  TStream: AsyncWrite + Unpin,
  TInput: serde::Serialize + ?Sized,
{
  let buffer = serde_json::to_vec(value)?;
  Ok(write_frame(s, &buffer).await?)
}
