// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Key binding a routing command to the data-plane connection that satisfies it
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
  pub fn new(inner: u64) -> CorrelationId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }

  pub fn to_be_bytes(self) -> [u8; 8] {
    self.0.to_be_bytes()
  }

  pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
    Self(u64::from_be_bytes(bytes))
  }
}

impl From<u64> for CorrelationId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<CorrelationId> for u64 {
  fn from(id: CorrelationId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for CorrelationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("CorrelationId").field(&self.0).finish()
  }
}

impl std::fmt::Display for CorrelationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0, f)
  }
}

/// Hands out strictly increasing IDs, starting at 1 so that 0 never names a request
#[derive(Debug)]
pub struct MonotonicIdGenerator {
  last: AtomicU64,
}

impl MonotonicIdGenerator {
  pub fn new() -> Self {
    Self {
      last: AtomicU64::new(0),
    }
  }

  pub fn next(&self) -> CorrelationId {
    CorrelationId::new(self.last.fetch_add(1, Ordering::Relaxed) + 1)
  }
}

impl Default for MonotonicIdGenerator {
  fn default() -> Self {
    Self::new()
  }
}
