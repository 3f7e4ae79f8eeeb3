// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outstanding dial requests, keyed by the [CorrelationId] the registered party will dial back with

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::id::{CorrelationId, MonotonicIdGenerator};

/// Either the rendezvoused connection, or the reason none will arrive
pub type ConnectionOutcome<TStream> = std::io::Result<TStream>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequestError {
  #[error("Connection request {0} not found")]
  NotFound(CorrelationId),
  #[error("Connection request {0} was abandoned by its caller before delivery")]
  Abandoned(CorrelationId),
}

/// The "connection queue": one one-shot delivery slot per outstanding request
///
/// Each entry is resolved at most once; resolution removes it, so a repeated
/// or unknown ID is reported as [PendingRequestError::NotFound].
pub struct PendingRequests<TStream> {
  ids: MonotonicIdGenerator,
  waiting: DashMap<CorrelationId, oneshot::Sender<ConnectionOutcome<TStream>>>,
}

impl<TStream> PendingRequests<TStream> {
  pub fn new() -> Self {
    Self {
      ids: MonotonicIdGenerator::new(),
      waiting: DashMap::new(),
    }
  }

  /// Stores `delivery` under a fresh ID; never blocks
  pub fn add_request(&self, delivery: oneshot::Sender<ConnectionOutcome<TStream>>) -> CorrelationId {
    let id = self.ids.next();
    self.waiting.insert(id, delivery);
    tracing::trace!(%id, "pending_request_added");
    id
  }

  /// Removes the request and hands it `outcome`
  ///
  /// The map shard lock is released before delivery, and delivery itself
  /// never blocks. If the waiter has already gone away, the outcome is
  /// dropped (closing any connection inside it) and `Abandoned` is returned.
  pub fn resolve(
    &self,
    id: CorrelationId,
    outcome: ConnectionOutcome<TStream>,
  ) -> Result<(), PendingRequestError> {
    let (_, delivery) = self
      .waiting
      .remove(&id)
      .ok_or(PendingRequestError::NotFound(id))?;
    delivery
      .send(outcome)
      .map_err(|_undelivered| PendingRequestError::Abandoned(id))?;
    tracing::trace!(%id, "pending_request_resolved");
    Ok(())
  }

  /// Best-effort removal of a request nobody is waiting on any more
  ///
  /// Returns false if the request was already resolved or removed.
  pub fn abandon(&self, id: CorrelationId) -> bool {
    let removed = self.waiting.remove(&id).is_some();
    if removed {
      tracing::trace!(%id, "pending_request_abandoned");
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.waiting.len()
  }

  pub fn is_empty(&self) -> bool {
    self.waiting.is_empty()
  }
}

impl<TStream> Default for PendingRequests<TStream> {
  fn default() -> Self {
    Self::new()
  }
}

impl<TStream> std::fmt::Debug for PendingRequests<TStream> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingRequests")
      .field("outstanding", &self.waiting.len())
      .finish_non_exhaustive()
  }
}

/// Abandons its request when dropped, covering every early return and cancellation
pub(crate) struct AbandonOnDrop<'a, TStream> {
  table: &'a PendingRequests<TStream>,
  id: CorrelationId,
}

impl<'a, TStream> AbandonOnDrop<'a, TStream> {
  pub(crate) fn new(table: &'a PendingRequests<TStream>, id: CorrelationId) -> Self {
    Self { table, id }
  }
}

impl<TStream> Drop for AbandonOnDrop<'_, TStream> {
  fn drop(&mut self) {
    self.table.abandon(self.id);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::sync::oneshot;

  use super::{AbandonOnDrop, PendingRequestError, PendingRequests};
  use crate::common::exchange::id::CorrelationId;

  #[test]
  fn ids_are_strictly_increasing_and_unique() {
    let table = Arc::new(PendingRequests::<u32>::new());
    let per_thread: Vec<Vec<CorrelationId>> = std::thread::scope(|scope| {
      let workers: Vec<_> = (0..4)
        .map(|_| {
          let table = Arc::clone(&table);
          scope.spawn(move || {
            (0..250)
              .map(|_| table.add_request(oneshot::channel().0))
              .collect::<Vec<_>>()
          })
        })
        .collect();
      workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    for ids in &per_thread {
      assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
    let mut all: Vec<_> = per_thread.into_iter().flatten().collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 1000);
    assert_eq!(table.len(), 1000);
    assert!(all[0].inner() >= 1);
  }

  #[test]
  fn resolving_an_unknown_id_is_reported() {
    let table = PendingRequests::<u32>::new();
    assert_eq!(
      table.resolve(CorrelationId::new(42), Ok(1)),
      Err(PendingRequestError::NotFound(CorrelationId::new(42)))
    );
    assert!(table.is_empty());
  }

  #[tokio::test]
  async fn resolve_delivers_exactly_once() {
    let table = PendingRequests::<&'static str>::new();
    let (tx, rx) = oneshot::channel();
    let id = table.add_request(tx);

    table.resolve(id, Ok("connection")).unwrap();
    assert!(table.is_empty());
    assert_eq!(
      table.resolve(id, Ok("second")),
      Err(PendingRequestError::NotFound(id))
    );
    assert_eq!(rx.await.unwrap().unwrap(), "connection");
  }

  #[test]
  fn resolving_for_a_departed_waiter_is_reported() {
    let table = PendingRequests::<u32>::new();
    let (tx, rx) = oneshot::channel();
    let id = table.add_request(tx);
    drop(rx);
    assert_eq!(
      table.resolve(id, Ok(7)),
      Err(PendingRequestError::Abandoned(id))
    );
    assert!(table.is_empty());
  }

  #[test]
  fn abandonment_guard_removes_unresolved_requests() {
    let table = PendingRequests::<u32>::new();
    let id = table.add_request(oneshot::channel().0);
    {
      let _guard = AbandonOnDrop::new(&table, id);
      assert_eq!(table.len(), 1);
    }
    assert!(table.is_empty());
    assert!(!table.abandon(id));
    assert_eq!(
      table.resolve(id, Ok(1)),
      Err(PendingRequestError::NotFound(id))
    );
  }
}
