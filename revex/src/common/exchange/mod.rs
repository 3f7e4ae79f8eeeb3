// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Routing of dial requests to registered parties, and the rendezvous of their dialed-back connections

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::common::protocol::address::ServiceAddress;

pub mod id;
pub mod pending;
pub mod registration;
pub mod registry;

pub use id::CorrelationId;
pub use pending::{ConnectionOutcome, PendingRequestError, PendingRequests};
pub use registration::{CommandStream, Registration, RegistrationError, RoutingCommand};
pub use registry::{InMemoryRegistry, RegistrationStore, RegistryError};

use pending::AbandonOnDrop;

#[derive(thiserror::Error, Debug)]
pub enum ExchangeError {
  #[error("Proxy not found: {0}")]
  ProxyNotFound(#[from] RegistryError),
  #[error("Registration failed: {0}")]
  Registration(#[from] RegistrationError),
  #[error("Connection request cancelled by caller")]
  Cancelled,
  #[error("Failed to get connection for request {0}")]
  ConnectionFailed(CorrelationId),
  #[error("Connection for request {id} failed")]
  Connection {
    id: CorrelationId,
    #[source]
    error: std::io::Error,
  },
}

/// Matches dial requests with the connections registered parties dial back with
///
/// The registry and pending-request table are injected so that one instance
/// of each is shared by the listeners of a process.
pub struct Exchange<TStream, TRegistry: ?Sized = InMemoryRegistry> {
  registry: Arc<TRegistry>,
  pending: Arc<PendingRequests<TStream>>,
}

impl<TStream, TRegistry: ?Sized> Clone for Exchange<TStream, TRegistry> {
  fn clone(&self) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
      pending: Arc::clone(&self.pending),
    }
  }
}

impl<TStream, TRegistry> Exchange<TStream, TRegistry>
where
  TStream: Send + 'static,
  TRegistry: RegistrationStore + ?Sized,
{
  pub fn new(registry: Arc<TRegistry>, pending: Arc<PendingRequests<TStream>>) -> Self {
    Self { registry, pending }
  }

  pub fn registry(&self) -> &Arc<TRegistry> {
    &self.registry
  }

  pub fn pending(&self) -> &Arc<PendingRequests<TStream>> {
    &self.pending
  }

  /// Asks the party registered for `address.namespace` to dial back, then waits for that connection
  ///
  /// The pending request is removed on every exit path, including this
  /// future being dropped, so a failed or cancelled dial leaves nothing behind.
  #[tracing::instrument(level = "debug", skip(self, cancel), fields(%address), err)]
  pub async fn new_connection(
    &self,
    cancel: &CancellationToken,
    address: &ServiceAddress,
  ) -> Result<TStream, ExchangeError> {
    let (delivery, outcome) = oneshot::channel();
    let id = self.pending.add_request(delivery);
    let _abandon = AbandonOnDrop::new(&self.pending, id);

    let registration = self.registry.find(&address.namespace)?;
    registration
      .request_connection(cancel, id, &address.service)
      .await
      .map_err(|error| match error {
        RegistrationError::Cancelled => ExchangeError::Cancelled,
        other => ExchangeError::Registration(other),
      })?;
    tracing::debug!(%id, "awaiting_dial_back");

    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
      outcome = outcome => match outcome {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(ExchangeError::Connection { id, error }),
        Err(_closed) => Err(ExchangeError::ConnectionFailed(id)),
      },
    }
  }

  /// Builds and registers a [Registration]; the caller owns its start/stop lifecycle
  ///
  /// A registration displaced from the same namespace is stopped. Until the
  /// caller starts it, dials routed to this registration fail with
  /// [RegistrationError::Stopped]; [Exchange::start_rev_proxy] has no such window.
  pub fn register_rev_proxy<S: Into<String>>(
    &self,
    namespace: impl Into<String>,
    services: impl IntoIterator<Item = S>,
  ) -> Result<Arc<Registration>, ExchangeError> {
    let registration = Arc::new(Registration::new(namespace, services)?);
    self.publish(&registration);
    Ok(registration)
  }

  /// Builds a [Registration], starts it under `governing`, and only then registers it
  pub fn start_rev_proxy<S: Into<String>>(
    &self,
    namespace: impl Into<String>,
    services: impl IntoIterator<Item = S>,
    governing: &CancellationToken,
  ) -> Result<Arc<Registration>, ExchangeError> {
    let registration = Arc::new(Registration::new(namespace, services)?);
    registration.start(governing)?;
    self.publish(&registration);
    Ok(registration)
  }

  fn publish(&self, registration: &Arc<Registration>) {
    if let Some(displaced) = self.registry.upsert(Arc::clone(registration)) {
      tracing::info!(
        namespace = registration.namespace(),
        "displacing_previous_registration"
      );
      displaced.stop();
    }
  }

  pub fn unregister_rev_proxy(&self, registration: &Arc<Registration>) -> bool {
    self.registry.remove(registration)
  }

  /// Hands a dialed-back connection to the request waiting on `id`
  pub fn add_connection(&self, id: CorrelationId, connection: TStream) -> Result<(), PendingRequestError> {
    self.pending.resolve(id, Ok(connection))
  }
}

impl<TStream, TRegistry: ?Sized> std::fmt::Debug for Exchange<TStream, TRegistry> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Exchange")
      .field("pending", &self.pending)
      .finish_non_exhaustive()
  }
}
