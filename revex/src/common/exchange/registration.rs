// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A namespace's live registration and the command channel to its registered party

use std::{
  collections::HashSet,
  sync::{Mutex, MutexGuard},
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::id::CorrelationId;

/// Instructs a registered party to dial back for `correlation_id`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RoutingCommand {
  pub namespace: String,
  pub service_name: String,
  pub correlation_id: CorrelationId,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
  #[error("Namespace is empty")]
  EmptyNamespace,
  #[error("Services list is empty")]
  EmptyServices,
  #[error("Service name is empty")]
  EmptyServiceName,
  #[error("Duplicate service name {0:?}")]
  DuplicateService(String),
  #[error("Service {service:?} is not offered by namespace {namespace:?}")]
  UnknownService { namespace: String, service: String },
  #[error("Registration is stopped")]
  Stopped,
  #[error("Registration is already started")]
  AlreadyStarted,
  #[error("Connection request cancelled by caller")]
  Cancelled,
  #[error("Command stream was already taken")]
  CommandStreamTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
  Idle,
  Running,
  Stopped,
}

/// A command, and the acknowledgement sent once the control session has taken it
type Envelope = (RoutingCommand, oneshot::Sender<()>);

/// Idle until [Registration::start]ed, Running until stopped or its governing
/// token is cancelled, then Stopped for good.
pub struct Registration {
  namespace: String,
  services: Vec<String>,
  commands: mpsc::Sender<Envelope>,
  command_stream: Mutex<Option<mpsc::Receiver<Envelope>>>,
  lifecycle: Mutex<Lifecycle>,
  halted: CancellationToken,
}

impl Registration {
  pub fn new<S: Into<String>>(
    namespace: impl Into<String>,
    services: impl IntoIterator<Item = S>,
  ) -> Result<Self, RegistrationError> {
    let namespace = namespace.into();
    if namespace.is_empty() {
      return Err(RegistrationError::EmptyNamespace);
    }
    let services: Vec<String> = services.into_iter().map(Into::into).collect();
    if services.is_empty() {
      return Err(RegistrationError::EmptyServices);
    }
    let mut seen = HashSet::with_capacity(services.len());
    for service in &services {
      if service.is_empty() {
        return Err(RegistrationError::EmptyServiceName);
      }
      if !seen.insert(service.as_str()) {
        return Err(RegistrationError::DuplicateService(service.clone()));
      }
    }

    // Capacity is irrelevant to callers: each send also waits for its acknowledgement
    let (commands, receiver) = mpsc::channel(1);
    Ok(Self {
      namespace,
      services,
      commands,
      command_stream: Mutex::new(Some(receiver)),
      lifecycle: Mutex::new(Lifecycle::Idle),
      halted: CancellationToken::new(),
    })
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn services(&self) -> &[String] {
    &self.services
  }

  pub fn offers(&self, service: &str) -> bool {
    self.services.iter().any(|s| s == service)
  }

  pub fn is_running(&self) -> bool {
    *self.lifecycle() == Lifecycle::Running && !self.halted.is_cancelled()
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    self
      .lifecycle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Begins accepting commands until [Registration::stop] or until `governing` is cancelled
  ///
  /// Must be called within a tokio runtime.
  pub fn start(&self, governing: &CancellationToken) -> Result<(), RegistrationError> {
    {
      let mut lifecycle = self.lifecycle();
      match *lifecycle {
        Lifecycle::Idle => *lifecycle = Lifecycle::Running,
        Lifecycle::Running => return Err(RegistrationError::AlreadyStarted),
        Lifecycle::Stopped => return Err(RegistrationError::Stopped),
      }
    }
    let governing = governing.clone();
    let halted = self.halted.clone();
    tokio::task::spawn(async move {
      tokio::select! {
        _ = governing.cancelled() => halted.cancel(),
        _ = halted.cancelled() => {}
      }
    });
    tracing::debug!(namespace = %self.namespace, services = ?self.services, "registration_started");
    Ok(())
  }

  /// Stops accepting commands, failing in-flight requests and ending the command stream
  pub fn stop(&self) {
    let mut lifecycle = self.lifecycle();
    if *lifecycle != Lifecycle::Stopped {
      *lifecycle = Lifecycle::Stopped;
      tracing::debug!(namespace = %self.namespace, "registration_stopped");
    }
    self.halted.cancel();
  }

  /// Hands out the receiving end of the command channel; only one reader may exist
  pub fn command_stream(&self) -> Result<CommandStream, RegistrationError> {
    let receiver = self
      .command_stream
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take()
      .ok_or(RegistrationError::CommandStreamTaken)?;
    Ok(CommandStream {
      receiver,
      halted: self.halted.clone(),
    })
  }

  /// Pushes a [RoutingCommand] to the registered party
  ///
  /// Resolves once the command stream's reader has taken the command. This is
  /// the backpressure point for a namespace: while nobody drains the stream,
  /// callers wait here until they or the registration are cancelled.
  #[tracing::instrument(level = "debug", skip(self, cancel), fields(namespace = %self.namespace), err)]
  pub async fn request_connection(
    &self,
    cancel: &CancellationToken,
    correlation_id: CorrelationId,
    service_name: &str,
  ) -> Result<(), RegistrationError> {
    if !self.is_running() {
      return Err(RegistrationError::Stopped);
    }
    if !self.offers(service_name) {
      return Err(RegistrationError::UnknownService {
        namespace: self.namespace.clone(),
        service: service_name.to_string(),
      });
    }
    let command = RoutingCommand {
      namespace: self.namespace.clone(),
      service_name: service_name.to_string(),
      correlation_id,
    };
    let (ack, acknowledged) = oneshot::channel();
    let delivery = async {
      self
        .commands
        .send((command, ack))
        .await
        .map_err(|_| RegistrationError::Stopped)?;
      acknowledged.await.map_err(|_| RegistrationError::Stopped)
    };
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(RegistrationError::Cancelled),
      _ = self.halted.cancelled() => Err(RegistrationError::Stopped),
      res = delivery => res,
    }
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    // Releases the governing watcher spawned by `start`
    self.halted.cancel();
  }
}

impl std::fmt::Debug for Registration {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Registration")
      .field("namespace", &self.namespace)
      .field("services", &self.services)
      .field("lifecycle", &*self.lifecycle())
      .finish_non_exhaustive()
  }
}

/// Reader side of a [Registration]'s commands; ends once the registration stops
pub struct CommandStream {
  receiver: mpsc::Receiver<Envelope>,
  halted: CancellationToken,
}

impl CommandStream {
  pub async fn next(&mut self) -> Option<RoutingCommand> {
    loop {
      let envelope = tokio::select! {
        biased;
        _ = self.halted.cancelled() => {
          self.receiver.close();
          return None;
        }
        envelope = self.receiver.recv() => envelope?,
      };
      let (command, ack) = envelope;
      // Skip commands whose requester gave up while the command was queued
      if ack.send(()).is_ok() {
        return Some(command);
      }
      tracing::debug!(id = %command.correlation_id, "skipping_abandoned_command");
    }
  }

  pub fn into_stream(self) -> impl futures::Stream<Item = RoutingCommand> {
    futures::stream::unfold(self, |mut commands| async move {
      commands.next().await.map(|command| (command, commands))
    })
  }
}

impl std::fmt::Debug for CommandStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CommandStream")
      .field("halted", &self.halted.is_cancelled())
      .finish_non_exhaustive()
  }
}
