// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use super::registration::Registration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("No registration for namespace {0:?}")]
  NotFound(String),
}

/// A mapping of namespaces to their current [Registration]
///
/// At most one registration is held per namespace; registering over an
/// existing namespace replaces it, last writer wins.
#[cfg_attr(test, mockall::automock)]
pub trait RegistrationStore: Send + Sync {
  /// Stores `registration` under its namespace, returning the one it displaced
  fn upsert(&self, registration: Arc<Registration>) -> Option<Arc<Registration>>;

  fn find(&self, namespace: &str) -> Result<Arc<Registration>, RegistryError>;

  /// Removes `registration` if it is still the one held for its namespace
  ///
  /// Returns false when absent or already replaced by another registration.
  fn remove(&self, registration: &Arc<Registration>) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
  registrations: DashMap<String, Arc<Registration>>,
}

impl InMemoryRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.registrations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.registrations.is_empty()
  }
}

impl RegistrationStore for InMemoryRegistry {
  fn upsert(&self, registration: Arc<Registration>) -> Option<Arc<Registration>> {
    self
      .registrations
      .insert(registration.namespace().to_string(), registration)
  }

  fn find(&self, namespace: &str) -> Result<Arc<Registration>, RegistryError> {
    self
      .registrations
      .get(namespace)
      .map(|entry| Arc::clone(entry.value()))
      .ok_or_else(|| RegistryError::NotFound(namespace.to_string()))
  }

  fn remove(&self, registration: &Arc<Registration>) -> bool {
    match self.registrations.entry(registration.namespace().to_string()) {
      Entry::Occupied(held) if Arc::ptr_eq(held.get(), registration) => {
        held.remove();
        true
      }
      _ => false,
    }
  }
}
