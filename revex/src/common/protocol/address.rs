// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{fmt, str::FromStr};

const LABEL_SEPARATOR: char = '.';

/// A dial target of the form `service.namespace`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
  pub service: String,
  pub namespace: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
  #[error("Invalid address {0:?}; expected service.namespace")]
  Invalid(String),
}

impl ServiceAddress {
  pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
    Self {
      service: service.into(),
      namespace: namespace.into(),
    }
  }
}

impl FromStr for ServiceAddress {
  type Err = AddressError;

  /// Accepts `service.namespace`, optionally followed by a `:port` which is discarded
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || AddressError::Invalid(s.to_string());
    let host = match s.rsplit_once(':') {
      Some((host, port)) => {
        port.parse::<u16>().map_err(|_| invalid())?;
        host
      }
      None => s,
    };
    let mut labels = host.split(LABEL_SEPARATOR);
    match (labels.next(), labels.next(), labels.next()) {
      (Some(service), Some(namespace), None) if !service.is_empty() && !namespace.is_empty() => {
        Ok(Self::new(service, namespace))
      }
      _ => Err(invalid()),
    }
  }
}

impl fmt::Display for ServiceAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}{}", self.service, LABEL_SEPARATOR, self.namespace)
  }
}

#[cfg(test)]
mod tests {
  use super::{AddressError, ServiceAddress};

  #[test]
  fn parses_with_and_without_port() {
    let addr: ServiceAddress = "service.namespace:0".parse().unwrap();
    assert_eq!(addr, ServiceAddress::new("service", "namespace"));
    assert_eq!(addr.to_string(), "service.namespace");
    assert_eq!(
      "svc1.example".parse::<ServiceAddress>().unwrap(),
      ServiceAddress::new("svc1", "example")
    );
  }

  #[test]
  fn rejects_malformed_addresses() {
    for input in [
      "invalidaddress",
      "invalidaddress:2",
      "a.b.c:80",
      ".namespace",
      "service.",
      "service.namespace:port",
      "",
    ] {
      assert_eq!(
        input.parse::<ServiceAddress>(),
        Err(AddressError::Invalid(input.to_string())),
        "input {:?}",
        input
      );
    }
  }
}
