// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Parses `host:port`, leaving name resolution to connect/bind time
pub fn parse_host_port(v: &str) -> Result<(String, u16)> {
  let (host, port) = v
    .rsplit_once(':')
    .ok_or_else(|| AnyErr::msg("Expected an address of the form host:port"))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(AnyErr::msg("Address host component was empty"));
  }
  let port = port
    .parse::<u16>()
    .map_err(|_| AnyErr::msg("Address port component was not a valid u16"))?;
  Ok((host.to_string(), port))
}

/// Parses a `name=host:port` service target as given to the revproxy agent
pub fn parse_service_target(v: &str) -> Result<(String, String)> {
  let (name, address) = v
    .split_once('=')
    .ok_or_else(|| AnyErr::msg("Expected a service target of the form name=host:port"))?;
  if name.is_empty() {
    return Err(AnyErr::msg("Service target name was empty"));
  }
  parse_host_port(address)?;
  Ok((name.to_string(), address.to_string()))
}

pub fn validate_host_port(v: &str) -> Result<(), String> {
  parse_host_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_service_target(v: &str) -> Result<(), String> {
  parse_service_target(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}
