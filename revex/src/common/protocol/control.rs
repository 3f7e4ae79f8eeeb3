// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Messages of the control plane, carried as framed JSON

use serde::{Deserialize, Serialize};

use crate::common::exchange::RoutingCommand;

/// Sent once by a registering party, as the first frame of its control connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
  pub namespace: String,
  pub services: Vec<String>,
}

/// Frames sent by the exchange on a control connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
  Registered { namespace: String },
  /// Last frame before the exchange closes the connection
  Rejected { reason: String },
  Connect(RoutingCommand),
}
