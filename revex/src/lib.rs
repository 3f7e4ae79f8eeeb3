// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A reverse-tunnel broker: parties behind NAT register namespaces of services
//! over a control plane, and dial requests for `service.namespace` are
//! satisfied by connections those parties dial back on a data plane.

pub mod common;
pub mod util;

pub mod client;
pub mod server;
