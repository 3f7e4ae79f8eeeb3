// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod address;
pub mod control;
pub mod handshake;

pub use address::{AddressError, ServiceAddress};
pub use control::{ControlMessage, RegisterRequest};
pub use handshake::{HandshakeError, HandshakeFlavor};
