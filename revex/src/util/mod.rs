// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod bridge;
pub mod framed;
pub mod tunnel_stream;
pub mod validators;

pub use bridge::{Bridge, BridgeError, CloseError, IoErrors, Stats};
