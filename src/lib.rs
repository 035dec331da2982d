// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebChat Gateway
//!
//! A WebSocket gateway that lets browser chat clients talk to a bot host.
//! Clients authenticate with a shared token, their messages are normalized
//! into host events, and the host answers through [`HostApi`].

pub mod authenticator;
pub mod config;
pub mod connection_registry;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod host;
pub mod http;
pub mod metrics;
pub mod normalizer;
pub mod protocol;
pub mod router;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayState};
pub use host::{Host, HostApi, HostIdentity, RoutingContext};
pub use normalizer::MessageEvent;
pub use protocol::{Message, Segment};
