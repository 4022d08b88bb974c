//! Authenticated remote control service: challenge-response handshake from
//! a shared secret, then an AES-256-CBC encrypted command channel, plus a
//! UDP discovery responder.
//!
//! The protocol machinery ([`wire`], [`crypto`], [`session`], [`handlers`],
//! [`discovery`]) is transport-free and host-testable; the service device
//! that binds it to sockets and flash lives in [`service`].

pub mod builtin;
pub mod crypto;
pub mod discovery;
pub mod handlers;
pub mod session;
pub mod wire;

#[cfg(not(feature = "host"))]
mod service;

#[cfg(not(feature = "host"))]
pub use service::{RemoteConfig, RemoteControl, RemoteControlStatic};

#[cfg(not(feature = "host"))]
pub(crate) use service::ServiceShared;
