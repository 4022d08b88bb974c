//! Managed WiFi for Pico W boards: a periodic connection manager driven by
//! a persisted access-point list, a flash-backed settings store, and an
//! authenticated remote control service with UDP discovery.
#![cfg_attr(not(feature = "host"), no_std)]

// Compile-time checks: exactly one board must be selected (unless testing with host feature)
#[cfg(all(not(any(feature = "pico1", feature = "pico2")), not(feature = "host")))]
compile_error!("Must enable exactly one board feature: 'pico1' or 'pico2'");

#[cfg(all(feature = "pico1", feature = "pico2"))]
compile_error!("Cannot enable both 'pico1' and 'pico2' features simultaneously");

#[cfg(all(not(feature = "arm"), not(feature = "host")))]
compile_error!("Must enable the 'arm' architecture feature");

// Hardware bindings are excluded when testing on host
#[cfg(not(feature = "host"))]
pub mod board;

// The protocol, parser and state-machine core compiles everywhere; each
// module keeps its own device layer behind `cfg(not(feature = "host"))`.
pub mod connection;
mod error;
pub mod flash_layout;
pub mod remote;
pub mod settings;

// Re-export error types and result (used throughout)
pub use error::{Error, Result};
