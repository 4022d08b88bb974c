//! The settings store: a flat `key=value` text blob in the last flash
//! sector, read by both the connection manager and the remote service and
//! rewritten by the remote update handlers.

pub mod blob;
pub mod store;

pub use blob::{Blob, MAX_SECRET_LEN, MAX_SSIDS};
pub use store::{FlashOps, SettingsStore};
