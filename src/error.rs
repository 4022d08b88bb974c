use derive_more::derive::{Display, Error, From};

/// A specialized `Result` where the error is this crate's `Error` type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Define a unified error type for this crate.
///
/// Remote-protocol replies report errors as small signed integers; [`Error::code`]
/// provides that mapping (success is `0` and is not represented here).
#[derive(Debug, Display, Error, From)]
pub enum Error {
    // `#[error(not(source))]` below tells `derive_more` that `embassy_executor::SpawnError` does
    // not implement Rust's `core::error::Error` trait.  `SpawnError` should, but Rust's `Error`
    // only recently moved from `std` (which is not available in bare-metal development) to `core`
    // (which is). Perhaps a future update of `embassy_executor::SpawnError` will implement
    // `core::error::Error` which will make this unnecessary.
    #[cfg(not(feature = "host"))]
    #[display("{_0:?}")]
    TaskSpawn(#[error(not(source))] embassy_executor::SpawnError),

    #[cfg(not(feature = "host"))]
    #[display("{_0:?}")]
    Flash(#[error(not(source))] embassy_rp::flash::Error),

    #[display("Invalid argument")]
    InvalidArg,

    #[display("Invalid data")]
    InvalidData,

    #[display("Invalid state")]
    InvalidState,

    #[display("Insufficient resources")]
    InsufficientResources,

    #[display("Resource in use")]
    ResourceInUse,

    #[display("Bad alignment")]
    BadAlignment,

    #[display("Invalid address")]
    InvalidAddress,

    #[display("Data modified during operation")]
    ModifiedData,

    #[display("Unsupported modification")]
    UnsupportedModification,

    #[display("Operation not permitted")]
    NotPermitted,

    #[display("Generic failure")]
    Generic,
}

impl Error {
    /// Signed integer code reported to remote clients (success is `0`).
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            #[cfg(not(feature = "host"))]
            Self::TaskSpawn(_) => -11,
            #[cfg(not(feature = "host"))]
            Self::Flash(_) => -2,
            Self::InvalidArg => -1,
            Self::InvalidData => -2,
            Self::InvalidState => -3,
            Self::InsufficientResources => -4,
            Self::ResourceInUse => -5,
            Self::BadAlignment => -6,
            Self::InvalidAddress => -7,
            Self::ModifiedData => -8,
            Self::UnsupportedModification => -9,
            Self::NotPermitted => -10,
            Self::Generic => -11,
        }
    }
}
