//! Typed failures surfaced by the pool core.

use crate::store::VmId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    /// Every slot in the pool is currently leased.
    #[error("no available VMs")]
    PoolExhausted,

    /// An operation referenced a VM that is not currently leased.
    #[error("VM {0} not available")]
    LeaseNotFound(VmId),

    /// The backing store could not be read or written.
    #[error("pool store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing store holds data we cannot deserialize.
    #[error("pool store corrupted: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// A call into the external sandbox runtime failed.
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
