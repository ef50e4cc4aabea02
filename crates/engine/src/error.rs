//! Re-exports the shared error type for convenience within this crate.

pub use leasemgr_common::error::{ManagerError, RepositoryError};

pub type EngineResult<T> = std::result::Result<T, ManagerError>;
