//! Unified error handling.
//!
//! Each domain defines its own error enum (`StoreError`, `CryptoError`,
//! `MessagingError`, `DeployError`, `DoctorError`, `LbError`); this module
//! wraps them into a single [`Error`] for code that crosses domains.
//! Daemons treat every error as recoverable and retry on the next tick;
//! only startup misconfiguration is fatal.

use thiserror::Error;

pub use crate::agent::units::DeployError;
pub use crate::crypto::CryptoError;
pub use crate::loadbalancer::LbError;
pub use crate::messaging::MessagingError;
pub use crate::scheduler::doctor::DoctorError;
pub use crate::store::StoreError;

/// Unified result type for flotilla operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for cross-domain operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("deploy error: {0}")]
    Deploy(#[from] DeployError),

    #[error("doctor error: {0}")]
    Doctor(#[from] DoctorError),

    #[error("load balancer error: {0}")]
    LoadBalancer(#[from] LbError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
