//! Error handling - hierarchical errors for the execution core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Execution core error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem / mmap errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Shared memory segment errors (size, layout)
    #[error("Shared memory error: {0}")]
    Shm(String),

    /// Violated precondition; never downgraded to a soft failure
    #[error("Contract violation: {0}")]
    Contract(String),

    /// Venue status the connector cannot interpret
    #[error("Unsupported order status: {0}")]
    UnsupportedStatus(String),

    /// Venue connector errors
    #[error("Bartering link error: {0}")]
    Bartering(String),

    /// Thread to loop bridge errors
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Persistence collaborator errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl Error {
    /// Tier-1 errors propagate to the caller instead of being logged away.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::Contract(_) | Error::UnsupportedStatus(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_tier() {
        assert!(Error::Contract("x".into()).is_contract_violation());
        assert!(Error::UnsupportedStatus("OE_WHAT".into()).is_contract_violation());
        assert!(!Error::Bridge("closed".into()).is_contract_violation());
        assert!(!Error::Bartering("send".into()).is_contract_violation());
    }
}
