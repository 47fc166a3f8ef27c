//! Unified error types for shoal

use thiserror::Error;

/// Unified error type for all shoal operations
#[derive(Error, Debug)]
pub enum ShoalError {
    // Resolution errors
    #[error("No such host in list: {0}")]
    HostNotFound(String),

    #[error("Host name is ambiguous: {reference} matches {}", .candidates.join(", "))]
    AmbiguousHost {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("{0} already in host list")]
    DuplicateHost(String),

    // Connection errors
    #[error("Invalid host spec: {0}")]
    InvalidHostSpec(String),

    #[error("Connecting to host {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Host key for {0} rejected")]
    HostKeyRejected(String),

    #[error("Authentication failed for {0}")]
    Authentication(String),

    // Job errors
    #[error("No pending job on {0}")]
    NoPendingJob(String),

    #[error("No jobs recorded for {0}")]
    NoJobs(String),

    #[error("Channel error: {0}")]
    Channel(String),

    // Terminal errors
    #[error("Terminal error: {0}")]
    Terminal(String),

    // Console usage
    #[error("Usage: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ShoalError {
    /// Bad arguments, as opposed to an operation that was attempted and failed.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// The host reference did not name exactly one registered host.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::HostNotFound(_) | Self::AmbiguousHost { .. })
    }

    /// Shorthand for a connection failure on `host`.
    pub fn connection(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias using ShoalError
pub type Result<T> = std::result::Result<T, ShoalError>;
