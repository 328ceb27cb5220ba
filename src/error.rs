//! Typed errors for launching and supervising the database.
//!
//! Glue code uses `anyhow`; the supervisor and the command builder return these
//! so a frontend can report a bad setting or a failed spawn precisely.

use thiserror::Error;

/// Invalid serving settings, detected before anything is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServeError {
    /// The driver name is not one of the supported storage drivers.
    #[error("Invalid database driver: {0}")]
    InvalidDriver(String),

    /// The log level is not understood by the database.
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Port outside 1..=65535.
    #[error("Invalid port: {0}")]
    InvalidPort(u32),

    /// A persistent driver was selected without a storage location.
    #[error("the {driver} driver requires a storage location")]
    MissingStorage {
        /// Driver name as configured.
        driver: String,
    },
}

/// Failures reported by the supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The OS refused to spawn the process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
