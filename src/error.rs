//! Error types shared across the transport, store and config layers.

use thiserror::Error;

/// Failures raised while exchanging a request with a chassis manager.
#[derive(Debug, Error)]
pub enum TransportError {
    /// ipmitool could not be started
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// ipmitool exited non-zero without reporting a completion code
    #[error("ipmitool exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// Output could not be read back as hex response bytes
    #[error("unparseable ipmitool output: {0}")]
    Parse(String),

    #[error("no response within {0} ms")]
    Timeout(u64),

    /// The exchange task ended without reporting an outcome
    #[error("completion dropped before a response arrived")]
    Dropped,

    #[error("no link configured for unit {0}")]
    UnknownUnit(usize),

    /// Outstanding past its deadline and given up by the scheduler
    #[error("exchange abandoned after deadline")]
    Abandoned,
}

/// Failures pushing an event into a state store sink.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store sink is closed")]
    Closed,
}

/// Validation problems in a loaded configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no chassis managers configured")]
    NoChassis,

    #[error("chassis loc_id must be at least 1")]
    ZeroLocId,

    #[error("chassis loc_id {0} configured more than once")]
    DuplicateLocId(u8),

    #[error("unknown operation '{0}' in scheduler.timeouts_ms")]
    UnknownOperation(String),

    #[error("timeout for '{0}' must be greater than zero")]
    ZeroTimeout(String),

    #[error("scheduler.write_attempts must be at least 1")]
    ZeroWriteAttempts,

    #[error("store sink '{sink}' requires '{field}'")]
    MissingStoreField { sink: &'static str, field: &'static str },
}
