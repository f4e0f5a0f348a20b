//! Error types for ferrocannon

use thiserror::Error;

/// Result type for ferrocannon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for communication and distributed multiplication
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// MPI was already initialized in this process
    #[error("MPI already initialized")]
    AlreadyInitialized,

    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid buffer provided (e.g. mismatched send/receive lengths)
    #[error("Invalid buffer")]
    InvalidBuffer,

    /// Invalid count specified
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// User tags must be non-negative; negative tags are reserved for collectives
    #[error("Invalid tag: {0}")]
    InvalidTag(i32),

    /// A received message did not have the length the receive buffer expects
    #[error("Count mismatch: expected {expected} elements, received {received}")]
    CountMismatch {
        /// Elements the receive buffer can hold
        expected: usize,
        /// Elements actually carried by the message
        received: usize,
    },

    /// A received message carried a different element type than requested
    #[error("Datatype mismatch: expected {expected:?}, received {received:?}")]
    DatatypeMismatch {
        /// Type requested by the receiver
        expected: crate::DatatypeTag,
        /// Type sent by the peer
        received: crate::DatatypeTag,
    },

    /// Requested Cartesian shape does not fit the communicator
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// The peer a receive was waiting on has already exited
    #[error("Peer rank {0} exited before the message was delivered")]
    PeerExited(i32),

    /// The job was collectively aborted
    #[error("Aborted by rank {origin} with code {code}")]
    Aborted {
        /// World rank that called abort
        origin: i32,
        /// Error code passed to abort
        code: i32,
    },

    /// Configuration precondition failed before any tile was allocated
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Tile allocation failed
    #[error("Failed to allocate {0} elements")]
    Allocation(usize),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Precondition failures detected before the shift-multiply loop starts.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The process count has no integer square root
    #[error("the number of processes must be a square number (got {procs})")]
    NonSquareProcessCount {
        /// Number of processes in the world communicator
        procs: i32,
    },

    /// The matrix edge does not split evenly over the grid side
    #[error("matrix size {size} is not divisible by grid side {side}")]
    IndivisibleMatrix {
        /// Global matrix edge length N
        size: usize,
        /// Grid side length R
        side: usize,
    },

    /// The global matrix has no elements
    #[error("matrix size must be at least 1")]
    EmptyMatrix,
}

impl ConfigError {
    /// Code broadcast by the coordinator and used as the abort code.
    pub fn code(&self) -> i32 {
        match self {
            ConfigError::NonSquareProcessCount { .. } => 1,
            ConfigError::IndivisibleMatrix { .. } => 2,
            ConfigError::EmptyMatrix => 3,
        }
    }

    /// Rebuild a verdict from a broadcast code and the locally known shape.
    ///
    /// Returns `None` for code 0 (configuration accepted).
    pub fn from_code(code: i32, procs: i32, size: usize, side: usize) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(ConfigError::NonSquareProcessCount { procs }),
            2 => Some(ConfigError::IndivisibleMatrix { size, side }),
            _ => Some(ConfigError::EmptyMatrix),
        }
    }
}

impl Error {
    /// True when this error is the result of a collective abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }

    /// Abort code a rank escalates with when it leaves with this error.
    ///
    /// `None` when every rank already shares the outcome: a configuration
    /// verdict is broadcast to all ranks, and an abort has already reached
    /// them.
    pub fn abort_code(&self) -> Option<i32> {
        match self {
            Error::Config(_) | Error::Aborted { .. } => None,
            _ => Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unshared_failures_escalate() {
        assert_eq!(Error::Internal("boom".into()).abort_code(), Some(1));
        assert_eq!(Error::PeerExited(2).abort_code(), Some(1));
        assert_eq!(Error::Allocation(64).abort_code(), Some(1));
        assert_eq!(Error::Config(ConfigError::EmptyMatrix).abort_code(), None);
        assert_eq!(Error::Aborted { origin: 0, code: 3 }.abort_code(), None);
    }

    #[test]
    fn config_codes_round_trip() {
        let cases = [
            ConfigError::NonSquareProcessCount { procs: 10 },
            ConfigError::IndivisibleMatrix { size: 10, side: 3 },
            ConfigError::EmptyMatrix,
        ];
        for case in cases {
            assert_eq!(ConfigError::from_code(case.code(), 10, 10, 3), Some(case));
        }
        assert_eq!(ConfigError::from_code(0, 16, 16, 4), None);
    }

    #[test]
    fn config_error_message_names_precondition() {
        let err = Error::from(ConfigError::NonSquareProcessCount { procs: 10 });
        assert!(err.to_string().contains("square number"));
        assert!(!err.is_abort());
        assert!(Error::Aborted { origin: 0, code: 1 }.is_abort());
    }
}
