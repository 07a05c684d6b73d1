/*!
 * Error types for the beamflow device stack.
 *
 * Every fallible operation in this crate returns one of the typed errors
 * below; transport problems are never silently swallowed.
 */
use std::time::Duration;

use thiserror::Error;

/// Error establishing a connection to the remote control server
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The endpoint could not be reached
    #[error("Endpoint {0} unreachable: {1}")]
    Unreachable(String, String),

    /// The endpoint actively refused the connection
    #[error("Connection to {0} refused")]
    Refused(String),

    /// The connection attempt timed out
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The liveness handshake did not complete
    #[error("Handshake with {0} failed: {1}")]
    Handshake(String, String),
}

/// Error during a single request/response round trip
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// No reply arrived before the call deadline
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The connection is gone; an explicit reconnect is required
    #[error("Connection closed")]
    Disconnected,

    /// Too many consecutive timeouts; the connection is degraded until
    /// an explicit reconnect
    #[error("Connection unhealthy, reconnect required")]
    Unhealthy,

    /// A frame could not be encoded or decoded
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The server answered with an error status
    #[error("Server rejected call: {0}")]
    Rejected(String),
}

/// Error during a discovery cycle
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The catalog payload was missing required fields
    #[error("Malformed catalog: {0}")]
    Malformed(String),

    /// Two raw device names sanitize to the same identifier
    #[error("Device name collision: '{first}' and '{second}' both sanitize to '{sanitized}'")]
    NameCollision {
        /// Raw name seen first
        first: String,
        /// Raw name seen second
        second: String,
        /// The identifier both names map to
        sanitized: String,
    },

    /// The catalog request itself failed
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Error raised by device handle operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device is not (or no longer) present in the registry
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The operation is not supported by this device
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The device is already executing a conflicting operation
    #[error("Device busy: {0}")]
    Busy(String),

    /// The underlying call failed
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Error resolving an in-progress motion
#[derive(Error, Debug)]
pub enum MotionError {
    /// The motor faulted or settled away from the goal
    #[error("Motion fault at position {last_position}")]
    Fault {
        /// Last position reported by the server
        last_position: f64,
        /// Server-side fault code, when one was reported
        fault_code: Option<i64>,
    },

    /// The motion was cancelled by an explicit stop
    #[error("Motion cancelled")]
    Cancelled {
        /// Last known position, if any status had been observed
        last_position: Option<f64>,
    },

    /// A status call failed while supervising the move
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Aggregate error for session-level operations and CLI consumption
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection establishment failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A call failed
    #[error(transparent)]
    Call(#[from] CallError),

    /// Discovery failed
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// A device operation failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A motion failed
    #[error(transparent)]
    Motion(#[from] MotionError),
}

/// Result type for session-level operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_display() {
        let err = CallError::Timeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "Call timed out after 500ms");

        let err = CallError::Rejected("no such motor".to_string());
        assert_eq!(err.to_string(), "Server rejected call: no such motor");
    }

    #[test]
    fn test_motion_error_display() {
        let err = MotionError::Fault {
            last_position: 4.2,
            fault_code: Some(7),
        };
        assert_eq!(err.to_string(), "Motion fault at position 4.2");

        let err = MotionError::Cancelled {
            last_position: None,
        };
        assert_eq!(err.to_string(), "Motion cancelled");
    }

    #[test]
    fn test_client_error_from() {
        let err: ClientError = CallError::Disconnected.into();
        assert!(matches!(err, ClientError::Call(CallError::Disconnected)));
    }
}
