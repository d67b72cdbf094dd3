//! Common error types for the `tokio` based client.
//!
//! The `Error` enum is the single error surface of the device client: it
//! wraps the pure codec errors and adds the transport and device fault
//! conditions that only exist once I/O is involved.

use crate::protocol::SerialPollFlags;
use crate::{calram, protocol};

/// Represents all possible errors that can occur while talking to the
/// instrument.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps [`protocol::Error`]: malformed replies and rejected arguments.
    #[error(transparent)]
    Protocol(#[from] protocol::Error),

    /// Wraps [`calram::Error`]: calibration data that cannot be encoded.
    #[error(transparent)]
    Calram(#[from] calram::Error),

    /// A transport-level I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply arrived within the configured deadline. The client never
    /// retries on its own: a retry after a partially consumed reply would
    /// desynchronize the wire protocol.
    #[error("no reply from instrument within the configured timeout")]
    Timeout,

    /// The instrument input is overloaded.
    #[error("instrument input overloaded")]
    Overload,

    /// The instrument did not signal data ready when a reading was
    /// expected. Contains the serial poll register that was seen instead.
    #[error("instrument not ready for read, serial poll was {0:?}")]
    NotReady(SerialPollFlags),

    /// Calibration writes are rejected because the front panel CAL switch
    /// is off. Nothing has been sent to the calibration memory.
    #[error("calibration writes are disabled by the front panel CAL switch")]
    CalRamProtected,

    /// The operation requires a connected client.
    #[error("not connected")]
    NotConnected,
}

/// The result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
