use std::fmt;
use std::io;

pub type DriverResult<T> = Result<T, DriverError>;

/// Error set surfaced by the driver.
///
/// Argument and resource errors are reported synchronously by the API layer
/// and never touch the engine. Protocol and transport errors complete the
/// in-flight command. Connection-level conditions (`Closed`, `SendFail`)
/// travel through connection events and the netconn mailbox sentinels.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DriverError {
    /// Generic `ERROR`/`FAIL` terminator from the radio.
    Device,
    /// Invalid argument on an API call.
    Argument,
    /// Allocation or queue capacity exhausted.
    Memory,
    /// All connection slots are occupied.
    NoFreeConnection,
    /// Operation requires an established station link.
    WifiNotConnected,
    /// Radio not present on the serial line.
    NoDevice,
    /// The in-flight command did not complete within its deadline.
    Timeout,
    /// Radio answered `busy p...` and refused the command.
    Busy,
    /// Command not supported by this firmware variant.
    NotSupported,
    /// Connection closed by the remote side.
    Closed,
    /// Radio reported `ALREADY CONNECTED` for a start request.
    AlreadyConnected,
    /// Radio reported `SEND FAIL` for a data transmission.
    SendFail,
    /// AT firmware version is older than the configured minimum.
    VersionMismatch,
    /// Command aborted because the device was reset underneath it.
    ResetAborted,
    /// Serial transport failure.
    Io(io::ErrorKind),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverError::Device => write!(f, "device returned an error"),
            DriverError::Argument => write!(f, "invalid argument"),
            DriverError::Memory => write!(f, "out of memory"),
            DriverError::NoFreeConnection => write!(f, "no free connection slot"),
            DriverError::WifiNotConnected => write!(f, "wifi not connected"),
            DriverError::NoDevice => write!(f, "device not present"),
            DriverError::Timeout => write!(f, "command timed out"),
            DriverError::Busy => write!(f, "device busy"),
            DriverError::NotSupported => write!(f, "operation not supported"),
            DriverError::Closed => write!(f, "connection closed"),
            DriverError::AlreadyConnected => write!(f, "already connected"),
            DriverError::SendFail => write!(f, "send failed"),
            DriverError::VersionMismatch => write!(f, "unsupported firmware version"),
            DriverError::ResetAborted => write!(f, "aborted by device reset"),
            DriverError::Io(kind) => write!(f, "serial transport error: {:?}", kind),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<io::Error> for DriverError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        DriverError::Io(io_error.kind())
    }
}

/// Verdict returned by connection event callbacks.
///
/// `IgnoreMore` is meaningful only for receive events: it instructs the
/// engine to drop the payload (and, while manual receive is active, to stop
/// pulling further data) instead of blocking on a full consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EvtReply {
    Ok,
    IgnoreMore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_folds_kind() {
        let err: DriverError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err, DriverError::Io(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_display_is_human_readable() {
        assert_eq!(DriverError::Timeout.to_string(), "command timed out");
    }
}
