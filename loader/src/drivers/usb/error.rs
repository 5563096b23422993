use core::fmt;

/// Status of a failed USB operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    OutOfMemory,
    InvalidParameter,
    Unsupported,
    InvalidDevice,
    Timeout,
    Stall,
    /// CRC or bit-stuffing error on the wire.
    CrcError,
    Babble,
    DataBuffer,
    /// NAK received, or the transfer simply has not finished.
    NotFinished,
    NotResponding,
    /// A fixed-size descriptor pool or ring has no free entry.
    NoDescriptors,
    MalformedDescriptor,
    CswMismatch,
    CommandFailed,
    ControllerInit,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UsbError::OutOfMemory => "memory allocation failed",
            UsbError::InvalidParameter => "invalid parameter",
            UsbError::Unsupported => "unsupported",
            UsbError::InvalidDevice => "invalid device",
            UsbError::Timeout => "timeout",
            UsbError::Stall => "endpoint stalled",
            UsbError::CrcError => "CRC/bitstuff error",
            UsbError::Babble => "babble detected",
            UsbError::DataBuffer => "data buffer error",
            UsbError::NotFinished => "NAK received / not finished",
            UsbError::NotResponding => "device not responding",
            UsbError::NoDescriptors => "descriptor pool exhausted",
            UsbError::MalformedDescriptor => "malformed descriptor",
            UsbError::CswMismatch => "command status wrapper mismatch",
            UsbError::CommandFailed => "command failed",
            UsbError::ControllerInit => "controller initialization failed",
        };
        f.write_str(msg)
    }
}

/// Result of polling an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotFinished,
    Success,
    Failed(UsbError),
}

impl TransferStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TransferStatus::NotFinished)
    }
}

impl From<Result<(), UsbError>> for TransferStatus {
    fn from(result: Result<(), UsbError>) -> Self {
        match result {
            Ok(()) => TransferStatus::Success,
            Err(e) => TransferStatus::Failed(e),
        }
    }
}
