//! USB host error types

use core::fmt;

/// USB host operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB host error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Device not present or disconnected mid-operation
    DeviceDisconnected,
    /// Endpoint returned STALL
    Stall,
    /// Timeout waiting for a response
    Timeout,
    /// Transaction error (CRC, bad PID, bus turnaround timeout)
    TransactionError,
    /// Transfer was cancelled by the caller
    Cancelled,
    /// Buffer too small for the data the device wants to send
    BufferOverflow,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for the requested operation
    InvalidState,
    /// No free resources (channels, URB slots, addresses, driver slots)
    NoResources,
    /// Malformed or unexpected descriptor
    InvalidDescriptor,
    /// Endpoint is halted
    EndpointHalted,
    /// Root or hub port error
    PortError,
    /// Operation not supported by this device
    Unsupported,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceDisconnected => write!(f, "Device disconnected"),
            Self::Stall => write!(f, "USB stall"),
            Self::Timeout => write!(f, "Timeout"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NoResources => write!(f, "No resources available"),
            Self::InvalidDescriptor => write!(f, "Invalid descriptor"),
            Self::EndpointHalted => write!(f, "Endpoint halted"),
            Self::PortError => write!(f, "Port error"),
            Self::Unsupported => write!(f, "Unsupported operation"),
        }
    }
}
