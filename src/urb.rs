//! URB and endpoint objects
//!
//! A URB (USB Request Block) is one in-flight transfer request. URBs
//! and endpoints live in fixed arenas owned by the host controller and
//! are referenced by slot handles; the `next`-pointer chains of a
//! classic intrusive design become index queues, which keeps
//! insertion/removal O(1) under the interrupt-context constraints
//! without raw pointer ownership.

use heapless::Deque;

use crate::error::{Result, UsbError};

/// Maximum queued URBs per endpoint
pub const MAX_URBS_PER_EP: usize = 4;

/// URB lifecycle status.
///
/// Once a URB leaves `Pending` its status is terminal; no further
/// hardware activity touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UrbStatus {
    /// Slot not in use
    Uninit = 0,
    /// Object initialized, not yet submitted
    Initialized = 1,
    /// Submitted, owned by the scheduler
    Pending = 2,
    /// Transport error after retries were exhausted
    Error = 3,
    /// No response within the allowed time
    Timeout = 4,
    /// Cancelled by the caller
    Cancelled = 5,
    /// Endpoint STALLed the transfer
    Stall = 6,
    /// Device disconnected while the URB was outstanding
    Disconnected = 7,
    /// Completed successfully
    Ok = 8,
}

impl UrbStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initialized,
            2 => Self::Pending,
            3 => Self::Error,
            4 => Self::Timeout,
            5 => Self::Cancelled,
            6 => Self::Stall,
            7 => Self::Disconnected,
            8 => Self::Ok,
            _ => Self::Uninit,
        }
    }

    /// True once the URB has reached a final state
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Uninit | Self::Initialized | Self::Pending)
    }

    /// Map a terminal status to a `Result`
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Timeout => Err(UsbError::Timeout),
            Self::Cancelled => Err(UsbError::Cancelled),
            Self::Stall => Err(UsbError::Stall),
            Self::Disconnected => Err(UsbError::DeviceDisconnected),
            Self::Error => Err(UsbError::TransactionError),
            _ => Err(UsbError::InvalidState),
        }
    }
}

/// Endpoint transfer type, `bmAttributes` encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EpType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EpType {
    pub fn from_attributes(bm: u8) -> Self {
        match bm & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    /// Isochronous and interrupt endpoints need per-frame scheduling
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Isochronous | Self::Interrupt)
    }
}

/// Endpoint lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpState {
    /// Slot free / object not initialized
    Uninitialized,
    /// Initialized but not accepting URBs
    Closed,
    /// Accepting URBs
    Open,
    /// STALLed by the device; needs a reset before reuse
    Halted,
}

/// Handle to an endpoint slot in the host arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EpHandle(pub(crate) u8);

/// Handle to a URB slot in the host arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UrbHandle(pub(crate) u8);

/// Completion callback, invoked in interrupt context; must not block.
pub type CompletionCallback = fn(urb: UrbHandle, status: UrbStatus, actual: u32, arg: usize);

/// USB SETUP packet (USB 2.0 §9.3)
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Device-to-host, standard, device recipient
    pub const IN_STANDARD_DEVICE: u8 = 0x80;
    /// Host-to-device, standard, device recipient
    pub const OUT_STANDARD_DEVICE: u8 = 0x00;
    /// Device-to-host, standard, interface recipient
    pub const IN_STANDARD_INTERFACE: u8 = 0x81;
    /// Host-to-device, standard, interface recipient
    pub const OUT_STANDARD_INTERFACE: u8 = 0x01;
    /// Host-to-device, standard, endpoint recipient
    pub const OUT_STANDARD_ENDPOINT: u8 = 0x02;
    /// Device-to-host, class, interface recipient
    pub const IN_CLASS_INTERFACE: u8 = 0xA1;
    /// Host-to-device, class, interface recipient
    pub const OUT_CLASS_INTERFACE: u8 = 0x21;
    /// Device-to-host, class, device recipient
    pub const IN_CLASS_DEVICE: u8 = 0xA0;
    /// Host-to-device, class, device recipient
    pub const OUT_CLASS_DEVICE: u8 = 0x20;
    /// Device-to-host, class, other recipient (hub ports)
    pub const IN_CLASS_OTHER: u8 = 0xA3;
    /// Host-to-device, class, other recipient (hub ports)
    pub const OUT_CLASS_OTHER: u8 = 0x23;
    /// Device-to-host, vendor, device recipient
    pub const IN_VENDOR_DEVICE: u8 = 0xC0;
    /// Host-to-device, vendor, device recipient
    pub const OUT_VENDOR_DEVICE: u8 = 0x40;

    pub const REQ_GET_STATUS: u8 = 0x00;
    pub const REQ_CLEAR_FEATURE: u8 = 0x01;
    pub const REQ_SET_FEATURE: u8 = 0x03;
    pub const REQ_SET_ADDRESS: u8 = 0x05;
    pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
    pub const REQ_SET_DESCRIPTOR: u8 = 0x07;
    pub const REQ_GET_CONFIGURATION: u8 = 0x08;
    pub const REQ_SET_CONFIGURATION: u8 = 0x09;
    pub const REQ_GET_INTERFACE: u8 = 0x0A;
    pub const REQ_SET_INTERFACE: u8 = 0x0B;

    /// ENDPOINT_HALT feature selector for CLEAR_FEATURE
    pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// GET_DESCRIPTOR for a device-level descriptor
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, lang_id: u16, length: u16) -> Self {
        Self::new(
            Self::IN_STANDARD_DEVICE,
            Self::REQ_GET_DESCRIPTOR,
            ((desc_type as u16) << 8) | desc_index as u16,
            lang_id,
            length,
        )
    }

    pub const fn set_address(address: u8) -> Self {
        Self::new(
            Self::OUT_STANDARD_DEVICE,
            Self::REQ_SET_ADDRESS,
            address as u16,
            0,
            0,
        )
    }

    pub const fn set_configuration(config: u8) -> Self {
        Self::new(
            Self::OUT_STANDARD_DEVICE,
            Self::REQ_SET_CONFIGURATION,
            config as u16,
            0,
            0,
        )
    }

    pub const fn set_interface(interface: u8, alt: u8) -> Self {
        Self::new(
            Self::OUT_STANDARD_INTERFACE,
            Self::REQ_SET_INTERFACE,
            alt as u16,
            interface as u16,
            0,
        )
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for `ep_address` (with direction bit)
    pub const fn clear_endpoint_halt(ep_address: u8) -> Self {
        Self::new(
            Self::OUT_STANDARD_ENDPOINT,
            Self::REQ_CLEAR_FEATURE,
            Self::FEATURE_ENDPOINT_HALT,
            ep_address as u16,
            0,
        )
    }

    /// True for device-to-host requests
    pub const fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Wire representation, little-endian
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.request_type;
        b[1] = self.request;
        b[2..4].copy_from_slice(&self.value.to_le_bytes());
        b[4..6].copy_from_slice(&self.index.to_le_bytes());
        b[6..8].copy_from_slice(&self.length.to_le_bytes());
        b
    }
}

/// Control transfer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtrlPhase {
    Setup,
    Data,
    Status,
}

/// Which scheduler queue an endpoint currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpQueue {
    None,
    Pending,
    Active,
}

/// Per-endpoint transfer progress, valid while a channel is assigned
/// or a multi-part transfer is in flight.
pub(crate) struct XferState {
    /// Cursor into the URB buffer for the current hardware programming
    pub buf: *mut u8,
    /// Bytes programmed into the current channel round
    pub len: u32,
    /// Bytes moved through the FIFO so far in this round
    pub partial: u32,
    /// Packet count programmed
    pub packets: u16,
    /// Consecutive transaction errors
    pub error_count: u8,
    /// Control phase when `ep_type == Control`
    pub ctrl_phase: CtrlPhase,
    /// Frames until next periodic service (interrupt endpoints)
    pub frame_counter: u8,
}

impl XferState {
    pub const fn new() -> Self {
        Self {
            buf: core::ptr::null_mut(),
            len: 0,
            partial: 0,
            packets: 0,
            error_count: 0,
            ctrl_phase: CtrlPhase::Setup,
            frame_counter: 1,
        }
    }
}

/// One endpoint slot in the host arena
pub(crate) struct EpSlot {
    pub state: EpState,
    pub ep_type: EpType,
    /// Endpoint number, 0..=15
    pub number: u8,
    /// Transfer direction; flips per phase on control endpoints
    pub dir_in: bool,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Address of the owning device (0 before SET_ADDRESS)
    pub dev_addr: u8,
    pub low_speed: bool,
    /// Data toggle PID for the next packet (HCTSIZ DPID bits)
    pub dt_pid: u32,
    /// Queued URB slot indices; front is the active one
    pub urbs: Deque<u8, MAX_URBS_PER_EP>,
    /// Hardware channel while a transfer is outstanding
    pub channel: Option<u8>,
    pub queue: EpQueue,
    pub xfer: XferState,
}

impl EpSlot {
    pub const fn free() -> Self {
        Self {
            state: EpState::Uninitialized,
            ep_type: EpType::Control,
            number: 0,
            dir_in: false,
            max_packet_size: 0,
            interval: 0,
            dev_addr: 0,
            low_speed: false,
            dt_pid: 0,
            urbs: Deque::new(),
            channel: None,
            queue: EpQueue::None,
            xfer: XferState::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == EpState::Uninitialized
    }
}

/// One URB slot in the host arena
pub(crate) struct UrbSlot {
    pub status: UrbStatus,
    /// Owning endpoint slot index
    pub ep: u8,
    /// SETUP packet bytes for control transfers
    pub setup: [u8; 8],
    pub has_setup: bool,
    /// Caller's data buffer; must stay valid until the URB completes
    pub buf: *mut u8,
    pub requested: u32,
    pub actual: u32,
    /// True once the URB has been programmed into hardware at least once
    pub queued: bool,
    /// Status to apply when an in-hardware abort's halt completes.
    /// Kept separate from `status` so waiters never observe a terminal
    /// state while the channel is still armed.
    pub abort_status: UrbStatus,
    pub callback: Option<CompletionCallback>,
    pub cb_arg: usize,
}

impl UrbSlot {
    pub const fn free() -> Self {
        Self {
            status: UrbStatus::Uninit,
            ep: 0,
            setup: [0; 8],
            has_setup: false,
            buf: core::ptr::null_mut(),
            requested: 0,
            actual: 0,
            queued: false,
            abort_status: UrbStatus::Cancelled,
            callback: None,
            cb_arg: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == UrbStatus::Uninit
    }

    /// Terminal statuses are sticky: completing an already-completed
    /// URB is a no-op, preserving status monotonicity.
    pub fn set_status(&mut self, status: UrbStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!UrbStatus::Initialized.is_terminal());
        assert!(!UrbStatus::Pending.is_terminal());
        for s in [
            UrbStatus::Ok,
            UrbStatus::Error,
            UrbStatus::Timeout,
            UrbStatus::Cancelled,
            UrbStatus::Stall,
            UrbStatus::Disconnected,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn status_is_monotonic_once_terminal() {
        let mut urb = UrbSlot::free();
        urb.status = UrbStatus::Pending;
        assert!(urb.set_status(UrbStatus::Disconnected));
        // later completion attempts must not overwrite the first
        assert!(!urb.set_status(UrbStatus::Ok));
        assert_eq!(urb.status, UrbStatus::Disconnected);
    }

    #[test]
    fn ep_type_decode() {
        assert_eq!(EpType::from_attributes(0x02), EpType::Bulk);
        assert_eq!(EpType::from_attributes(0x03), EpType::Interrupt);
        assert_eq!(EpType::from_attributes(0xFD), EpType::Isochronous);
        assert!(EpType::Interrupt.is_periodic());
        assert!(EpType::Isochronous.is_periodic());
        assert!(!EpType::Bulk.is_periodic());
        assert!(!EpType::Control.is_periodic());
    }
}
