#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! USB host stack for the STM32 OTG FS/HS core
//!
//! Implements USB 2.0 host-side control, bulk, interrupt and
//! isochronous transfers on top of the OTG core's hardware channels,
//! plus device enumeration, a hub/port state machine and a set of
//! class drivers (mass storage, hub, HID, FTDI serial, Android
//! accessory, video).
//!
//! # Core components
//!
//! - [`host`] - the [`host::UsbHost`] controller object and URB API
//! - [`otg`] - register layer, channel pool and transfer scheduler
//! - [`descriptor`] - descriptor views and fail-closed iteration
//! - [`enumeration`] - device objects and the enumeration protocol
//! - [`port`] - root/hub port state machine
//! - [`class`] - class driver registry and the concrete drivers
//!
//! # Integration
//!
//! The application owns a static [`host::UsbHost`], enables the OTG
//! core clock and the DWT cycle counter, routes the OTG interrupt to
//! [`host::UsbHost::on_interrupt`], and calls
//! [`host::UsbHost::main_loop`] periodically from a thread:
//!
//! ```no_run
//! use stm32_otg_usbh::host::UsbHost;
//!
//! // OTG_FS peripheral base on STM32F4
//! let usb = unsafe { UsbHost::new(0x5000_0000) };
//! usb.start();
//! loop {
//!     usb.main_loop();
//!     // ... application work, e.g. usb.msd_read(...)
//! }
//! ```
//!
//! All shared state is guarded by one global critical section; the
//! blocking transfer helpers must not be called from interrupt
//! context.

pub mod class;
pub mod descriptor;
pub mod enumeration;
pub mod error;
pub mod host;
pub mod otg;
pub mod port;
pub mod timing;
pub mod urb;

pub use error::{Result, UsbError};
pub use host::{EpConfig, UsbHost};
pub use urb::{EpHandle, EpType, SetupPacket, UrbHandle, UrbStatus};
