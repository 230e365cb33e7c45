//! Port state machine
//!
//! One `Port` exists for the root port and one per downstream hub
//! port. The attach flow follows the USB 2.0 hub model: a
//! connection-change is debounced, the port is reset (with bounded
//! retries), speed is read from the port status, and the embedded
//! device is enumerated and handed to the class-driver registry.
//! A connection-change observed anywhere in the middle aborts
//! immediately rather than proceeding on stale state.

use bitflags::bitflags;
use log::{info, warn};

use crate::enumeration::{self, Device, DeviceSpeed, DeviceState};
use crate::host::{EpConfig, UsbHost};
use crate::timing::{self, Deadline};

// wPortStatus bits (USB 2.0 §11.24.2.7); the `C_` constants are the
// matching wPortChange bits.
pub const PORT_CONNECTION: u16 = 1 << 0;
pub const PORT_ENABLE: u16 = 1 << 1;
pub const PORT_SUSPEND: u16 = 1 << 2;
pub const PORT_OVERCURRENT: u16 = 1 << 3;
pub const PORT_RESET: u16 = 1 << 4;
pub const PORT_POWER: u16 = 1 << 8;
pub const PORT_LOW_SPEED: u16 = 1 << 9;
pub const PORT_HIGH_SPEED: u16 = 1 << 10;

pub const PORT_C_CONNECTION: u16 = 1 << 0;
pub const PORT_C_ENABLE: u16 = 1 << 1;
pub const PORT_C_SUSPEND: u16 = 1 << 2;
pub const PORT_C_OVERCURRENT: u16 = 1 << 3;
pub const PORT_C_RESET: u16 = 1 << 4;

bitflags! {
    /// Decoded wPortStatus
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u16 {
        const CONNECTION = PORT_CONNECTION;
        const ENABLE = PORT_ENABLE;
        const SUSPEND = PORT_SUSPEND;
        const OVERCURRENT = PORT_OVERCURRENT;
        const RESET = PORT_RESET;
        const POWER = PORT_POWER;
        const LOW_SPEED = PORT_LOW_SPEED;
        const HIGH_SPEED = PORT_HIGH_SPEED;
    }
}

impl PortStatus {
    /// Negotiated speed per the hub status bits
    pub fn device_speed(self) -> DeviceSpeed {
        if self.contains(Self::LOW_SPEED) {
            DeviceSpeed::Low
        } else if self.contains(Self::HIGH_SPEED) {
            DeviceSpeed::High
        } else {
            DeviceSpeed::Full
        }
    }
}

/// Attach debounce time after a connect is first seen
pub const DEBOUNCE_MS: u32 = 200;
/// Time allowed for a port reset to signal completion
pub const RESET_TIMEOUT_MS: u32 = 500;
/// Post-reset recovery time before the first transaction
pub const RESET_RECOVERY_MS: u32 = 100;
/// Full reset+enumerate attempts before abandoning a device
pub const ENUM_RETRIES: u8 = 3;
/// Reset pulses per attempt before the attempt counts as failed
pub const RESET_RETRIES: u8 = 3;

/// How a port's hub requests reach the wire: the root port is emulated
/// over the OTG core's HPRT register, downstream ports go through
/// their hub's control endpoint.
pub(crate) trait PortBackend {
    /// (wPortStatus, accumulated wPortChange)
    fn fetch_status(&self, host: &UsbHost) -> Option<(u16, u16)>;
    /// CLEAR_FEATURE for a change bit
    fn clear_change(&self, host: &UsbHost, change_mask: u16);
    /// SET_FEATURE(PORT_RESET)
    fn reset(&self, host: &UsbHost);
}

/// Backend for the root port
pub(crate) struct RootBackend;

impl PortBackend for RootBackend {
    fn fetch_status(&self, host: &UsbHost) -> Option<(u16, u16)> {
        Some(host.root_port_status())
    }

    fn clear_change(&self, host: &UsbHost, change_mask: u16) {
        host.root_clear_change(change_mask);
    }

    fn reset(&self, host: &UsbHost) {
        host.root_port_reset();
    }
}

/// One physical or hub-provided port with its embedded device slot
pub struct Port {
    /// 1-based port number (root port is 1)
    pub number: u8,
    /// Cached wPortStatus
    pub status: u16,
    /// Accumulated wPortChange bits not yet handled
    pub c_status: u16,
    pub device: Device,
}

impl Port {
    pub(crate) fn root() -> Self {
        Self {
            number: 1,
            status: 0,
            c_status: 0,
            device: Device::new(),
        }
    }

    pub(crate) fn downstream(number: u8) -> Self {
        Self {
            number,
            status: 0,
            c_status: 0,
            device: Device::new(),
        }
    }
}

fn update_status(host: &UsbHost, backend: &dyn PortBackend, port: &mut Port) {
    if let Some((status, change)) = backend.fetch_status(host) {
        port.status = status;
        port.c_status |= change;
    }
}

/// Decode and handle a port's pending change bits one at a time.
/// A connection change is handled as disconnect-then-possible-reconnect
/// so a fast unplug/replug is never mistaken for a pure attach.
pub(crate) fn process_status_change(host: &UsbHost, backend: &dyn PortBackend, port: &mut Port) {
    update_status(host, backend, port);

    if port.c_status & PORT_C_CONNECTION != 0 {
        port.c_status &= !PORT_C_CONNECTION;
        backend.clear_change(host, PORT_C_CONNECTION);
        if port.status & (PORT_CONNECTION | PORT_ENABLE) == PORT_CONNECTION {
            if port.device.state != DeviceState::Disconnected {
                port_disconnected(host, port);
            }
            // connected, not yet enabled
            port_connected(host, backend, port);
        } else {
            port_disconnected(host, port);
        }
    }

    for mask in [
        PORT_C_RESET,
        PORT_C_ENABLE,
        PORT_C_OVERCURRENT,
        PORT_C_SUSPEND,
    ] {
        if port.c_status & mask != 0 {
            port.c_status &= !mask;
            backend.clear_change(host, mask);
        }
    }
}

/// Attach sequence: debounce, reset loop, enumerate, class dispatch.
fn port_connected(host: &UsbHost, backend: &dyn PortBackend, port: &mut Port) {
    info!("usbh: port {} connected, wait debounce", port.number);
    port.device.state = DeviceState::Attached;

    timing::delay_ms(DEBOUNCE_MS);

    update_status(host, backend, port);
    if port.c_status & PORT_C_CONNECTION != 0 {
        // connection state changed during debounce
        warn!("usbh: port {} attach aborted", port.number);
        port.device.state = DeviceState::Disconnected;
        return;
    }

    port.device.state = DeviceState::Connected;

    let mut retries = ENUM_RETRIES;
    'retry: loop {
        // reset loop
        let mut reset_ok = false;
        'reset: for _ in 0..RESET_RETRIES {
            port.c_status &= !(PORT_C_RESET | PORT_C_ENABLE);
            backend.reset(host);
            timing::delay_ms(20); // reset signalling, min 10 ms
            let deadline = Deadline::after_ms(RESET_TIMEOUT_MS);
            loop {
                update_status(host, backend, port);

                if port.c_status & PORT_C_CONNECTION != 0 {
                    warn!("usbh: port {} connection changed mid-reset", port.number);
                    port.device.state = DeviceState::Disconnected;
                    return;
                }

                if port.c_status & PORT_C_RESET != 0 {
                    port.c_status &= !PORT_C_RESET;
                    backend.clear_change(host, PORT_C_RESET);

                    if port.status & (PORT_ENABLE | PORT_CONNECTION)
                        == (PORT_ENABLE | PORT_CONNECTION)
                    {
                        reset_ok = true;
                        break 'reset;
                    }
                }

                if deadline.is_expired() {
                    break;
                }
            }
        }

        if !reset_ok {
            warn!("usbh: port {} reset failed", port.number);
            port.device.state = DeviceState::Disconnected;
            return;
        }

        info!("usbh: port {} reset ok, recovery", port.number);
        timing::delay_ms(RESET_RECOVERY_MS);

        let speed = PortStatus::from_bits_retain(port.status).device_speed();
        port.device.initialize(speed);

        // provisional 64-byte control endpoint at address 0
        match host.ep_open(EpConfig::ep0(0, 64, speed == DeviceSpeed::Low)) {
            Ok(ep0) => port.device.ep0 = Some(ep0),
            Err(_) => {
                port.device.state = DeviceState::Disconnected;
                return;
            }
        }

        if enumeration::enumerate(host, &mut port.device).is_ok() {
            break 'retry;
        }

        // enumeration failed: tear down EP0 and retry the whole
        // reset+enumerate sequence
        if let Some(ep0) = port.device.ep0.take() {
            host.ep_close(ep0);
        }
        retries -= 1;
        if retries == 0 {
            warn!("usbh: port {} gave up enumerating", port.number);
            port.device.state = DeviceState::Disconnected;
            return;
        }
    }

    // best-effort default language ID
    enumeration::load_lang_id0(host, &mut port.device);

    // single-configuration devices are configured right away
    if port
        .device
        .dev_desc
        .map(|d| d.num_configurations == 1)
        .unwrap_or(false)
    {
        info!("usbh: device has only one configuration");
        let _ = enumeration::configure(host, &mut port.device, 0);
    }

    crate::class::process_device(host, &mut port.device);
}

/// Teardown on detach: drivers unloaded, control endpoint closed (any
/// queued URB completes as Disconnected), address freed, cached
/// configuration descriptor dropped.
pub(crate) fn port_disconnected(host: &UsbHost, port: &mut Port) {
    if port.device.state == DeviceState::Disconnected {
        return;
    }

    info!("usbh: port {} disconnected", port.number);

    crate::class::unload_all(host, &mut port.device);

    if let Some(ep0) = port.device.ep0.take() {
        host.ep_close(ep0);
    }

    if port.device.address != 0 {
        host.with(|h| h.free_address(port.device.address));
        port.device.address = 0;
    }

    port.device.full_cfg.clear();
    port.device.state = DeviceState::Disconnected;
}

/// Root-port slice of the main loop
pub(crate) fn process_root_port(host: &UsbHost) {
    let (_, c_status) = host.root_port_status();
    if c_status == 0 {
        return;
    }
    let mut port = host.root.borrow_mut();
    process_status_change(host, &RootBackend, &mut port);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_decode_from_status_bits() {
        let ls = PortStatus::from_bits_retain(PORT_CONNECTION | PORT_LOW_SPEED);
        assert_eq!(ls.device_speed(), DeviceSpeed::Low);
        let hs = PortStatus::from_bits_retain(PORT_CONNECTION | PORT_HIGH_SPEED);
        assert_eq!(hs.device_speed(), DeviceSpeed::High);
        let fs = PortStatus::from_bits_retain(PORT_CONNECTION);
        assert_eq!(fs.device_speed(), DeviceSpeed::Full);
    }

    #[test]
    fn change_bits_share_low_positions() {
        // wPortChange bits mirror the low wPortStatus bits per the hub
        // spec; the decode relies on that
        assert_eq!(PORT_C_CONNECTION, PORT_CONNECTION);
        assert_eq!(PORT_C_RESET, PORT_RESET);
    }
}
