//! Android Open Accessory driver
//!
//! Two-stage protocol: a device in normal mode is offered the
//! accessory handshake (GET_PROTOCOL, identification strings, START);
//! if it accepts it drops off the bus and re-enumerates as a Google
//! accessory-mode device, which this driver then binds as a bulk
//! byte channel.

use log::{info, warn};

use crate::class::ClassDriver;
use crate::descriptor::{self, InterfaceIter, InterfaceView};
use crate::enumeration::{Device, DriverId};
use crate::error::{Result, UsbError};
use crate::host::{EpConfig, UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::urb::{EpHandle, EpType, SetupPacket, UrbStatus};

/// Concurrent accessory channels
pub const MAX_INSTANCES: usize = 1;

pub const GOOGLE_VID: u16 = 0x18D1;
/// Accessory-mode PIDs (plain, +ADB, +audio variants)
pub const ACCESSORY_PIDS: [u16; 4] = [0x2D00, 0x2D01, 0x2D04, 0x2D05];

// Accessory vendor requests
pub const REQ_GET_PROTOCOL: u8 = 51;
pub const REQ_SEND_STRING: u8 = 52;
pub const REQ_START: u8 = 53;
pub const REQ_SET_AUDIO_MODE: u8 = 58;

/// Identification string indices for SEND_STRING
#[derive(Debug, Clone, Copy)]
#[repr(u16)]
pub enum StringId {
    Manufacturer = 0,
    Model = 1,
    Description = 2,
    Version = 3,
    Uri = 4,
    Serial = 5,
}

/// Identification the host presents during the handshake
#[derive(Debug, Clone, Copy)]
pub struct AccessoryIdentity {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub uri: &'static str,
    pub serial: &'static str,
    /// Also request audio support (protocol version 2)
    pub audio: bool,
}

struct AoaInstance {
    ep_in: EpHandle,
    ep_out: EpHandle,
}

/// Host-owned accessory channel arena
pub struct AoaPool {
    slots: [Option<AoaInstance>; MAX_INSTANCES],
    identity: Option<AccessoryIdentity>,
}

impl AoaPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; MAX_INSTANCES],
            identity: None,
        }
    }
}

fn is_accessory_mode(vid: u16, pid: u16) -> bool {
    vid == GOOGLE_VID && ACCESSORY_PIDS.contains(&pid)
}

fn send_string(host: &UsbHost, ep0: EpHandle, id: StringId, s: &str) -> Result<()> {
    // strings go over the wire null-terminated
    let mut buf = [0u8; 64];
    let n = s.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    let req = SetupPacket::new(
        SetupPacket::OUT_VENDOR_DEVICE,
        REQ_SEND_STRING,
        0,
        id as u16,
        (n + 1) as u16,
    );
    let (status, _) = host.control_out(ep0, req, &buf[..n + 1], CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()
}

/// Run the accessory handshake. On success the device re-enumerates in
/// accessory mode; the current connection is gone either way.
fn start_accessory(host: &UsbHost, ep0: EpHandle, identity: &AccessoryIdentity) -> Result<()> {
    let req = SetupPacket::new(SetupPacket::IN_VENDOR_DEVICE, REQ_GET_PROTOCOL, 0, 0, 2);
    let mut version = [0u8; 2];
    let (status, len) = host.control_request(ep0, req, &mut version, CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()?;
    if len < 2 {
        return Err(UsbError::Unsupported);
    }
    let protocol = u16::from_le_bytes(version);
    if protocol == 0 {
        return Err(UsbError::Unsupported);
    }
    info!("aoa: device speaks accessory protocol {}", protocol);

    send_string(host, ep0, StringId::Manufacturer, identity.manufacturer)?;
    send_string(host, ep0, StringId::Model, identity.model)?;
    send_string(host, ep0, StringId::Description, identity.description)?;
    send_string(host, ep0, StringId::Version, identity.version)?;
    send_string(host, ep0, StringId::Uri, identity.uri)?;
    send_string(host, ep0, StringId::Serial, identity.serial)?;

    if identity.audio && protocol >= 2 {
        let req = SetupPacket::new(
            SetupPacket::OUT_VENDOR_DEVICE,
            REQ_SET_AUDIO_MODE,
            1,
            0,
            0,
        );
        let _ = host.control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS);
    }

    let req = SetupPacket::new(SetupPacket::OUT_VENDOR_DEVICE, REQ_START, 0, 0, 0);
    host.control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS)
        .into_result()
}

fn find_bulk_pair(
    desc: &[u8],
) -> Option<(descriptor::EndpointDescriptor, descriptor::EndpointDescriptor)> {
    let scan = |iface: &InterfaceView<'_>| {
        let mut ep_in = None;
        let mut ep_out = None;
        for (ep, _) in iface.endpoints() {
            if EpType::from_attributes(ep.attributes) != EpType::Bulk {
                continue;
            }
            if ep.is_in() {
                ep_in = Some(ep);
            } else {
                ep_out = Some(ep);
            }
        }
        Some((ep_in?, ep_out?))
    };

    if desc.get(1) == Some(&descriptor::desc_type::CONFIGURATION) {
        let (_, interfaces) = InterfaceIter::new(desc).ok()?;
        for iface in interfaces {
            if let Some(found) = scan(&iface) {
                return Some(found);
            }
        }
        None
    } else {
        scan(&InterfaceView::from_interface_slice(desc)?)
    }
}

impl ClassDriver for AoaPool {
    fn name(&self) -> &'static str {
        "AOA"
    }

    fn matches(&self, class: u8, _subclass: u8, _protocol: u8) -> bool {
        // accessory-mode devices report vendor-specific or zero class
        class == 0xFF || class == 0x00
    }

    fn load(&mut self, host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId> {
        let devdesc = dev.dev_desc?;
        let ep0 = dev.ep0?;

        if is_accessory_mode(devdesc.id_vendor, devdesc.id_product) {
            let slot = self.slots.iter().position(|s| s.is_none())?;
            let (in_desc, out_desc) = find_bulk_pair(desc)?;
            let low_speed = dev.is_low_speed();
            let ep_in = host
                .ep_open(EpConfig::from_descriptor(&in_desc, dev.address, low_speed))
                .ok()?;
            let ep_out =
                match host.ep_open(EpConfig::from_descriptor(&out_desc, dev.address, low_speed)) {
                    Ok(ep) => ep,
                    Err(_) => {
                        host.ep_close(ep_in);
                        return None;
                    }
                };
            info!("aoa: accessory channel up");
            self.slots[slot] = Some(AoaInstance { ep_in, ep_out });
            return Some(DriverId::Aoa(slot as u8));
        }

        // normal-mode device: offer the handshake when the application
        // configured an identity; the device re-enumerates on success,
        // so nothing is bound here
        if let Some(identity) = self.identity {
            match start_accessory(host, ep0, &identity) {
                Ok(()) => info!("aoa: accessory started, waiting for re-enumeration"),
                Err(UsbError::Unsupported) => {}
                Err(_) => warn!("aoa: handshake failed"),
            }
        }
        None
    }

    fn unload(&mut self, host: &UsbHost, id: DriverId) {
        let DriverId::Aoa(slot) = id else { return };
        if let Some(inst) = self.slots[slot as usize].take() {
            host.ep_close(inst.ep_in);
            host.ep_close(inst.ep_out);
        }
    }
}

impl UsbHost {
    /// Configure the identification offered to normal-mode devices.
    /// Must be set before a device attaches for the handshake to run.
    pub fn aoa_set_identity(&self, identity: AccessoryIdentity) {
        self.aoa.borrow_mut().identity = Some(identity);
    }

    /// True when an accessory channel is bound
    pub fn aoa_ready(&self, slot: u8) -> bool {
        self.aoa.borrow().slots[slot as usize].is_some()
    }

    /// Read from the accessory channel
    pub fn aoa_read(&self, slot: u8, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let ep_in = {
            let pool = self.aoa.borrow();
            pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?
                .ep_in
        };
        let (status, len) = self.bulk_in(ep_in, buf, timeout_ms);
        match status {
            UrbStatus::Ok => Ok(len),
            other => other.into_result().map(|_| 0),
        }
    }

    /// Write to the accessory channel
    pub fn aoa_write(&self, slot: u8, data: &[u8], timeout_ms: u32) -> Result<usize> {
        let ep_out = {
            let pool = self.aoa.borrow();
            pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?
                .ep_out
        };
        let (status, len) = self.bulk_out(ep_out, data, timeout_ms);
        status.into_result()?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessory_mode_detection() {
        assert!(is_accessory_mode(GOOGLE_VID, 0x2D00));
        assert!(is_accessory_mode(GOOGLE_VID, 0x2D01));
        assert!(!is_accessory_mode(GOOGLE_VID, 0x4EE7)); // plain MTP phone
        assert!(!is_accessory_mode(0x0403, 0x2D00));
    }
}
