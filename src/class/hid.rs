//! HID class driver (boot protocol)
//!
//! Binds to HID interfaces and polls their interrupt IN endpoint.
//! Boot-protocol keyboards and mice have fixed report layouts (USB HID
//! 1.11, Appendix B), so no report-descriptor parsing is needed; the
//! driver switches the device to boot protocol at load time and
//! exposes raw reports plus typed keyboard/mouse decoders.

use bitflags::bitflags;
use log::{info, warn};

use crate::class::ClassDriver;
use crate::descriptor::{self, InterfaceIter, InterfaceView};
use crate::enumeration::{Device, DriverId};
use crate::error::{Result, UsbError};
use crate::host::{EpConfig, UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::urb::{EpHandle, EpType, SetupPacket, UrbStatus};

/// Concurrent HID instances
pub const MAX_INSTANCES: usize = 2;

// HID class requests (HID 1.11 §7.2)
pub const REQ_GET_REPORT: u8 = 0x01;
pub const REQ_GET_IDLE: u8 = 0x02;
pub const REQ_GET_PROTOCOL: u8 = 0x03;
pub const REQ_SET_REPORT: u8 = 0x09;
pub const REQ_SET_IDLE: u8 = 0x0A;
pub const REQ_SET_PROTOCOL: u8 = 0x0B;

/// Report type field of GET/SET_REPORT wValue
pub const REPORT_TYPE_INPUT: u8 = 1;
pub const REPORT_TYPE_OUTPUT: u8 = 2;
pub const REPORT_TYPE_FEATURE: u8 = 3;

const PROTOCOL_BOOT: u16 = 0;

/// Largest input report the driver buffers
pub const MAX_REPORT_SIZE: usize = 8;

/// Boot-protocol device kind, from bInterfaceProtocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HidKind {
    Keyboard,
    Mouse,
    Other,
}

impl HidKind {
    fn from_protocol(protocol: u8) -> Self {
        match protocol {
            1 => Self::Keyboard,
            2 => Self::Mouse,
            _ => Self::Other,
        }
    }
}

bitflags! {
    /// Keyboard modifier byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyModifiers: u8 {
        const LEFT_CTRL = 1 << 0;
        const LEFT_SHIFT = 1 << 1;
        const LEFT_ALT = 1 << 2;
        const LEFT_GUI = 1 << 3;
        const RIGHT_CTRL = 1 << 4;
        const RIGHT_SHIFT = 1 << 5;
        const RIGHT_ALT = 1 << 6;
        const RIGHT_GUI = 1 << 7;
    }
}

/// Boot keyboard report: modifiers, reserved byte, six keycodes
#[derive(Debug, Clone, Copy)]
pub struct KeyboardReport {
    pub modifiers: KeyModifiers,
    keycodes: [u8; 6],
}

impl KeyboardReport {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            modifiers: KeyModifiers::from_bits_truncate(data[0]),
            keycodes: [data[2], data[3], data[4], data[5], data[6], data[7]],
        })
    }

    /// Pressed (non-zero) keycodes
    pub fn keys_pressed(&self) -> impl Iterator<Item = u8> + '_ {
        self.keycodes.iter().copied().filter(|&c| c != 0)
    }

    pub fn is_key_pressed(&self, keycode: u8) -> bool {
        keycode != 0 && self.keycodes.contains(&keycode)
    }

    /// Keycodes present in `self` but not in `prev` (new presses)
    pub fn newly_pressed<'a>(&'a self, prev: &'a Self) -> impl Iterator<Item = u8> + 'a {
        self.keys_pressed().filter(move |&c| !prev.is_key_pressed(c))
    }
}

bitflags! {
    /// Boot mouse button byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MouseButtons: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const MIDDLE = 1 << 2;
    }
}

/// Boot mouse report: buttons plus relative X/Y (and optional wheel)
#[derive(Debug, Clone, Copy)]
pub struct MouseReport {
    pub buttons: MouseButtons,
    pub x: i8,
    pub y: i8,
    pub wheel: i8,
}

impl MouseReport {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        Some(Self {
            buttons: MouseButtons::from_bits_truncate(data[0]),
            x: data[1] as i8,
            y: data[2] as i8,
            wheel: data.get(3).map(|&w| w as i8).unwrap_or(0),
        })
    }

    pub fn has_movement(&self) -> bool {
        self.x != 0 || self.y != 0 || self.wheel != 0
    }
}

struct HidInstance {
    ep0: EpHandle,
    int_ep: EpHandle,
    ifnum: u8,
    kind: HidKind,
    report_len: usize,
}

/// Host-owned arena of HID instances
pub struct HidPool {
    slots: [Option<HidInstance>; MAX_INSTANCES],
}

impl HidPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; MAX_INSTANCES],
        }
    }
}

fn find_hid_interface(desc: &[u8]) -> Option<(u8, u8, descriptor::EndpointDescriptor)> {
    let scan = |iface: &InterfaceView<'_>| {
        let d = iface.desc;
        if d.interface_class != 0x03 {
            return None;
        }
        // boot-protocol devices advertise subclass 1
        if d.interface_sub_class != 0x01 && d.interface_protocol == 0 {
            return None;
        }
        let ep = iface
            .endpoints()
            .map(|(ep, _)| ep)
            .find(|ep| ep.is_in() && EpType::from_attributes(ep.attributes) == EpType::Interrupt)?;
        Some((d.interface_number, d.interface_protocol, ep))
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

impl ClassDriver for HidPool {
    fn name(&self) -> &'static str {
        "HID"
    }

    fn matches(&self, class: u8, _subclass: u8, _protocol: u8) -> bool {
        class == 0x03
    }

    fn load(&mut self, host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let ep0 = dev.ep0?;
        let (ifnum, protocol, ep_desc) = find_hid_interface(desc)?;
        let kind = HidKind::from_protocol(protocol);

        let int_ep = host
            .ep_open(EpConfig::from_descriptor(
                &ep_desc,
                dev.address,
                dev.is_low_speed(),
            ))
            .ok()?;

        // fixed report layouts require boot protocol
        let req = SetupPacket::new(
            SetupPacket::OUT_CLASS_INTERFACE,
            REQ_SET_PROTOCOL,
            PROTOCOL_BOOT,
            ifnum as u16,
            0,
        );
        if host
            .control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS)
            .into_result()
            .is_err()
        {
            warn!("hid: SET_PROTOCOL(boot) failed");
        }

        // idle rate 0: report only on change
        let req = SetupPacket::new(
            SetupPacket::OUT_CLASS_INTERFACE,
            REQ_SET_IDLE,
            0,
            ifnum as u16,
            0,
        );
        let _ = host.control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS);

        info!("hid: bound {:?} on interface {}", kind, ifnum);
        self.slots[slot] = Some(HidInstance {
            ep0,
            int_ep,
            ifnum,
            kind,
            report_len: (ep_desc.max_packet_size as usize).min(MAX_REPORT_SIZE),
        });
        Some(DriverId::Hid(slot as u8))
    }

    fn unload(&mut self, host: &UsbHost, id: DriverId) {
        let DriverId::Hid(slot) = id else { return };
        if let Some(inst) = self.slots[slot as usize].take() {
            host.ep_close(inst.int_ep);
        }
    }
}

impl UsbHost {
    /// Kind of the HID instance in `slot`, if loaded
    pub fn hid_kind(&self, slot: u8) -> Option<HidKind> {
        self.hid.borrow().slots[slot as usize].as_ref().map(|i| i.kind)
    }

    /// Poll the interrupt endpoint for a new input report. `Ok(None)`
    /// means the device NAKed the interval (no change).
    pub fn hid_poll_report(
        &self,
        slot: u8,
        buf: &mut [u8; MAX_REPORT_SIZE],
    ) -> Result<Option<usize>> {
        let (int_ep, report_len) = {
            let pool = self.hid.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.int_ep, inst.report_len)
        };
        let (status, len) = self.bulk_in(int_ep, &mut buf[..report_len], 50);
        match status {
            UrbStatus::Ok => Ok(Some(len)),
            UrbStatus::Timeout => Ok(None),
            other => other.into_result().map(|_| None),
        }
    }

    /// GET_REPORT over the control pipe
    pub fn hid_get_report(
        &self,
        slot: u8,
        report_type: u8,
        report_id: u8,
        buf: &mut [u8],
    ) -> Result<usize> {
        let (ep0, ifnum) = {
            let pool = self.hid.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep0, inst.ifnum)
        };
        let req = SetupPacket::new(
            SetupPacket::IN_CLASS_INTERFACE,
            REQ_GET_REPORT,
            ((report_type as u16) << 8) | report_id as u16,
            ifnum as u16,
            buf.len() as u16,
        );
        let (status, len) = self.control_request(ep0, req, buf, CONTROL_REQUEST_TIMEOUT_MS);
        status.into_result()?;
        Ok(len)
    }

    /// SET_REPORT over the control pipe (e.g. keyboard LEDs)
    pub fn hid_set_report(
        &self,
        slot: u8,
        report_type: u8,
        report_id: u8,
        data: &[u8],
    ) -> Result<()> {
        let (ep0, ifnum) = {
            let pool = self.hid.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep0, inst.ifnum)
        };
        let req = SetupPacket::new(
            SetupPacket::OUT_CLASS_INTERFACE,
            REQ_SET_REPORT,
            ((report_type as u16) << 8) | report_id as u16,
            ifnum as u16,
            data.len() as u16,
        );
        let (status, _) = self.control_out(ep0, req, data, CONTROL_REQUEST_TIMEOUT_MS);
        status.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_report_decode_and_diff() {
        // 'A' (0x04) held, shift down
        let prev = KeyboardReport::parse(&[0x02, 0, 0x04, 0, 0, 0, 0, 0]).unwrap();
        assert!(prev.modifiers.contains(KeyModifiers::LEFT_SHIFT));
        assert!(prev.is_key_pressed(0x04));

        // 'A' still held, 'B' (0x05) newly pressed
        let next = KeyboardReport::parse(&[0x02, 0, 0x04, 0x05, 0, 0, 0, 0]).unwrap();
        let new: heapless::Vec<u8, 6> = next.newly_pressed(&prev).collect();
        assert_eq!(&new[..], &[0x05]);

        assert!(KeyboardReport::parse(&[0; 4]).is_none());
    }

    #[test]
    fn mouse_report_decode() {
        let r = MouseReport::parse(&[0x01, 0xFF, 0x02, 0xFE]).unwrap();
        assert!(r.buttons.contains(MouseButtons::LEFT));
        assert_eq!(r.x, -1);
        assert_eq!(r.y, 2);
        assert_eq!(r.wheel, -2);
        assert!(r.has_movement());

        // 3-byte boot report has no wheel
        let r = MouseReport::parse(&[0x00, 0x00, 0x00]).unwrap();
        assert!(!r.has_movement());
    }

    #[test]
    fn kind_from_interface_protocol() {
        assert_eq!(HidKind::from_protocol(1), HidKind::Keyboard);
        assert_eq!(HidKind::from_protocol(2), HidKind::Mouse);
        assert_eq!(HidKind::from_protocol(0), HidKind::Other);
    }
}
