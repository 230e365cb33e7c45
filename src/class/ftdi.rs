//! FTDI USB-serial vendor driver
//!
//! Binds to FTDI's vendor-specific interfaces (VID 0x0403) and exposes
//! a byte-stream channel over the bulk pipes. Configuration goes
//! through vendor control requests; the baud-rate divisor encoding
//! differs per chip generation (AM's 2-bit sub-divisor vs the 3-bit
//! encoding of BM and later, and the 120 MHz fast clock on H parts).

use log::{info, warn};

use crate::class::ClassDriver;
use crate::descriptor::{self, InterfaceIter, InterfaceView};
use crate::enumeration::{Device, DriverId};
use crate::error::{Result, UsbError};
use crate::host::{EpConfig, UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::urb::{EpHandle, EpType, SetupPacket, UrbStatus};

/// Concurrent FTDI port instances
pub const MAX_INSTANCES: usize = 2;

pub const FTDI_VID: u16 = 0x0403;

// Vendor requests
pub const REQ_RESET: u8 = 0x00;
pub const REQ_MODEM_CTRL: u8 = 0x01;
pub const REQ_SET_FLOW_CTRL: u8 = 0x02;
pub const REQ_SET_BAUDRATE: u8 = 0x03;
pub const REQ_SET_DATA: u8 = 0x04;

pub const RESET_SIO: u16 = 0;
pub const RESET_PURGE_RX: u16 = 1;
pub const RESET_PURGE_TX: u16 = 2;

/// Chip generation, detected from bcdDevice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipType {
    /// FT232AM: 2-bit sub-integer divisor
    A,
    /// FT232BM/R, FT2232C: 3-bit sub-integer divisor
    B,
    /// FT2232H/FT4232H/FT232H: 3-bit sub-divisor plus 120 MHz fast clock
    H,
}

impl ChipType {
    pub fn from_bcd_device(bcd: u16) -> Self {
        match bcd {
            0x0200 => Self::A,
            0x0700 | 0x0800 | 0x0900 => Self::H,
            _ => Self::B,
        }
    }
}

/// Parity for SET_DATA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Stop bits for SET_DATA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One = 0,
    OneAndHalf = 1,
    Two = 2,
}

/// Flow control for SET_FLOW_CTRL (high byte of wIndex)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowControl {
    None = 0x00,
    RtsCts = 0x01,
    DtrDsr = 0x02,
    XonXoff = 0x04,
}

/// Serial line configuration
#[derive(Debug, Clone, Copy)]
pub struct LineConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow: FlowControl,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow: FlowControl::None,
        }
    }
}

/// Divisor encoding: (wValue, wIndex) for SET_BAUDRATE.
///
/// The divisor is expressed in eighths of the 3 MHz base divisor
/// (48 MHz / 16). Bits 14-15 of wValue carry the low sub-divisor bits,
/// the third sub-bit travels in wIndex bit 0. H-generation chips can
/// run from the 120 MHz clock (divisor base 12 MHz, wIndex bit 9) for
/// rates the legacy clock cannot reach.
pub fn encode_divisor(baud: u32, chip: ChipType) -> (u16, u16) {
    // exact shortcuts on the legacy clock
    if chip != ChipType::A {
        if baud == 3_000_000 {
            return (0, 0);
        }
        if baud == 2_000_000 {
            return (1, 0);
        }
    }

    if chip == ChipType::H && baud > 187_500 {
        // fast clock: divisor in eighths of 12 MHz
        let div8 = (8 * 12_000_000u32 + baud / 2) / baud;
        const FRAC: [u16; 8] = [0, 3, 2, 4, 1, 5, 6, 7];
        let frac = FRAC[(div8 & 7) as usize];
        let value = ((div8 >> 3) as u16 & 0x3FFF) | ((frac & 3) << 14);
        let index = ((frac >> 2) & 1) | 0x0200;
        return (value, index);
    }

    let div8 = (8 * 3_000_000u32 + baud / 2) / baud;
    match chip {
        ChipType::A => {
            // AM only encodes 0, 1/8, 1/4 and 1/2; round to the nearest
            let (int_part, code) = match div8 & 7 {
                0 => (div8 >> 3, 0u16),
                1 => (div8 >> 3, 3),
                2 | 3 => (div8 >> 3, 2),
                4 | 5 | 6 => (div8 >> 3, 1),
                _ => ((div8 >> 3) + 1, 0),
            };
            ((int_part as u16 & 0x3FFF) | (code << 14), 0)
        }
        _ => {
            const FRAC: [u16; 8] = [0, 3, 2, 4, 1, 5, 6, 7];
            let frac = FRAC[(div8 & 7) as usize];
            let value = ((div8 >> 3) as u16 & 0x3FFF) | ((frac & 3) << 14);
            let index = (frac >> 2) & 1;
            (value, index)
        }
    }
}

struct FtdiInstance {
    ep0: EpHandle,
    ep_in: EpHandle,
    ep_out: EpHandle,
    ifnum: u8,
    chip: ChipType,
    in_mps: u16,
}

/// Host-owned arena of FTDI port instances
pub struct FtdiPool {
    slots: [Option<FtdiInstance>; MAX_INSTANCES],
}

impl FtdiPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; MAX_INSTANCES],
        }
    }
}

fn find_bulk_pair(
    desc: &[u8],
) -> Option<(u8, descriptor::EndpointDescriptor, descriptor::EndpointDescriptor)> {
    let scan = |iface: &InterfaceView<'_>| {
        if iface.desc.interface_class != 0xFF {
            return None;
        }
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
        Some((iface.desc.interface_number, ep_in?, ep_out?))
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

impl ClassDriver for FtdiPool {
    fn name(&self) -> &'static str {
        "FTDI"
    }

    fn matches(&self, class: u8, _subclass: u8, _protocol: u8) -> bool {
        class == 0xFF
    }

    fn load(&mut self, host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId> {
        let devdesc = dev.dev_desc?;
        if devdesc.id_vendor != FTDI_VID {
            return None;
        }
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let ep0 = dev.ep0?;
        let (ifnum, in_desc, out_desc) = find_bulk_pair(desc)?;
        let chip = ChipType::from_bcd_device(devdesc.bcd_device);
        info!("ftdi: chip type {:?} (bcd {:04x})", chip, devdesc.bcd_device);

        let low_speed = dev.is_low_speed();
        let ep_in = host
            .ep_open(EpConfig::from_descriptor(&in_desc, dev.address, low_speed))
            .ok()?;
        let ep_out = match host.ep_open(EpConfig::from_descriptor(&out_desc, dev.address, low_speed))
        {
            Ok(ep) => ep,
            Err(_) => {
                host.ep_close(ep_in);
                return None;
            }
        };

        self.slots[slot] = Some(FtdiInstance {
            ep0,
            ep_in,
            ep_out,
            ifnum,
            chip,
            in_mps: in_desc.max_packet_size,
        });

        if set_line_raw(host, ep0, ifnum, chip, LineConfig::default()).is_err() {
            warn!("ftdi: initial line configuration failed");
        }

        Some(DriverId::Ftdi(slot as u8))
    }

    fn unload(&mut self, host: &UsbHost, id: DriverId) {
        let DriverId::Ftdi(slot) = id else { return };
        if let Some(inst) = self.slots[slot as usize].take() {
            host.ep_close(inst.ep_in);
            host.ep_close(inst.ep_out);
        }
    }
}

fn vendor_out(
    host: &UsbHost,
    ep0: EpHandle,
    request: u8,
    value: u16,
    index: u16,
) -> Result<()> {
    let req = SetupPacket::new(SetupPacket::OUT_VENDOR_DEVICE, request, value, index, 0);
    host.control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS)
        .into_result()
}

fn set_line_raw(
    host: &UsbHost,
    ep0: EpHandle,
    ifnum: u8,
    chip: ChipType,
    cfg: LineConfig,
) -> Result<()> {
    // multi-port chips address ports via the wIndex low byte, 1-based
    let port = ifnum as u16 + 1;

    let (value, index) = encode_divisor(cfg.baud, chip);
    vendor_out(host, ep0, REQ_SET_BAUDRATE, value, index | port)?;

    let framing =
        cfg.data_bits as u16 | ((cfg.parity as u16) << 8) | ((cfg.stop_bits as u16) << 11);
    vendor_out(host, ep0, REQ_SET_DATA, framing, port)?;

    vendor_out(
        host,
        ep0,
        REQ_SET_FLOW_CTRL,
        0,
        ((cfg.flow as u16) << 8) | port,
    )
}

impl UsbHost {
    /// Reset the port and purge both FIFOs
    pub fn ftdi_reset(&self, slot: u8) -> Result<()> {
        let (ep0, ifnum) = {
            let pool = self.ftdi.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep0, inst.ifnum)
        };
        vendor_out(self, ep0, REQ_RESET, RESET_SIO, ifnum as u16 + 1)
    }

    /// Program baud rate, framing and flow control
    pub fn ftdi_set_line(&self, slot: u8, cfg: LineConfig) -> Result<()> {
        let (ep0, ifnum, chip) = {
            let pool = self.ftdi.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep0, inst.ifnum, inst.chip)
        };
        set_line_raw(self, ep0, ifnum, chip, cfg)
    }

    /// Write bytes to the port
    pub fn ftdi_write(&self, slot: u8, data: &[u8], timeout_ms: u32) -> Result<usize> {
        let ep_out = {
            let pool = self.ftdi.borrow();
            pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?
                .ep_out
        };
        let (status, len) = self.bulk_out(ep_out, data, timeout_ms);
        status.into_result()?;
        Ok(len)
    }

    /// Read bytes from the port. The chip prepends two modem-status
    /// bytes to every packet; they are stripped here.
    pub fn ftdi_read(&self, slot: u8, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let (ep_in, in_mps) = {
            let pool = self.ftdi.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep_in, inst.in_mps)
        };
        let mut packet = [0u8; 512];
        let want = (buf.len() + 2).min(in_mps as usize).min(packet.len());
        let (status, len) = self.bulk_in(ep_in, &mut packet[..want], timeout_ms);
        status.into_result()?;
        if len <= 2 {
            return Ok(0);
        }
        let payload = len - 2;
        buf[..payload].copy_from_slice(&packet[2..len]);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_detection_from_bcd() {
        assert_eq!(ChipType::from_bcd_device(0x0200), ChipType::A);
        assert_eq!(ChipType::from_bcd_device(0x0400), ChipType::B);
        assert_eq!(ChipType::from_bcd_device(0x0600), ChipType::B);
        assert_eq!(ChipType::from_bcd_device(0x0700), ChipType::H);
        assert_eq!(ChipType::from_bcd_device(0x0900), ChipType::H);
    }

    #[test]
    fn divisor_encoding_known_values() {
        // canonical BM-generation vectors
        assert_eq!(encode_divisor(115_200, ChipType::B), (0x001A, 0));
        assert_eq!(encode_divisor(9_600, ChipType::B), (0x4138, 0));
        assert_eq!(encode_divisor(1_200, ChipType::B), (0x09C4, 0));
        // exact-rate shortcuts
        assert_eq!(encode_divisor(3_000_000, ChipType::B), (0, 0));
        assert_eq!(encode_divisor(2_000_000, ChipType::B), (1, 0));
    }

    #[test]
    fn divisor_encoding_h_fast_clock() {
        // above 187.5 kbaud the H parts switch to the 120 MHz clock
        let (_value, index) = encode_divisor(921_600, ChipType::H);
        assert_ne!(index & 0x0200, 0);
        // low rates stay on the legacy clock
        let (value, index) = encode_divisor(9_600, ChipType::H);
        assert_eq!(index & 0x0200, 0);
        assert_eq!(value, 0x4138);
    }

    #[test]
    fn am_sub_divisor_is_two_bits() {
        // 3M/9600 = 312.5 -> AM encodes the half step as code 1
        let (value, index) = encode_divisor(9_600, ChipType::A);
        assert_eq!(index, 0);
        assert_eq!(value & 0x3FFF, 312);
        assert_eq!(value >> 14, 1);
    }
}
