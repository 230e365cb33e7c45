//! USB descriptor views and configuration-descriptor iteration
//!
//! The iterators walk a raw configuration-descriptor blob without
//! copying: configuration → interfaces (with optional Interface
//! Association grouping) → endpoints → trailing class-specific
//! descriptors. This is the only bounds-checking layer between a
//! misbehaving device and the rest of the stack, so every cursor
//! advance validates `bLength` against the remaining bytes and the
//! iterator goes dead (yields `None`) on the first inconsistency.

use crate::error::{Result, UsbError};

/// Standard descriptor type codes
pub mod desc_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const IAD: u8 = 0x0B;
    pub const HUB: u8 = 0x29;
}

pub const DEVICE_DESC_SIZE: usize = 18;
pub const CONFIG_DESC_SIZE: usize = 9;
pub const INTERFACE_DESC_SIZE: usize = 9;
pub const ENDPOINT_DESC_SIZE: usize = 7;
pub const IAD_DESC_SIZE: usize = 8;
pub const STRING_DESC_HEADER_SIZE: usize = 2;

#[inline]
fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

/// USB device descriptor
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse the full 18-byte device descriptor
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DEVICE_DESC_SIZE
            || data[0] as usize != DEVICE_DESC_SIZE
            || data[1] != desc_type::DEVICE
        {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            bcd_usb: le16(data, 2),
            device_class: data[4],
            device_sub_class: data[5],
            device_protocol: data[6],
            max_packet_size0: data[7],
            id_vendor: le16(data, 8),
            id_product: le16(data, 10),
            bcd_device: le16(data, 12),
            i_manufacturer: data[14],
            i_product: data[15],
            i_serial_number: data[16],
            num_configurations: data[17],
        })
    }

    /// Parse only the header portion read during early enumeration.
    /// The first 8 bytes are enough to learn `bMaxPacketSize0`.
    pub fn max_packet_size0_from_prefix(data: &[u8]) -> Result<u8> {
        if data.len() < 8 || data[0] as usize != DEVICE_DESC_SIZE || data[1] != desc_type::DEVICE {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(data[7])
    }
}

/// Configuration descriptor header (9 bytes, without the trailing bundle)
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CONFIG_DESC_SIZE
            || (data[0] as usize) < CONFIG_DESC_SIZE
            || data[1] != desc_type::CONFIGURATION
        {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            total_length: le16(data, 2),
            num_interfaces: data[4],
            configuration_value: data[5],
            i_configuration: data[6],
            attributes: data[7],
            max_power: data[8],
        })
    }
}

/// Interface descriptor
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INTERFACE_DESC_SIZE
            || (data[0] as usize) < INTERFACE_DESC_SIZE
            || data[1] != desc_type::INTERFACE
        {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            interface_number: data[2],
            alternate_setting: data[3],
            num_endpoints: data[4],
            interface_class: data[5],
            interface_sub_class: data[6],
            interface_protocol: data[7],
            i_interface: data[8],
        })
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ENDPOINT_DESC_SIZE
            || (data[0] as usize) < ENDPOINT_DESC_SIZE
            || data[1] != desc_type::ENDPOINT
        {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            endpoint_address: data[2],
            attributes: data[3],
            max_packet_size: le16(data, 4),
            interval: data[6],
        })
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    /// True for IN (device-to-host) endpoints
    pub fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }

    /// Transfer type from `bmAttributes` bits 1:0
    pub fn transfer_type(&self) -> u8 {
        self.attributes & 0x03
    }
}

/// Interface Association Descriptor
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IadDescriptor {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_sub_class: u8,
    pub function_protocol: u8,
    pub i_function: u8,
}

impl IadDescriptor {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IAD_DESC_SIZE
            || (data[0] as usize) < IAD_DESC_SIZE
            || data[1] != desc_type::IAD
        {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            first_interface: data[2],
            interface_count: data[3],
            function_class: data[4],
            function_sub_class: data[5],
            function_protocol: data[6],
            i_function: data[7],
        })
    }
}

/// Raw sub-descriptor view: type plus the whole descriptor bytes
#[derive(Debug, Clone, Copy)]
pub struct RawDescriptor<'a> {
    pub descriptor_type: u8,
    pub bytes: &'a [u8],
}

/// Split off the first descriptor of `buf`, validating its length field.
///
/// Returns the descriptor bytes and the remaining tail, or `None` when
/// the buffer is exhausted or inconsistent (`bLength` of 0 or 1, or a
/// `bLength` past the end of the buffer).
fn split_first(buf: &[u8]) -> Option<(RawDescriptor<'_>, &[u8])> {
    if buf.len() < 2 {
        return None;
    }
    let len = buf[0] as usize;
    if len < 2 || len > buf.len() {
        return None;
    }
    let (head, tail) = buf.split_at(len);
    Some((
        RawDescriptor {
            descriptor_type: head[1],
            bytes: head,
        },
        tail,
    ))
}

/// Cursor over every descriptor in a configuration bundle, in order.
///
/// Goes permanently dead on malformed input.
#[derive(Clone)]
pub struct DescriptorIter<'a> {
    rest: &'a [u8],
    dead: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            rest: buf,
            dead: false,
        }
    }

    /// Bytes not yet consumed (the upcoming descriptor onwards)
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }

    /// True when iteration ended because of malformed input rather than
    /// normal exhaustion.
    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = RawDescriptor<'a>;

    fn next(&mut self) -> Option<RawDescriptor<'a>> {
        if self.dead {
            return None;
        }
        if self.rest.is_empty() {
            return None;
        }
        match split_first(self.rest) {
            Some((desc, tail)) => {
                self.rest = tail;
                Some(desc)
            }
            None => {
                self.dead = true;
                self.rest = &[];
                None
            }
        }
    }
}

/// One interface with its association (if any) and its sub-descriptors
#[derive(Clone)]
pub struct InterfaceView<'a> {
    pub desc: InterfaceDescriptor,
    /// IAD this interface belongs to, if the configuration groups it
    pub iad: Option<IadDescriptor>,
    /// Interface descriptor and everything after it to the end of the
    /// bundle; handed to class drivers so they can run their own
    /// iteration over their slice.
    pub raw: &'a [u8],
    /// Everything following the interface descriptor up to the next
    /// interface (or IAD, or end): endpoints and class-specific blocks
    body: &'a [u8],
}

impl<'a> InterfaceView<'a> {
    /// View over a slice that starts at an interface descriptor (the
    /// shape class drivers receive from per-interface dispatch).
    pub fn from_interface_slice(desc: &'a [u8]) -> Option<Self> {
        let d = InterfaceDescriptor::from_bytes(desc).ok()?;
        let head = desc[0] as usize;
        if head > desc.len() {
            return None;
        }
        let after = &desc[head..];
        let body = &after[..boundary_offset(after)];
        Some(Self {
            desc: d,
            iad: None,
            raw: desc,
            body,
        })
    }

    /// Endpoints of this interface, in declaration order
    pub fn endpoints(&self) -> EndpointIter<'a> {
        EndpointIter {
            inner: DescriptorIter::new(self.body),
        }
    }

    /// Class-specific descriptors directly trailing the interface
    /// descriptor (before the first endpoint)
    pub fn class_specific(&self) -> ClassSpecificIter<'a> {
        ClassSpecificIter {
            inner: DescriptorIter::new(self.body),
        }
    }
}

/// Iterates interfaces of a configuration bundle, tracking IAD grouping
pub struct InterfaceIter<'a> {
    inner: DescriptorIter<'a>,
    current_iad: Option<(IadDescriptor, u8)>, // (iad, interfaces left in group)
}

impl<'a> InterfaceIter<'a> {
    /// Walk the bundle starting after the configuration header.
    ///
    /// Fails if the buffer does not begin with a valid configuration
    /// descriptor.
    pub fn new(config_bundle: &'a [u8]) -> Result<(ConfigDescriptor, Self)> {
        let cfg = ConfigDescriptor::from_bytes(config_bundle)?;
        let (first, _) = split_first(config_bundle).ok_or(UsbError::InvalidDescriptor)?;
        if first.descriptor_type != desc_type::CONFIGURATION {
            return Err(UsbError::InvalidDescriptor);
        }
        let body_len = (cfg.total_length as usize)
            .min(config_bundle.len())
            .saturating_sub(first.bytes.len());
        let body = &config_bundle[first.bytes.len()..first.bytes.len() + body_len];
        Ok((
            cfg,
            Self {
                inner: DescriptorIter::new(body),
                current_iad: None,
            },
        ))
    }
}

impl<'a> Iterator for InterfaceIter<'a> {
    type Item = InterfaceView<'a>;

    fn next(&mut self) -> Option<InterfaceView<'a>> {
        loop {
            let rest_before = self.inner.remaining();
            let desc = self.inner.next()?;
            match desc.descriptor_type {
                desc_type::IAD => {
                    let iad = IadDescriptor::from_bytes(desc.bytes).ok()?;
                    self.current_iad = Some((iad, iad.interface_count));
                }
                desc_type::INTERFACE => {
                    let ifdesc = match InterfaceDescriptor::from_bytes(desc.bytes) {
                        Ok(d) => d,
                        Err(_) => return None,
                    };
                    // Alternate settings stay inside the same IAD group;
                    // only alt 0 consumes a group slot.
                    let iad = if ifdesc.alternate_setting == 0 {
                        match self.current_iad.take() {
                            Some((iad, left)) if left > 0 => {
                                self.current_iad = Some((iad, left - 1));
                                Some(iad)
                            }
                            _ => None,
                        }
                    } else {
                        self.current_iad.map(|(iad, _)| iad)
                    };
                    // Body: from after this descriptor to the next
                    // interface/IAD boundary.
                    let after = self.inner.remaining();
                    let body_len = boundary_offset(after);
                    let body = &after[..body_len];
                    // skip the body so the next call lands on the next
                    // interface
                    self.inner = DescriptorIter::new(&after[body_len..]);
                    return Some(InterfaceView {
                        desc: ifdesc,
                        iad,
                        raw: rest_before,
                        body,
                    });
                }
                _ => {
                    // stray descriptor between config header and first
                    // interface (e.g. OTG descriptor); skip
                }
            }
        }
    }
}

/// Byte offset of the next interface or IAD descriptor in `buf`, or
/// `buf.len()` when none follows. Stops early (fail closed) on a
/// malformed length field.
fn boundary_offset(buf: &[u8]) -> usize {
    let mut it = DescriptorIter::new(buf);
    let mut offset = 0;
    while let Some(d) = it.next() {
        if matches!(d.descriptor_type, desc_type::INTERFACE | desc_type::IAD) {
            return offset;
        }
        offset += d.bytes.len();
    }
    offset
}

/// Iterates interface views over a slice that begins at (or near) an
/// interface descriptor — the shape handed to class drivers by
/// per-interface dispatch, which runs to the end of the configuration
/// bundle.
pub struct InterfaceSliceIter<'a> {
    rest: &'a [u8],
}

impl<'a> InterfaceSliceIter<'a> {
    pub fn new(desc: &'a [u8]) -> Self {
        Self { rest: desc }
    }
}

impl<'a> Iterator for InterfaceSliceIter<'a> {
    type Item = InterfaceView<'a>;

    fn next(&mut self) -> Option<InterfaceView<'a>> {
        loop {
            if self.rest.len() < 2 {
                return None;
            }
            let len = self.rest[0] as usize;
            if len < 2 || len > self.rest.len() {
                return None;
            }
            if self.rest[1] == desc_type::INTERFACE {
                let view = InterfaceView::from_interface_slice(self.rest)?;
                let consumed = len + view.body.len();
                self.rest = &self.rest[consumed..];
                return Some(view);
            }
            self.rest = &self.rest[len..];
        }
    }
}

/// Endpoints within one interface body
pub struct EndpointIter<'a> {
    inner: DescriptorIter<'a>,
}

impl<'a> Iterator for EndpointIter<'a> {
    type Item = (EndpointDescriptor, EndpointCsView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let desc = self.inner.next()?;
            if desc.descriptor_type == desc_type::ENDPOINT {
                let ep = EndpointDescriptor::from_bytes(desc.bytes).ok()?;
                // class-specific descriptors trail the endpoint up to
                // the next endpoint descriptor
                let after = self.inner.remaining();
                let cs_len = ep_boundary_offset(after);
                let cs = EndpointCsView {
                    bytes: &after[..cs_len],
                };
                self.inner = DescriptorIter::new(&after[cs_len..]);
                return Some((ep, cs));
            }
            // class-specific or other descriptor before the first
            // endpoint; skip
        }
    }
}

fn ep_boundary_offset(buf: &[u8]) -> usize {
    let mut it = DescriptorIter::new(buf);
    let mut offset = 0;
    while let Some(d) = it.next() {
        if d.descriptor_type == desc_type::ENDPOINT {
            return offset;
        }
        offset += d.bytes.len();
    }
    offset
}

/// Class-specific descriptors trailing an endpoint descriptor
#[derive(Clone, Copy)]
pub struct EndpointCsView<'a> {
    bytes: &'a [u8],
}

impl<'a> EndpointCsView<'a> {
    pub fn iter(&self) -> DescriptorIter<'a> {
        DescriptorIter::new(self.bytes)
    }
}

/// Class-specific descriptors directly trailing an interface descriptor
pub struct ClassSpecificIter<'a> {
    inner: DescriptorIter<'a>,
}

impl<'a> Iterator for ClassSpecificIter<'a> {
    type Item = RawDescriptor<'a>;

    fn next(&mut self) -> Option<RawDescriptor<'a>> {
        let desc = self.inner.next()?;
        if desc.descriptor_type == desc_type::ENDPOINT {
            // endpoints terminate the interface-level CS block
            self.inner = DescriptorIter::new(&[]);
            return None;
        }
        Some(desc)
    }
}

/// Extract an ASCII rendering of a UTF-16LE string descriptor into
/// `dest`, returning the number of bytes written. Non-ASCII code units
/// are replaced with `?`.
pub fn extract_string(desc: &[u8], dest: &mut [u8]) -> Result<usize> {
    if desc.len() < STRING_DESC_HEADER_SIZE || desc[1] != desc_type::STRING {
        return Err(UsbError::InvalidDescriptor);
    }
    let blen = desc[0] as usize;
    if blen > desc.len() || blen < STRING_DESC_HEADER_SIZE || blen % 2 != 0 {
        return Err(UsbError::InvalidDescriptor);
    }
    let mut written = 0;
    let mut i = STRING_DESC_HEADER_SIZE;
    while i + 1 < blen && written < dest.len() {
        let unit = le16(desc, i);
        dest[written] = if unit < 0x80 { unit as u8 } else { b'?' };
        written += 1;
        i += 2;
    }
    Ok(written)
}

/// Read the first language ID from a string descriptor index 0 payload
pub fn lang_id0(desc: &[u8]) -> Result<u16> {
    if desc.len() < 4 || desc[1] != desc_type::STRING || desc[0] < 4 {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(le16(desc, 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    // config with one interface, two bulk endpoints, one CS descriptor
    // after the interface and one after the first endpoint
    fn msd_like_config() -> [u8; 9 + 9 + 3 + 7 + 3 + 7] {
        let mut buf = [0u8; 38];
        let total = buf.len() as u16;
        buf[..9].copy_from_slice(&[9, 0x02, total as u8, (total >> 8) as u8, 1, 1, 0, 0x80, 50]);
        buf[9..18].copy_from_slice(&[9, 0x04, 0, 0, 2, 0x08, 0x06, 0x50, 0]);
        buf[18..21].copy_from_slice(&[3, 0x44, 0xAA]); // class-specific
        buf[21..28].copy_from_slice(&[7, 0x05, 0x81, 0x02, 0x00, 0x02, 0]); // bulk IN 512
        buf[28..31].copy_from_slice(&[3, 0x25, 0xBB]); // endpoint CS
        buf[31..38].copy_from_slice(&[7, 0x05, 0x02, 0x02, 0x00, 0x02, 0]); // bulk OUT 512
        buf
    }

    #[test]
    fn walks_interfaces_endpoints_and_cs_in_order() {
        let buf = msd_like_config();
        let (cfg, mut ifs) = InterfaceIter::new(&buf).unwrap();
        assert_eq!(cfg.num_interfaces, 1);
        assert_eq!(cfg.total_length as usize, buf.len());

        let iface = ifs.next().unwrap();
        assert_eq!(iface.desc.interface_class, 0x08);
        assert_eq!(iface.desc.num_endpoints, 2);
        assert!(iface.iad.is_none());
        assert!(ifs.next().is_none());

        let cs: heapless::Vec<u8, 4> = iface.class_specific().map(|d| d.descriptor_type).collect();
        assert_eq!(&cs[..], &[0x44]);

        let mut eps = iface.endpoints();
        let (ep_in, cs_in) = eps.next().unwrap();
        assert_eq!(ep_in.endpoint_address, 0x81);
        assert!(ep_in.is_in());
        assert_eq!(ep_in.max_packet_size, 512);
        let trailing: heapless::Vec<u8, 4> = cs_in.iter().map(|d| d.descriptor_type).collect();
        assert_eq!(&trailing[..], &[0x25]);

        let (ep_out, cs_out) = eps.next().unwrap();
        assert_eq!(ep_out.endpoint_address, 0x02);
        assert!(!ep_out.is_in());
        assert_eq!(cs_out.iter().count(), 0);
        assert!(eps.next().is_none());
    }

    #[test]
    fn iad_groups_interfaces() {
        let mut buf = heapless::Vec::<u8, 64>::new();
        buf.extend_from_slice(&[9, 0x02, 0, 0, 3, 1, 0, 0x80, 50]).unwrap();
        buf.extend_from_slice(&[8, 0x0B, 0, 2, 0x0E, 0x03, 0x00, 0]).unwrap(); // IAD: if 0..1
        buf.extend_from_slice(&[9, 0x04, 0, 0, 0, 0x0E, 0x01, 0x00, 0]).unwrap();
        buf.extend_from_slice(&[9, 0x04, 1, 0, 0, 0x0E, 0x02, 0x00, 0]).unwrap();
        buf.extend_from_slice(&[9, 0x04, 2, 0, 0, 0xFF, 0x00, 0x00, 0]).unwrap();
        let total = buf.len() as u16;
        buf[2] = total as u8;
        buf[3] = (total >> 8) as u8;

        let (_, ifs) = InterfaceIter::new(&buf).unwrap();
        let grouped: heapless::Vec<bool, 4> = ifs.map(|i| i.iad.is_some()).collect();
        assert_eq!(&grouped[..], &[true, true, false]);
    }

    #[test]
    fn zero_blength_fails_closed() {
        let mut buf = msd_like_config();
        buf[21] = 0; // first endpoint descriptor bLength = 0
        let (_, mut ifs) = InterfaceIter::new(&buf).unwrap();
        let iface = ifs.next().unwrap();
        // iteration stops without panicking or reading past the buffer
        assert_eq!(iface.endpoints().count(), 0);
    }

    #[test]
    fn blength_past_end_fails_closed() {
        let mut buf = msd_like_config();
        buf[31] = 200; // last endpoint claims 200 bytes
        let (_, mut ifs) = InterfaceIter::new(&buf).unwrap();
        let iface = ifs.next().unwrap();
        assert_eq!(iface.endpoints().count(), 1); // only the intact one
    }

    #[test]
    fn truncated_buffer_fails_closed() {
        let buf = msd_like_config();
        for cut in 0..buf.len() {
            // never panics, never yields garbage past the cut
            if let Ok((_, ifs)) = InterfaceIter::new(&buf[..cut]) {
                for iface in ifs {
                    for (_ep, cs) in iface.endpoints() {
                        let _ = cs.iter().count();
                    }
                }
            }
        }
    }

    #[test]
    fn config_header_type_mismatch_rejected() {
        let mut buf = msd_like_config();
        buf[1] = 0x04;
        assert!(InterfaceIter::new(&buf).is_err());
    }

    #[test]
    fn device_descriptor_roundtrip() {
        let raw = [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x83, 0x04, 0x40, 0x00, 0x00, 0x01,
            0x01, 0x02, 0x03, 0x01,
        ];
        let d = DeviceDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(d.max_packet_size0, 64);
        assert_eq!(d.id_vendor, 0x0483);
        assert_eq!(d.num_configurations, 1);
        assert_eq!(DeviceDescriptor::max_packet_size0_from_prefix(&raw[..8]).unwrap(), 64);
    }

    #[test]
    fn string_extraction() {
        // "USB" in UTF-16LE plus a non-ASCII unit
        let desc = [10, 0x03, b'U', 0, b'S', 0, b'B', 0, 0x42, 0x26];
        let mut out = [0u8; 8];
        let n = extract_string(&desc, &mut out).unwrap();
        assert_eq!(&out[..n], b"USB?");

        let lang = [4, 0x03, 0x09, 0x04];
        assert_eq!(lang_id0(&lang).unwrap(), 0x0409);

        assert!(extract_string(&[1, 0x03], &mut out).is_err());
        assert!(extract_string(&[5, 0x03, 0, 0, 0], &mut out).is_err()); // odd length
    }
}
