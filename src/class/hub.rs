//! External hub class driver
//!
//! A hub is a class driver that owns downstream ports. Its interrupt
//! IN endpoint delivers a status-change bitmap (bit 0 = hub, bit N =
//! port N); each flagged port is run through the same port state
//! machine as the root port, with hub class requests as the backend.

use heapless::Vec;
use log::{info, warn};

use crate::class::ClassDriver;
use crate::descriptor::{self, InterfaceIter, InterfaceView};
use crate::enumeration::{Device, DriverId};
use crate::error::{Result, UsbError};
use crate::host::{EpConfig, UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::port::{self, Port, PortBackend};
use crate::urb::{EpHandle, EpType, SetupPacket, UrbStatus};

/// Concurrent hub instances
pub const MAX_INSTANCES: usize = 2;
/// Downstream ports supported per hub
pub const MAX_PORTS: usize = 4;

/// Hub descriptor type (USB 2.0 §11.23.2.1)
pub const HUB_DESCRIPTOR_TYPE: u8 = 0x29;

// Hub class feature selectors
pub const FEAT_C_HUB_LOCAL_POWER: u16 = 0;
pub const FEAT_C_HUB_OVER_CURRENT: u16 = 1;
pub const FEAT_PORT_ENABLE: u16 = 1;
pub const FEAT_PORT_RESET: u16 = 4;
pub const FEAT_PORT_POWER: u16 = 8;
pub const FEAT_C_PORT_CONNECTION: u16 = 16;
pub const FEAT_C_PORT_ENABLE: u16 = 17;
pub const FEAT_C_PORT_SUSPEND: u16 = 18;
pub const FEAT_C_PORT_OVER_CURRENT: u16 = 19;
pub const FEAT_C_PORT_RESET: u16 = 20;

// Hub-level status/change bits
const HUB_STATUS_C_LOCAL_POWER: u16 = 1 << 0;
const HUB_STATUS_C_OVER_CURRENT: u16 = 1 << 1;

/// Interrupt endpoint poll timeout per main-loop pass
const STATUS_POLL_TIMEOUT_MS: u32 = 50;

/// Parsed hub descriptor header
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HubDescriptor {
    pub num_ports: u8,
    pub characteristics: u16,
    /// Power-on to power-good, in milliseconds
    pub power_good_ms: u16,
}

impl HubDescriptor {
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < 7 || b[0] < 7 || b[1] != HUB_DESCRIPTOR_TYPE {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            num_ports: b[2],
            characteristics: u16::from_le_bytes([b[3], b[4]]),
            power_good_ms: b[5] as u16 * 2,
        })
    }
}

struct HubInstance {
    ep0: EpHandle,
    int_ep: Option<EpHandle>,
    desc: HubDescriptor,
    ports: Vec<Port, MAX_PORTS>,
    hub_c_status: u16,
}

/// Backend routing port requests through a hub's control endpoint
struct HubBackend {
    ep0: EpHandle,
    port: u8,
}

fn change_mask_to_feature(mask: u16) -> Option<u16> {
    match mask {
        port::PORT_C_CONNECTION => Some(FEAT_C_PORT_CONNECTION),
        port::PORT_C_ENABLE => Some(FEAT_C_PORT_ENABLE),
        port::PORT_C_SUSPEND => Some(FEAT_C_PORT_SUSPEND),
        port::PORT_C_OVERCURRENT => Some(FEAT_C_PORT_OVER_CURRENT),
        port::PORT_C_RESET => Some(FEAT_C_PORT_RESET),
        _ => None,
    }
}

impl PortBackend for HubBackend {
    fn fetch_status(&self, host: &UsbHost) -> Option<(u16, u16)> {
        let req = SetupPacket::new(
            SetupPacket::IN_CLASS_OTHER,
            SetupPacket::REQ_GET_STATUS,
            0,
            self.port as u16,
            4,
        );
        let mut buf = [0u8; 4];
        let (status, _) = host.control_request(self.ep0, req, &mut buf, CONTROL_REQUEST_TIMEOUT_MS);
        if status != UrbStatus::Ok {
            return None;
        }
        Some((
            u16::from_le_bytes([buf[0], buf[1]]),
            u16::from_le_bytes([buf[2], buf[3]]),
        ))
    }

    fn clear_change(&self, host: &UsbHost, change_mask: u16) {
        let Some(feature) = change_mask_to_feature(change_mask) else {
            return;
        };
        let req = SetupPacket::new(
            SetupPacket::OUT_CLASS_OTHER,
            SetupPacket::REQ_CLEAR_FEATURE,
            feature,
            self.port as u16,
            0,
        );
        let _ = host.control_nodata(self.ep0, req, CONTROL_REQUEST_TIMEOUT_MS);
    }

    fn reset(&self, host: &UsbHost) {
        let req = SetupPacket::new(
            SetupPacket::OUT_CLASS_OTHER,
            SetupPacket::REQ_SET_FEATURE,
            FEAT_PORT_RESET,
            self.port as u16,
            0,
        );
        let _ = host.control_nodata(self.ep0, req, CONTROL_REQUEST_TIMEOUT_MS);
    }
}

fn set_port_feature(host: &UsbHost, ep0: EpHandle, port: u8, feature: u16) -> Result<()> {
    let req = SetupPacket::new(
        SetupPacket::OUT_CLASS_OTHER,
        SetupPacket::REQ_SET_FEATURE,
        feature,
        port as u16,
        0,
    );
    host.control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS)
        .into_result()
}

fn clear_hub_feature(host: &UsbHost, ep0: EpHandle, feature: u16) {
    let req = SetupPacket::new(
        SetupPacket::OUT_CLASS_DEVICE,
        SetupPacket::REQ_CLEAR_FEATURE,
        feature,
        0,
        0,
    );
    let _ = host.control_nodata(ep0, req, CONTROL_REQUEST_TIMEOUT_MS);
}

fn read_hub_descriptor(host: &UsbHost, ep0: EpHandle) -> Result<HubDescriptor> {
    let req = SetupPacket::new(
        SetupPacket::IN_CLASS_DEVICE,
        SetupPacket::REQ_GET_DESCRIPTOR,
        (HUB_DESCRIPTOR_TYPE as u16) << 8,
        0,
        9,
    );
    let mut buf = [0u8; 9];
    let (status, _) = host.control_request(ep0, req, &mut buf, CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()?;
    HubDescriptor::from_bytes(&buf)
}

fn find_int_endpoint(desc: &[u8]) -> Option<descriptor::EndpointDescriptor> {
    let scan = |iface: &InterfaceView<'_>| {
        if iface.desc.interface_class != 0x09 {
            return None;
        }
        iface
            .endpoints()
            .map(|(ep, _)| ep)
            .find(|ep| ep.is_in() && EpType::from_attributes(ep.attributes) == EpType::Interrupt)
    };

    if desc.get(1) == Some(&descriptor::desc_type::CONFIGURATION) {
        let (_, interfaces) = InterfaceIter::new(desc).ok()?;
        for iface in interfaces {
            if let Some(ep) = scan(&iface) {
                return Some(ep);
            }
        }
        None
    } else {
        scan(&InterfaceView::from_interface_slice(desc)?)
    }
}

/// Host-owned arena of hub instances
pub struct HubPool {
    slots: [Option<HubInstance>; MAX_INSTANCES],
}

impl HubPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; MAX_INSTANCES],
        }
    }
}

impl ClassDriver for HubPool {
    fn name(&self) -> &'static str {
        "HUB"
    }

    fn matches(&self, class: u8, subclass: u8, _protocol: u8) -> bool {
        class == 0x09 && subclass == 0
    }

    fn load(&mut self, host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let ep0 = dev.ep0?;
        let int_desc = find_int_endpoint(desc)?;

        let hub_desc = match read_hub_descriptor(host, ep0) {
            Ok(d) => d,
            Err(_) => {
                warn!("hub: descriptor read failed");
                return None;
            }
        };
        let num_ports = hub_desc.num_ports.min(MAX_PORTS as u8);
        if hub_desc.num_ports > num_ports {
            warn!(
                "hub: limiting to {} of {} ports",
                num_ports, hub_desc.num_ports
            );
        }
        info!(
            "hub: {} ports, characteristics {:04x}, power-good {}ms",
            hub_desc.num_ports, hub_desc.characteristics, hub_desc.power_good_ms
        );

        // power every port, then wait out the power-good time
        for p in 1..=num_ports {
            if set_port_feature(host, ep0, p, FEAT_PORT_POWER).is_err() {
                warn!("hub: port {} power-on failed", p);
            }
        }
        crate::timing::delay_ms(hub_desc.power_good_ms as u32);

        let int_ep = host
            .ep_open(EpConfig::from_descriptor(
                &int_desc,
                dev.address,
                dev.is_low_speed(),
            ))
            .ok();

        let mut ports = Vec::new();
        for p in 1..=num_ports {
            ports.push(Port::downstream(p)).ok();
        }

        self.slots[slot] = Some(HubInstance {
            ep0,
            int_ep,
            desc: HubDescriptor {
                num_ports,
                ..hub_desc
            },
            ports,
            hub_c_status: 0,
        });

        Some(DriverId::Hub(slot as u8))
    }

    fn unload(&mut self, host: &UsbHost, id: DriverId) {
        // Only safe for a hub with no attached children (the failed-
        // load path); cascaded teardown goes through `unload_detached`
        // so nested hubs can re-enter the pool.
        let DriverId::Hub(slot) = id else { return };
        if let Some(inst) = self.slots[slot as usize].take() {
            teardown(host, inst);
        }
    }
}

fn teardown(host: &UsbHost, mut inst: HubInstance) {
    if let Some(ep) = inst.int_ep.take() {
        host.ep_close(ep);
    }
    for p in inst.ports.iter_mut() {
        port::port_disconnected(host, p);
    }
}

/// Unload a hub instance without holding the pool borrow, so child
/// hubs hanging off its ports can unload recursively.
pub(crate) fn unload_detached(host: &UsbHost, id: DriverId) {
    let DriverId::Hub(slot) = id else { return };
    let taken = host.hubs.borrow_mut().slots[slot as usize].take();
    if let Some(inst) = taken {
        teardown(host, inst);
    }
}

fn hub_process_status_change(host: &UsbHost, inst: &mut HubInstance) {
    info!("hub: hub status change");
    let req = SetupPacket::new(
        SetupPacket::IN_CLASS_DEVICE,
        SetupPacket::REQ_GET_STATUS,
        0,
        0,
        4,
    );
    let mut buf = [0u8; 4];
    let (status, _) = host.control_request(inst.ep0, req, &mut buf, CONTROL_REQUEST_TIMEOUT_MS);
    if status != UrbStatus::Ok {
        return;
    }
    inst.hub_c_status |= u16::from_le_bytes([buf[2], buf[3]]);

    if inst.hub_c_status & HUB_STATUS_C_LOCAL_POWER != 0 {
        inst.hub_c_status &= !HUB_STATUS_C_LOCAL_POWER;
        clear_hub_feature(host, inst.ep0, FEAT_C_HUB_LOCAL_POWER);
    }
    if inst.hub_c_status & HUB_STATUS_C_OVER_CURRENT != 0 {
        inst.hub_c_status &= !HUB_STATUS_C_OVER_CURRENT;
        clear_hub_feature(host, inst.ep0, FEAT_C_HUB_OVER_CURRENT);
    }
}

/// Poll a hub's status-change endpoint and fan the bitmap out to the
/// hub itself (bit 0) and its ports (bit N).
fn process_one_hub(host: &UsbHost, inst: &mut HubInstance) {
    let Some(int_ep) = inst.int_ep else { return };

    let mut bitmap_buf = [0u8; 2];
    let (status, len) = host.bulk_in(int_ep, &mut bitmap_buf, STATUS_POLL_TIMEOUT_MS);
    let bitmap: u16 = match (status, len) {
        (UrbStatus::Ok, 1) => bitmap_buf[0] as u16,
        (UrbStatus::Ok, 2) => u16::from_le_bytes(bitmap_buf),
        // NAK this interval: nothing changed
        (UrbStatus::Timeout, _) => return,
        _ => return,
    };
    if bitmap == 0 {
        return;
    }

    if bitmap & 1 != 0 {
        hub_process_status_change(host, inst);
    }

    for i in 0..inst.ports.len() {
        let number = inst.ports[i].number;
        if bitmap & (1 << number) != 0 {
            let backend = HubBackend {
                ep0: inst.ep0,
                port: number,
            };
            port::process_status_change(host, &backend, &mut inst.ports[i]);
        }
    }
}

impl UsbHost {
    /// Downstream port count of hub instance `slot`
    pub fn hub_port_count(&self, slot: u8) -> u8 {
        self.hubs.borrow().slots[slot as usize]
            .as_ref()
            .map(|i| i.desc.num_ports)
            .unwrap_or(0)
    }
}

/// Hub slice of the main loop: each instance is taken out of the pool
/// while it is processed so a downstream hub attach can claim a slot.
pub(crate) fn process_hubs(host: &UsbHost) {
    for slot in 0..MAX_INSTANCES {
        let taken = host.hubs.borrow_mut().slots[slot].take();
        let Some(mut inst) = taken else { continue };
        process_one_hub(host, &mut inst);
        host.hubs.borrow_mut().slots[slot] = Some(inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_descriptor_parse() {
        // 4-port hub, per-port power switching, 100ms power-good
        let raw = [9, 0x29, 4, 0x09, 0x00, 50, 100, 0x00, 0xFF];
        let d = HubDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(d.num_ports, 4);
        assert_eq!(d.characteristics, 0x0009);
        assert_eq!(d.power_good_ms, 100);

        assert!(HubDescriptor::from_bytes(&[9, 0x05, 4, 0, 0, 0, 0]).is_err());
        assert!(HubDescriptor::from_bytes(&[3, 0x29, 4]).is_err());
    }

    #[test]
    fn change_mask_feature_mapping() {
        assert_eq!(
            change_mask_to_feature(port::PORT_C_CONNECTION),
            Some(FEAT_C_PORT_CONNECTION)
        );
        assert_eq!(
            change_mask_to_feature(port::PORT_C_RESET),
            Some(FEAT_C_PORT_RESET)
        );
        assert_eq!(change_mask_to_feature(0x8000), None);
    }
}
