//! USB Video Class driver
//!
//! Covers the capture path: the VideoControl/VideoStreaming interface
//! pair (grouped by an IAD), the Probe/Commit bandwidth negotiation,
//! isochronous alternate-setting selection, and payload-to-frame
//! assembly into a small frame queue with lock-and-fetch/release
//! semantics.

use heapless::Deque;
use log::{info, warn};

use crate::class::ClassDriver;
use crate::descriptor::{self, InterfaceIter, InterfaceView};
use crate::enumeration::{self, Device, DriverId};
use crate::error::{Result, UsbError};
use crate::host::{EpConfig, UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::urb::{EpHandle, EpType, SetupPacket, UrbStatus};

/// Concurrent UVC instances
pub const MAX_INSTANCES: usize = 1;
/// Frame buffers per instance
pub const FRAME_COUNT: usize = 2;
/// Capacity of one frame buffer
pub const FRAME_SIZE: usize = 4096;

// Video class codes
const CC_VIDEO: u8 = 0x0E;
const SC_VIDEOCONTROL: u8 = 0x01;
const SC_VIDEOSTREAMING: u8 = 0x02;

// Class-specific requests
pub const REQ_SET_CUR: u8 = 0x01;
pub const REQ_GET_CUR: u8 = 0x81;

// VideoStreaming control selectors
pub const VS_PROBE_CONTROL: u16 = 0x01;
pub const VS_COMMIT_CONTROL: u16 = 0x02;

/// Probe/Commit control block (UVC 1.0, 26 bytes)
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProbeControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// Frame interval in 100 ns units
    pub frame_interval: u32,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

impl ProbeControl {
    pub const WIRE_SIZE: usize = 26;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut b = [0u8; Self::WIRE_SIZE];
        b[0..2].copy_from_slice(&self.hint.to_le_bytes());
        b[2] = self.format_index;
        b[3] = self.frame_index;
        b[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        b[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        b[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            hint: u16::from_le_bytes([b[0], b[1]]),
            format_index: b[2],
            frame_index: b[3],
            frame_interval: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            max_video_frame_size: u32::from_le_bytes([b[18], b[19], b[20], b[21]]),
            max_payload_transfer_size: u32::from_le_bytes([b[22], b[23], b[24], b[25]]),
        })
    }
}

/// One assembled video frame
struct FrameBuffer {
    data: [u8; FRAME_SIZE],
    len: usize,
    /// Frame was truncated against FRAME_SIZE or had payload errors
    damaged: bool,
}

impl FrameBuffer {
    const fn empty() -> Self {
        Self {
            data: [0; FRAME_SIZE],
            len: 0,
            damaged: false,
        }
    }
}

/// One isochronous alternate setting of the streaming interface
#[derive(Debug, Clone, Copy)]
struct StreamAlt {
    alt: u8,
    ep: descriptor::EndpointDescriptor,
}

struct UvcInstance {
    ep0: EpHandle,
    vs_ifnum: u8,
    alts: heapless::Vec<StreamAlt, 4>,
    iso_ep: Option<EpHandle>,
    committed: ProbeControl,
    // frame assembly
    frames: [FrameBuffer; FRAME_COUNT],
    /// Indices of frames ready for the application
    ready: Deque<u8, FRAME_COUNT>,
    /// Frames locked by the application
    locked: [bool; FRAME_COUNT],
    fill: Option<u8>,
    last_fid: Option<bool>,
}

/// Host-owned arena of UVC instances
pub struct UvcPool {
    slots: [Option<UvcInstance>; MAX_INSTANCES],
}

impl UvcPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; MAX_INSTANCES],
        }
    }
}

/// Locate the streaming interface and its iso alternate settings
fn scan_video_function(desc: &[u8]) -> Option<(u8, heapless::Vec<StreamAlt, 4>)> {
    if desc.get(1) == Some(&descriptor::desc_type::CONFIGURATION) {
        let (_, interfaces) = InterfaceIter::new(desc).ok()?;
        scan_from_interfaces(interfaces)
    } else {
        scan_from_interfaces(descriptor::InterfaceSliceIter::new(desc))
    }
}

fn scan_from_interfaces<'a, I: Iterator<Item = InterfaceView<'a>>>(
    interfaces: I,
) -> Option<(u8, heapless::Vec<StreamAlt, 4>)> {
    let mut vs_ifnum = None;
    let mut alts = heapless::Vec::new();
    for iface in interfaces {
        let d = iface.desc;
        if d.interface_class != CC_VIDEO {
            continue;
        }
        match d.interface_sub_class {
            SC_VIDEOCONTROL => {}
            SC_VIDEOSTREAMING => {
                vs_ifnum.get_or_insert(d.interface_number);
                if vs_ifnum != Some(d.interface_number) {
                    continue;
                }
                for (ep, _) in iface.endpoints() {
                    if ep.is_in()
                        && EpType::from_attributes(ep.attributes) == EpType::Isochronous
                    {
                        alts.push(StreamAlt {
                            alt: d.alternate_setting,
                            ep,
                        })
                        .ok();
                    }
                }
            }
            _ => {}
        }
    }
    vs_ifnum.map(|n| (n, alts))
}

impl ClassDriver for UvcPool {
    fn name(&self) -> &'static str {
        "UVC"
    }

    fn matches(&self, class: u8, subclass: u8, _protocol: u8) -> bool {
        // dispatched via the IAD function triple (0x0E/0x03) or the
        // VideoControl interface itself
        class == CC_VIDEO && (subclass == 0x03 || subclass == SC_VIDEOCONTROL)
    }

    fn load(&mut self, _host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let ep0 = dev.ep0?;
        let (vs_ifnum, alts) = scan_video_function(desc)?;
        if alts.is_empty() {
            warn!("uvc: no isochronous alternate settings");
            return None;
        }
        info!(
            "uvc: streaming interface {}, {} alt settings",
            vs_ifnum,
            alts.len()
        );

        // the probe/commit dance and endpoint setup happen in
        // uvc_commit, once the application picks a format
        dev.keep_full_cfg = true;
        self.slots[slot] = Some(UvcInstance {
            ep0,
            vs_ifnum,
            alts,
            iso_ep: None,
            committed: ProbeControl::default(),
            frames: [const { FrameBuffer::empty() }; FRAME_COUNT],
            ready: Deque::new(),
            locked: [false; FRAME_COUNT],
            fill: None,
            last_fid: None,
        });
        Some(DriverId::Uvc(slot as u8))
    }

    fn unload(&mut self, host: &UsbHost, id: DriverId) {
        let DriverId::Uvc(slot) = id else { return };
        if let Some(mut inst) = self.slots[slot as usize].take() {
            if let Some(ep) = inst.iso_ep.take() {
                host.ep_close(ep);
            }
        }
    }
}

impl UsbHost {
    fn uvc_probe_io(
        &self,
        ep0: EpHandle,
        vs_ifnum: u8,
        selector: u16,
        set: Option<&ProbeControl>,
    ) -> Result<ProbeControl> {
        match set {
            Some(pc) => {
                let req = SetupPacket::new(
                    SetupPacket::OUT_CLASS_INTERFACE,
                    REQ_SET_CUR,
                    selector << 8,
                    vs_ifnum as u16,
                    ProbeControl::WIRE_SIZE as u16,
                );
                let (status, _) =
                    self.control_out(ep0, req, &pc.to_bytes(), CONTROL_REQUEST_TIMEOUT_MS);
                status.into_result()?;
                Ok(*pc)
            }
            None => {
                let req = SetupPacket::new(
                    SetupPacket::IN_CLASS_INTERFACE,
                    REQ_GET_CUR,
                    selector << 8,
                    vs_ifnum as u16,
                    ProbeControl::WIRE_SIZE as u16,
                );
                let mut buf = [0u8; ProbeControl::WIRE_SIZE];
                let (status, _) = self.control_request(ep0, req, &mut buf, CONTROL_REQUEST_TIMEOUT_MS);
                status.into_result()?;
                ProbeControl::from_bytes(&buf).ok_or(UsbError::InvalidDescriptor)
            }
        }
    }

    /// Negotiate and commit a video format: SET_CUR(probe) with the
    /// wish, GET_CUR(probe) for the device's counter-offer, then
    /// SET_CUR(commit). Selects the smallest alternate setting whose
    /// payload size fits and opens the isochronous endpoint.
    pub fn uvc_commit(&self, slot: u8, dev_addr: u8, wish: ProbeControl) -> Result<ProbeControl> {
        let (ep0, vs_ifnum) = {
            let pool = self.uvc.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep0, inst.vs_ifnum)
        };

        self.uvc_probe_io(ep0, vs_ifnum, VS_PROBE_CONTROL, Some(&wish))?;
        let granted = self.uvc_probe_io(ep0, vs_ifnum, VS_PROBE_CONTROL, None)?;
        info!(
            "uvc: granted format {} frame {} payload {}B",
            granted.format_index, granted.frame_index, granted.max_payload_transfer_size
        );
        self.uvc_probe_io(ep0, vs_ifnum, VS_COMMIT_CONTROL, Some(&granted))?;

        // pick the smallest iso alternate that carries the payload
        let alt = {
            let pool = self.uvc.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            let mut best: Option<StreamAlt> = None;
            for a in inst.alts.iter() {
                let size = a.ep.max_packet_size as u32 & 0x7FF;
                if size >= granted.max_payload_transfer_size.min(0x400) {
                    match best {
                        Some(b) if b.ep.max_packet_size <= a.ep.max_packet_size => {}
                        _ => best = Some(*a),
                    }
                }
            }
            best.or_else(|| inst.alts.last().copied())
                .ok_or(UsbError::NoResources)?
        };

        enumeration::set_interface(self, ep0, vs_ifnum, alt.alt)?;

        let iso_ep = self.ep_open(EpConfig::from_descriptor(&alt.ep, dev_addr, false))?;
        let old = {
            let mut pool = self.uvc.borrow_mut();
            let inst = pool.slots[slot as usize]
                .as_mut()
                .ok_or(UsbError::InvalidState)?;
            let old = inst.iso_ep.replace(iso_ep);
            inst.committed = granted;
            old
        };
        if let Some(old) = old {
            self.ep_close(old);
        }
        Ok(granted)
    }

    /// Negotiated parameters of the committed stream, if any
    pub fn uvc_committed(&self, slot: u8) -> Option<ProbeControl> {
        let pool = self.uvc.borrow();
        let inst = pool.slots[slot as usize].as_ref()?;
        inst.iso_ep.is_some().then_some(inst.committed)
    }

    /// Stop streaming: back to alternate setting 0 and drop the
    /// isochronous endpoint.
    pub fn uvc_stop(&self, slot: u8) -> Result<()> {
        let (ep0, vs_ifnum, iso_ep) = {
            let mut pool = self.uvc.borrow_mut();
            let inst = pool.slots[slot as usize]
                .as_mut()
                .ok_or(UsbError::InvalidState)?;
            (inst.ep0, inst.vs_ifnum, inst.iso_ep.take())
        };
        if let Some(ep) = iso_ep {
            self.ep_close(ep);
        }
        enumeration::set_interface(self, ep0, vs_ifnum, 0)
    }

    /// Pump one isochronous payload and run frame assembly. Call
    /// frequently while streaming. Payload headers carry a frame-ID
    /// bit that toggles per frame and an explicit end-of-frame bit.
    pub fn uvc_poll(&self, slot: u8) -> Result<()> {
        let iso_ep = {
            let pool = self.uvc.borrow();
            let inst = pool.slots[slot as usize]
                .as_ref()
                .ok_or(UsbError::InvalidState)?;
            inst.iso_ep.ok_or(UsbError::InvalidState)?
        };

        let mut payload = [0u8; 1024];
        let (status, len) = self.bulk_in(iso_ep, &mut payload, 100);
        match status {
            UrbStatus::Ok => {}
            UrbStatus::Timeout => return Ok(()), // nothing this interval
            other => return other.into_result(),
        }
        if len < 2 {
            return Ok(());
        }

        let header_len = payload[0] as usize;
        if header_len < 2 || header_len > len {
            return Ok(());
        }
        let info_bits = payload[1];
        let fid = info_bits & 0x01 != 0;
        let eof = info_bits & 0x02 != 0;
        let err = info_bits & 0x40 != 0;
        let data = &payload[header_len..len];

        let mut pool = self.uvc.borrow_mut();
        let inst = pool.slots[slot as usize]
            .as_mut()
            .ok_or(UsbError::InvalidState)?;

        // FID toggle without EOF means the previous frame ended
        // silently; finish it before starting the new one
        if inst.last_fid.is_some() && inst.last_fid != Some(fid) {
            inst.finish_frame();
        }
        inst.last_fid = Some(fid);

        if inst.fill.is_none() {
            inst.fill = inst.alloc_frame();
        }
        if let Some(idx) = inst.fill {
            let frame = &mut inst.frames[idx as usize];
            let space = FRAME_SIZE - frame.len;
            let take = data.len().min(space);
            frame.data[frame.len..frame.len + take].copy_from_slice(&data[..take]);
            frame.len += take;
            if take < data.len() || err {
                frame.damaged = true;
            }
        }

        if eof {
            inst.finish_frame();
        }
        Ok(())
    }

    /// Fetch the oldest completed frame, locking its buffer. Returns
    /// the frame index and payload length.
    pub fn uvc_lock_frame(&self, slot: u8) -> Option<(u8, usize)> {
        let mut pool = self.uvc.borrow_mut();
        let inst = pool.slots[slot as usize].as_mut()?;
        let idx = inst.ready.pop_front()?;
        inst.locked[idx as usize] = true;
        Some((idx, inst.frames[idx as usize].len))
    }

    /// Copy out of a locked frame
    pub fn uvc_frame_data(&self, slot: u8, frame: u8, buf: &mut [u8]) -> usize {
        let pool = self.uvc.borrow();
        let Some(inst) = pool.slots[slot as usize].as_ref() else {
            return 0;
        };
        if !inst.locked[frame as usize] {
            return 0;
        }
        let f = &inst.frames[frame as usize];
        let n = f.len.min(buf.len());
        buf[..n].copy_from_slice(&f.data[..n]);
        n
    }

    /// Return a locked frame buffer to the assembly pool
    pub fn uvc_release_frame(&self, slot: u8, frame: u8) {
        let mut pool = self.uvc.borrow_mut();
        if let Some(inst) = pool.slots[slot as usize].as_mut() {
            inst.locked[frame as usize] = false;
            inst.frames[frame as usize].len = 0;
            inst.frames[frame as usize].damaged = false;
        }
    }
}

impl UvcInstance {
    fn alloc_frame(&mut self) -> Option<u8> {
        (0..FRAME_COUNT as u8).find(|&i| {
            !self.locked[i as usize]
                && self.fill != Some(i)
                && !self.ready.iter().any(|&r| r == i)
        })
    }

    fn finish_frame(&mut self) {
        if let Some(idx) = self.fill.take() {
            let frame = &mut self.frames[idx as usize];
            if frame.len == 0 {
                return;
            }
            if frame.damaged {
                warn!("uvc: dropping damaged frame ({}B)", frame.len);
                frame.len = 0;
                frame.damaged = false;
                return;
            }
            self.ready.push_back(idx).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_control_wire_roundtrip() {
        let pc = ProbeControl {
            hint: 0x0001,
            format_index: 1,
            frame_index: 3,
            frame_interval: 333_333, // 30 fps
            max_video_frame_size: 614_400,
            max_payload_transfer_size: 3_072,
        };
        let bytes = pc.to_bytes();
        let back = ProbeControl::from_bytes(&bytes).unwrap();
        assert_eq!(back.hint, 0x0001);
        assert_eq!(back.format_index, 1);
        assert_eq!(back.frame_index, 3);
        assert_eq!(back.frame_interval, 333_333);
        assert_eq!(back.max_video_frame_size, 614_400);
        assert_eq!(back.max_payload_transfer_size, 3_072);

        assert!(ProbeControl::from_bytes(&bytes[..20]).is_none());
    }
}
