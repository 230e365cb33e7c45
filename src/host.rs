//! Host controller object and thread-context API
//!
//! `UsbHost` owns every mutable piece of the stack: the channel pool,
//! the endpoint and URB arenas, the address bitmap, and the root port.
//! All of it is guarded by one global critical section — the same
//! discipline the channel scheduler's invariants were designed around:
//! endpoint, channel and URB state always change together, atomically
//! with respect to the interrupt handler. Operations come in a
//! lock-held (`*_i` suffix, on `HostInner`) and a lock-taking (public,
//! on `UsbHost`) variant.
//!
//! Blocking calls (`bulk_in`, `control_request`, ...) poll the URB
//! status in short critical-section windows against a cycle-counter
//! deadline; they are never called from interrupt context. The
//! interrupt service entry is [`UsbHost::on_interrupt`]; wire it to the
//! OTG core's IRQ.

use core::cell::RefCell;

use critical_section::Mutex;
use log::{info, warn};

use crate::error::{Result, UsbError};
use crate::otg::channel::ChannelPool;
use crate::otg::regs::{self as regs, OtgBus};
use crate::timing::{self, Deadline};
use crate::urb::{
    CompletionCallback, EpHandle, EpSlot, EpState, EpType, SetupPacket, UrbHandle, UrbSlot,
    UrbStatus,
};

/// Endpoint arena size
pub const MAX_ENDPOINTS: usize = 16;
/// URB arena size
pub const MAX_URBS: usize = 16;
/// Highest assignable USB device address
pub const MAX_ADDRESSES: usize = 127;

/// Default timeout for standard control requests
pub const CONTROL_REQUEST_TIMEOUT_MS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostState {
    Stopped,
    Started,
}

/// Parameters for opening an endpoint
#[derive(Debug, Clone, Copy)]
pub struct EpConfig {
    pub ep_type: EpType,
    /// Endpoint number without direction bit
    pub number: u8,
    /// Ignored for control endpoints (bidirectional)
    pub dir_in: bool,
    pub max_packet_size: u16,
    pub interval: u8,
    pub dev_addr: u8,
    pub low_speed: bool,
}

impl EpConfig {
    /// Control endpoint 0 configuration used during enumeration
    pub fn ep0(dev_addr: u8, max_packet_size: u16, low_speed: bool) -> Self {
        Self {
            ep_type: EpType::Control,
            number: 0,
            dir_in: false,
            max_packet_size,
            interval: 0,
            dev_addr,
            low_speed,
        }
    }

    /// From a parsed endpoint descriptor
    pub fn from_descriptor(
        desc: &crate::descriptor::EndpointDescriptor,
        dev_addr: u8,
        low_speed: bool,
    ) -> Self {
        Self {
            ep_type: EpType::from_attributes(desc.attributes),
            number: desc.number(),
            dir_in: desc.is_in(),
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
            dev_addr,
            low_speed,
        }
    }
}

/// All mutable host state; only ever touched inside the critical
/// section.
pub(crate) struct HostInner {
    pub bus: OtgBus,
    pub state: HostState,
    pub channels: ChannelPool,
    pub eps: [EpSlot; MAX_ENDPOINTS],
    pub urbs: [UrbSlot; MAX_URBS],
    /// Endpoints with work queued, per endpoint type
    pub pending: [heapless::Vec<u8, MAX_ENDPOINTS>; 4],
    /// Endpoints with a channel assigned, per endpoint type
    pub active: [heapless::Vec<u8, MAX_ENDPOINTS>; 4],
    /// Assigned-address bitmap; bit (addr-1) set when in use
    pub addr_bitmap: [u8; 16],
    /// Root port status/changed bits (wPortStatus/wPortChange layout)
    pub root_status: u16,
    pub root_c_status: u16,
    /// Low-speed enable workaround armed: do not report port-enabled
    /// until bus activity is seen in the SOF window
    pub check_ls_activity: bool,
}

// The arenas carry caller buffer pointers for in-flight URBs. They are
// only dereferenced under the critical section, and blocking callers
// keep their buffers alive until the URB reaches a terminal status.
unsafe impl Send for HostInner {}

impl HostInner {
    fn new(bus: OtgBus) -> Self {
        Self {
            bus,
            state: HostState::Stopped,
            channels: ChannelPool::new(),
            eps: [const { EpSlot::free() }; MAX_ENDPOINTS],
            urbs: [const { UrbSlot::free() }; MAX_URBS],
            pending: [const { heapless::Vec::new() }; 4],
            active: [const { heapless::Vec::new() }; 4],
            addr_bitmap: [0; 16],
            root_status: 0,
            root_c_status: 0,
            check_ls_activity: false,
        }
    }

    /// Allocate the lowest free device address
    pub fn alloc_address(&mut self) -> Option<u8> {
        for (i, byte) in self.addr_bitmap.iter_mut().enumerate() {
            if *byte != 0xFF {
                let bit = byte.trailing_ones() as usize;
                let addr = i * 8 + bit + 1;
                if addr > MAX_ADDRESSES {
                    return None;
                }
                *byte |= 1 << bit;
                return Some(addr as u8);
            }
        }
        None
    }

    /// Return an address to the pool; freeing a free address is a bug.
    pub fn free_address(&mut self, addr: u8) {
        if addr == 0 || addr as usize > MAX_ADDRESSES {
            return;
        }
        let idx = (addr as usize - 1) / 8;
        let bit = (addr as usize - 1) % 8;
        debug_assert!(self.addr_bitmap[idx] & (1 << bit) != 0);
        self.addr_bitmap[idx] &= !(1 << bit);
    }

    pub fn address_in_use(&self, addr: u8) -> bool {
        if addr == 0 || addr as usize > MAX_ADDRESSES {
            return false;
        }
        let idx = (addr as usize - 1) / 8;
        self.addr_bitmap[idx] & (1 << ((addr as usize - 1) % 8)) != 0
    }

    fn alloc_ep_slot(&mut self) -> Option<u8> {
        self.eps.iter().position(|e| e.is_free()).map(|i| i as u8)
    }

    fn alloc_urb_slot(&mut self) -> Option<u8> {
        self.urbs.iter().position(|u| u.is_free()).map(|i| i as u8)
    }
}

/// USB host controller instance.
///
/// Create one per physical OTG core. The application must:
/// 1. call [`UsbHost::start`] once the core clock is running and the
///    DWT cycle counter is enabled,
/// 2. call [`UsbHost::on_interrupt`] from the OTG interrupt handler,
/// 3. call [`UsbHost::main_loop`] periodically from thread context.
pub struct UsbHost {
    pub(crate) inner: Mutex<RefCell<HostInner>>,
    pub(crate) root: RefCell<crate::port::Port>,
    #[cfg(feature = "msd")]
    pub(crate) msd: RefCell<crate::class::msd::MsdPool>,
    #[cfg(feature = "hub")]
    pub(crate) hubs: RefCell<crate::class::hub::HubPool>,
    #[cfg(feature = "hid")]
    pub(crate) hid: RefCell<crate::class::hid::HidPool>,
    #[cfg(feature = "ftdi")]
    pub(crate) ftdi: RefCell<crate::class::ftdi::FtdiPool>,
    #[cfg(feature = "aoa")]
    pub(crate) aoa: RefCell<crate::class::aoa::AoaPool>,
    #[cfg(feature = "uvc")]
    pub(crate) uvc: RefCell<crate::class::uvc::UvcPool>,
}

// `root` and the class pools are thread-context only; `inner` is
// guarded by the critical section. The host is meant to live in a
// static and be shared with the interrupt handler.
unsafe impl Sync for UsbHost {}

impl UsbHost {
    /// Create a host bound to the OTG core at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be a valid OTG register base (see [`OtgBus::new`])
    /// and at most one host may exist per core.
    pub unsafe fn new(base: usize) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(HostInner::new(unsafe { OtgBus::new(base) }))),
            root: RefCell::new(crate::port::Port::root()),
            #[cfg(feature = "msd")]
            msd: RefCell::new(crate::class::msd::MsdPool::new()),
            #[cfg(feature = "hub")]
            hubs: RefCell::new(crate::class::hub::HubPool::new()),
            #[cfg(feature = "hid")]
            hid: RefCell::new(crate::class::hid::HidPool::new()),
            #[cfg(feature = "ftdi")]
            ftdi: RefCell::new(crate::class::ftdi::FtdiPool::new()),
            #[cfg(feature = "aoa")]
            aoa: RefCell::new(crate::class::aoa::AoaPool::new()),
            #[cfg(feature = "uvc")]
            uvc: RefCell::new(crate::class::uvc::UvcPool::new()),
        }
    }

    /// Run `f` with the host state locked (the "system lock")
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut HostInner) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// Initialize the OTG core in forced host mode and power the root
    /// port. Mirrors the canonical OTG bring-up sequence.
    pub fn start(&self) {
        crate::class::init_drivers(self);
        self.with(|h| {
            if h.state != HostState::Stopped {
                return;
            }
            h.start_controller();
            h.state = HostState::Started;
        });
        info!("usbh: started");
    }

    /// Stop the controller; outstanding URBs complete as Disconnected.
    pub fn stop(&self) {
        self.with(|h| {
            if h.state == HostState::Stopped {
                return;
            }
            h.disable_port();
            h.bus.write(regs::GINTMSK, 0);
            h.bus.clear_bits(regs::GAHBCFG, regs::GAHBCFG_GINTMSK);
            h.state = HostState::Stopped;
        });
        info!("usbh: stopped");
    }

    /// Suspend the root port (selective suspend).
    pub fn suspend(&self) {
        self.with(|h| {
            if h.state != HostState::Started {
                return;
            }
            let hprt = h.bus.read(regs::HPRT)
                & !(regs::HPRT_PENA
                    | regs::HPRT_PCDET
                    | regs::HPRT_PENCHNG
                    | regs::HPRT_POCCHNG);
            h.bus.write(regs::HPRT, hprt | regs::HPRT_PSUSP);
            h.root_status |= crate::port::PORT_SUSPEND;
        });
        info!("usbh: suspended");
    }

    /// Resume a suspended root port; drives resume signalling for the
    /// required 20 ms before traffic restarts.
    pub fn resume(&self) {
        const HPRT_PRES: u32 = 1 << 6;
        self.with(|h| {
            h.bus.write(regs::PCGCCTL, 0);
            let hprt = h.bus.read(regs::HPRT)
                & !(regs::HPRT_PENA
                    | regs::HPRT_PCDET
                    | regs::HPRT_PENCHNG
                    | regs::HPRT_POCCHNG
                    | regs::HPRT_PSUSP);
            h.bus.write(regs::HPRT, hprt | HPRT_PRES);
        });
        timing::delay_ms(20);
        self.with(|h| {
            let hprt = h.bus.read(regs::HPRT)
                & !(regs::HPRT_PENA
                    | regs::HPRT_PCDET
                    | regs::HPRT_PENCHNG
                    | regs::HPRT_POCCHNG
                    | HPRT_PRES);
            h.bus.write(regs::HPRT, hprt);
            h.root_status &= !crate::port::PORT_SUSPEND;
        });
        info!("usbh: resumed");
    }

    /// Interrupt service entry; call from the OTG IRQ handler.
    pub fn on_interrupt(&self) {
        self.with(|h| h.serve_interrupt());
    }

    /// Host state snapshot
    pub fn state(&self) -> HostState {
        self.with(|h| h.state)
    }

    // ===== Endpoint API =====

    /// Allocate and open an endpoint.
    pub fn ep_open(&self, cfg: EpConfig) -> Result<EpHandle> {
        self.with(|h| {
            let idx = h.alloc_ep_slot().ok_or(UsbError::NoResources)?;
            let ep = &mut h.eps[idx as usize];
            *ep = EpSlot::free();
            ep.ep_type = cfg.ep_type;
            ep.number = cfg.number;
            ep.dir_in = cfg.ep_type != EpType::Control && cfg.dir_in;
            ep.max_packet_size = cfg.max_packet_size;
            ep.interval = cfg.interval.max(1);
            ep.dev_addr = cfg.dev_addr;
            ep.low_speed = cfg.low_speed;
            ep.dt_pid = regs::HCTSIZ_DPID_DATA0;
            ep.xfer.frame_counter = 1;
            ep.state = EpState::Open;
            Ok(EpHandle(idx))
        })
    }

    /// Close an endpoint: abort every queued URB (each completes as
    /// Disconnected), wait for any hardware halt to finish, then free
    /// the slot. Never leaves a stale channel binding.
    pub fn ep_close(&self, h: EpHandle) {
        loop {
            let urb = self.with(|host| {
                let ep = &mut host.eps[h.0 as usize];
                if ep.is_free() {
                    return None;
                }
                ep.urbs.front().copied()
            });
            let Some(urb_idx) = urb else { break };
            self.abort_and_wait(UrbHandle(urb_idx), UrbStatus::Disconnected);
        }
        self.with(|host| {
            let ep = &mut host.eps[h.0 as usize];
            if !ep.is_free() {
                debug_assert!(ep.channel.is_none());
                debug_assert!(ep.urbs.is_empty());
                host.remove_from_queues(h.0);
                host.eps[h.0 as usize] = EpSlot::free();
            }
        });
    }

    /// Reset a halted endpoint's data toggle and reopen it. The caller
    /// is responsible for the matching CLEAR_FEATURE(ENDPOINT_HALT).
    pub fn ep_reset(&self, h: EpHandle) -> Result<()> {
        self.with(|host| {
            let ep = &mut host.eps[h.0 as usize];
            if ep.is_free() {
                return Err(UsbError::InvalidState);
            }
            ep.dt_pid = regs::HCTSIZ_DPID_DATA0;
            if ep.state == EpState::Halted {
                ep.state = EpState::Open;
            }
            Ok(())
        })
    }

    /// Endpoint state snapshot
    pub fn ep_state(&self, h: EpHandle) -> EpState {
        self.with(|host| host.eps[h.0 as usize].state)
    }

    // ===== URB API =====

    /// Initialize and submit a URB.
    ///
    /// The asynchronous primitive: the completion `callback` (if any)
    /// runs in interrupt context. Prefer the blocking wrappers unless
    /// streaming.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid (and unaliased for IN transfers) until the
    /// URB reaches a terminal status or is freed via [`Self::urb_free`].
    pub unsafe fn urb_submit(
        &self,
        ep: EpHandle,
        setup: Option<&SetupPacket>,
        buf: *mut u8,
        len: u32,
        callback: Option<CompletionCallback>,
        cb_arg: usize,
    ) -> Result<UrbHandle> {
        self.with(|h| {
            let idx = h.alloc_urb_slot().ok_or(UsbError::NoResources)?;
            let urb = &mut h.urbs[idx as usize];
            *urb = UrbSlot::free();
            urb.ep = ep.0;
            urb.buf = buf;
            urb.requested = len;
            urb.callback = callback;
            urb.cb_arg = cb_arg;
            if let Some(s) = setup {
                urb.setup = s.to_bytes();
                urb.has_setup = true;
            }
            urb.status = UrbStatus::Initialized;
            h.urb_submit_i(idx);
            Ok(UrbHandle(idx))
        })
    }

    /// Current status of a URB
    pub fn urb_status(&self, h: UrbHandle) -> UrbStatus {
        self.with(|host| host.urbs[h.0 as usize].status)
    }

    /// Bytes actually transferred
    pub fn urb_actual(&self, h: UrbHandle) -> u32 {
        self.with(|host| host.urbs[h.0 as usize].actual)
    }

    /// Release a completed URB slot back to the arena.
    pub fn urb_free(&self, h: UrbHandle) {
        self.with(|host| {
            let urb = &mut host.urbs[h.0 as usize];
            debug_assert!(urb.status.is_terminal() || urb.status == UrbStatus::Initialized);
            *urb = UrbSlot::free();
        });
    }

    /// Cancel a URB. Returns `true` when the URB completed within this
    /// call; `false` when a hardware halt was requested and completion
    /// will arrive from the interrupt handler.
    pub fn urb_cancel(&self, h: UrbHandle) -> bool {
        self.with(|host| host.urb_abort_i(h.0, UrbStatus::Cancelled))
    }

    /// Abort a URB with `status` and block until it reaches a terminal
    /// state (one hardware round-trip at most).
    pub fn abort_and_wait(&self, h: UrbHandle, status: UrbStatus) {
        let done = self.with(|host| host.urb_abort_i(h.0, status));
        if !done {
            warn!("usbh: urb {} abort deferred to channel halt", h.0);
            while !self.urb_status(h).is_terminal() {
                core::hint::spin_loop();
            }
        }
    }

    /// Wait for a URB to complete, aborting it on timeout so no
    /// dangling hardware state remains. Returns the terminal status.
    pub fn urb_wait(&self, h: UrbHandle, timeout_ms: u32) -> UrbStatus {
        let mut deadline: Option<Deadline> = None;
        loop {
            let st = self.urb_status(h);
            if st.is_terminal() {
                return st;
            }
            let d = deadline.get_or_insert_with(|| Deadline::after_ms(timeout_ms));
            if d.is_expired() {
                self.abort_and_wait(h, UrbStatus::Timeout);
                return self.urb_status(h);
            }
            core::hint::spin_loop();
        }
    }

    /// Submit-and-wait composed: returns terminal status and byte count.
    ///
    /// # Safety
    ///
    /// as [`Self::urb_submit`]; the buffer must outlive this call,
    /// which the borrow in the safe wrappers guarantees.
    unsafe fn transfer_blocking(
        &self,
        ep: EpHandle,
        setup: Option<&SetupPacket>,
        buf: *mut u8,
        len: u32,
        timeout_ms: u32,
    ) -> (UrbStatus, usize) {
        let urb = match unsafe { self.urb_submit(ep, setup, buf, len, None, 0) } {
            Ok(u) => u,
            Err(UsbError::NoResources) => return (UrbStatus::Error, 0),
            Err(_) => return (UrbStatus::Error, 0),
        };
        let status = self.urb_wait(urb, timeout_ms);
        let actual = self.urb_actual(urb) as usize;
        self.urb_free(urb);
        (status, actual)
    }

    // ===== Synchronous helpers =====

    /// Blocking bulk/interrupt IN transfer.
    pub fn bulk_in(&self, ep: EpHandle, buf: &mut [u8], timeout_ms: u32) -> (UrbStatus, usize) {
        unsafe { self.transfer_blocking(ep, None, buf.as_mut_ptr(), buf.len() as u32, timeout_ms) }
    }

    /// Blocking bulk/interrupt OUT transfer.
    pub fn bulk_out(&self, ep: EpHandle, buf: &[u8], timeout_ms: u32) -> (UrbStatus, usize) {
        // The scheduler only reads OUT buffers.
        unsafe {
            self.transfer_blocking(
                ep,
                None,
                buf.as_ptr() as *mut u8,
                buf.len() as u32,
                timeout_ms,
            )
        }
    }

    /// Blocking control request with an IN or no data stage.
    pub fn control_request(
        &self,
        ep0: EpHandle,
        req: SetupPacket,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> (UrbStatus, usize) {
        debug_assert!(data.len() >= req.length as usize);
        unsafe {
            self.transfer_blocking(
                ep0,
                Some(&req),
                data.as_mut_ptr(),
                req.length as u32,
                timeout_ms,
            )
        }
    }

    /// Blocking control request with an OUT data stage.
    pub fn control_out(
        &self,
        ep0: EpHandle,
        req: SetupPacket,
        data: &[u8],
        timeout_ms: u32,
    ) -> (UrbStatus, usize) {
        debug_assert!(data.len() >= req.length as usize);
        unsafe {
            self.transfer_blocking(
                ep0,
                Some(&req),
                data.as_ptr() as *mut u8,
                req.length as u32,
                timeout_ms,
            )
        }
    }

    /// Control request without a data stage.
    pub fn control_nodata(&self, ep0: EpHandle, req: SetupPacket, timeout_ms: u32) -> UrbStatus {
        debug_assert_eq!(req.length, 0);
        unsafe {
            self.transfer_blocking(ep0, Some(&req), core::ptr::null_mut(), 0, timeout_ms)
                .0
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) followed by a local endpoint reset.
    pub fn clear_endpoint_halt(
        &self,
        ep0: EpHandle,
        ep: EpHandle,
        ep_address: u8,
    ) -> Result<()> {
        let st = self.control_nodata(
            ep0,
            SetupPacket::clear_endpoint_halt(ep_address),
            CONTROL_REQUEST_TIMEOUT_MS,
        );
        st.into_result()?;
        self.ep_reset(ep)
    }

    // ===== Main loop =====

    /// Cooperative processing entry: handles root-port status changes
    /// (debounce, reset, enumeration, class dispatch) and, when hub
    /// support is enabled, all external hub ports. Call this
    /// periodically from a thread; it performs its own bounded waits
    /// but never blocks indefinitely.
    pub fn main_loop(&self) {
        if self.state() != HostState::Started {
            return;
        }
        crate::port::process_root_port(self);
        #[cfg(feature = "hub")]
        crate::class::hub::process_hubs(self);
    }

    /// Free and assigned hardware channel counts; their sum is the
    /// fixed channel count at every observation point.
    pub fn channel_stats(&self) -> (usize, usize) {
        self.with(|h| (h.channels.free_count(), h.channels.assigned_count()))
    }

    // ===== Root hub plumbing (used by port.rs) =====

    /// Root port status/changed snapshot (wPortStatus/wPortChange
    /// layout)
    pub fn root_port_status(&self) -> (u16, u16) {
        self.with(|h| (h.root_status, h.root_c_status))
    }

    pub(crate) fn root_clear_change(&self, mask: u16) {
        self.with(|h| h.root_c_status &= !mask);
    }

    /// Drive a root-port reset: the timed HPRT reset pulse, including
    /// the recovery path for an OTG core stuck "enabled" without bus
    /// traffic (reset the core and re-start it).
    pub(crate) fn root_port_reset(&self) {
        let stuck = self.with(|h| {
            let hprt = h.bus.read(regs::HPRT);
            h.bus.write(regs::PCGCCTL, 0);
            hprt & regs::HPRT_PENA != 0
        });
        if stuck {
            warn!("usbh: enabled-but-dead port, resetting OTG core");
            self.with(|h| h.bus.write(regs::GAHBCFG, 0));
            timing::delay_ms(20);
            self.with(|h| h.start_controller());
            timing::delay_ms(100);
            self.with(|h| {
                if h.bus.read(regs::HPRT) & regs::HPRT_PCSTS != 0 {
                    // still connected: suppress the connection-change
                    // flag so enumeration is not aborted
                    h.root_c_status &= !crate::port::PORT_C_CONNECTION;
                }
            });
        }
        self.with(|h| {
            let hprt = h.bus.read(regs::HPRT)
                & !(regs::HPRT_PSUSP
                    | regs::HPRT_PENA
                    | regs::HPRT_PCDET
                    | regs::HPRT_PENCHNG
                    | regs::HPRT_POCCHNG);
            h.bus.write(regs::HPRT, hprt | regs::HPRT_PRST);
        });
        timing::delay_ms(15);
        self.with(|h| {
            let hprt = h.bus.read(regs::HPRT)
                & !(regs::HPRT_PSUSP
                    | regs::HPRT_PENA
                    | regs::HPRT_PCDET
                    | regs::HPRT_PENCHNG
                    | regs::HPRT_POCCHNG
                    | regs::HPRT_PRST);
            h.bus.write(regs::HPRT, hprt);
        });
        timing::delay_ms(10);
        self.with(|h| h.root_c_status |= crate::port::PORT_C_RESET);
    }
}

impl HostInner {
    /// Submit a URB with the lock held.
    ///
    /// A URB submitted to a halted endpoint completes as Stall; to a
    /// non-open endpoint or behind a disabled port as Disconnected.
    pub fn urb_submit_i(&mut self, urb_idx: u8) {
        debug_assert_eq!(self.urbs[urb_idx as usize].status, UrbStatus::Initialized);
        let ep_idx = self.urbs[urb_idx as usize].ep;
        match self.eps[ep_idx as usize].state {
            EpState::Halted => {
                self.complete_urb_detached(urb_idx, UrbStatus::Stall);
                return;
            }
            EpState::Open => {}
            _ => {
                self.complete_urb_detached(urb_idx, UrbStatus::Disconnected);
                return;
            }
        }
        if self.root_status & crate::port::PORT_ENABLE == 0 {
            warn!("usbh: submit with port disabled");
            self.complete_urb_detached(urb_idx, UrbStatus::Disconnected);
            return;
        }
        self.urbs[urb_idx as usize].status = UrbStatus::Pending;
        self.lld_submit(urb_idx);
    }

    /// Abort with the lock held. Returns true if the URB completed
    /// within this call.
    pub fn urb_abort_i(&mut self, urb_idx: u8, status: UrbStatus) -> bool {
        match self.urbs[urb_idx as usize].status {
            UrbStatus::Pending => self.lld_abort(urb_idx, status),
            _ => {
                // not owned by hardware: complete it here
                self.complete_urb_detached(urb_idx, status);
                true
            }
        }
    }

    /// Complete a URB that is not linked into an endpoint queue.
    pub(crate) fn complete_urb_detached(&mut self, urb_idx: u8, status: UrbStatus) {
        let urb = &mut self.urbs[urb_idx as usize];
        if urb.set_status(status) {
            if let Some(cb) = urb.callback {
                cb(UrbHandle(urb_idx), status, urb.actual, urb.cb_arg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_bitmap_allocates_lowest_free_and_frees_once() {
        let mut h = HostInner::new(unsafe { OtgBus::new(0x1000) });
        let a = h.alloc_address().unwrap();
        let b = h.alloc_address().unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(h.address_in_use(1) && h.address_in_use(2));
        h.free_address(1);
        assert!(!h.address_in_use(1));
        // freed address becomes the next allocation
        assert_eq!(h.alloc_address().unwrap(), 1);
    }

    #[test]
    fn address_bitmap_never_double_assigns() {
        let mut h = HostInner::new(unsafe { OtgBus::new(0x1000) });
        let mut seen = [false; MAX_ADDRESSES + 1];
        while let Some(a) = h.alloc_address() {
            assert!(!seen[a as usize], "address {} assigned twice", a);
            seen[a as usize] = true;
        }
        // exhausted: exactly MAX_ADDRESSES handed out
        assert_eq!(seen.iter().filter(|&&s| s).count(), MAX_ADDRESSES);
        // free all, each exactly once
        for a in 1..=MAX_ADDRESSES as u8 {
            h.free_address(a);
        }
        assert_eq!(h.alloc_address().unwrap(), 1);
    }
}
