//! Channel scheduler and interrupt service
//!
//! Binds logical endpoints to the OTG core's hardware channels and
//! pumps the packet FIFOs. Endpoints with queued URBs wait in per-type
//! pending lists; activation pops a free channel from the matching
//! pool (periodic for isochronous/interrupt, non-periodic for
//! control/bulk), programs the transfer registers, and moves the
//! endpoint to the active list. Non-periodic endpoints are committed
//! control-first, then bulk; periodic endpoints are re-armed from the
//! start-of-frame interrupt when their frame counter reaches the
//! polling interval.
//!
//! Every function here runs with the system lock held.

use log::{debug, error, info, warn};

use crate::host::HostInner;
use crate::otg::channel::HaltReason;
use crate::otg::regs as r;
use crate::urb::{CtrlPhase, EpQueue, EpState, EpType, UrbHandle, UrbStatus};

/// Transaction errors tolerated before a transfer fails
pub const MAX_TRANSACTION_ERRORS: u8 = 3;

/// Bounded spin for self-clearing reset/flush bits
const RESET_SPIN_LIMIT: u32 = 100_000;

impl HostInner {
    // ===== queue bookkeeping =====

    fn list_remove(list: &mut heapless::Vec<u8, { crate::host::MAX_ENDPOINTS }>, ep: u8) {
        if let Some(pos) = list.iter().position(|&e| e == ep) {
            list.remove(pos);
        }
    }

    pub(crate) fn remove_from_queues(&mut self, ep_idx: u8) {
        let ty = self.eps[ep_idx as usize].ep_type as usize;
        Self::list_remove(&mut self.pending[ty], ep_idx);
        Self::list_remove(&mut self.active[ty], ep_idx);
        self.eps[ep_idx as usize].queue = EpQueue::None;
    }

    fn move_to_pending(&mut self, ep_idx: u8) {
        self.remove_from_queues(ep_idx);
        let ty = self.eps[ep_idx as usize].ep_type as usize;
        self.pending[ty].push(ep_idx).ok();
        self.eps[ep_idx as usize].queue = EpQueue::Pending;
    }

    fn move_to_active(&mut self, ep_idx: u8) {
        self.remove_from_queues(ep_idx);
        let ty = self.eps[ep_idx as usize].ep_type as usize;
        self.active[ty].push(ep_idx).ok();
        self.eps[ep_idx as usize].queue = EpQueue::Active;
    }

    fn active_urb(&self, ep_idx: u8) -> Option<u8> {
        self.eps[ep_idx as usize].urbs.front().copied()
    }

    fn remove_urb_from_ep(&mut self, ep_idx: u8, urb_idx: u8) {
        let ep = &mut self.eps[ep_idx as usize];
        let mut rest: heapless::Deque<u8, { crate::urb::MAX_URBS_PER_EP }> = heapless::Deque::new();
        while let Some(u) = ep.urbs.pop_front() {
            if u != urb_idx {
                rest.push_back(u).ok();
            }
        }
        ep.urbs = rest;
    }

    /// Complete the given URB of an endpoint and update the endpoint's
    /// queue membership: endpoints with more work return to pending,
    /// idle endpoints leave the scheduler.
    fn transfer_completed(&mut self, ep_idx: u8, urb_idx: u8, status: UrbStatus) {
        self.urbs[urb_idx as usize].queued = false;
        self.remove_urb_from_ep(ep_idx, urb_idx);

        let urb = &mut self.urbs[urb_idx as usize];
        if urb.set_status(status) {
            if let Some(cb) = urb.callback {
                cb(UrbHandle(urb_idx), status, urb.actual, urb.cb_arg);
            }
        }

        if self.eps[ep_idx as usize].urbs.is_empty() {
            self.remove_from_queues(ep_idx);
        } else {
            self.move_to_pending(ep_idx);
        }
    }

    // ===== channel management =====

    /// Request a halt. The channel keeps running until the core raises
    /// the channel-halted interrupt; `reason` selects the completion
    /// path there. A halt already in flight is never re-requested.
    fn halt_channel(&mut self, ch: u8, reason: HaltReason) {
        let rec = &mut self.channels.records[ch as usize];
        if rec.halt_reason != HaltReason::None {
            warn!(
                "usbh: ch{} repeated halt ({:?} -> {:?})",
                ch, rec.halt_reason, reason
            );
            return;
        }
        rec.halt_reason = reason;
        let hcchar = self.bus.hc(ch, r::HCCHAR);
        self.bus
            .set_bits(hcchar, r::HCCHAR_CHENA | r::HCCHAR_CHDIS);
    }

    /// Unbind a halted channel from its endpoint and return it to the
    /// free pool. Channel release always precedes URB completion.
    fn release_channel(&mut self, ch: u8) {
        self.bus.write(self.bus.hc(ch, r::HCINTMSK), 0);
        self.bus.clear_bits(r::HAINTMSK, 1 << ch);
        if let Some(ep_idx) = self.channels.records[ch as usize].ep {
            self.eps[ep_idx as usize].channel = None;
        }
        self.channels.release(ch);
    }

    /// Per-type channel interrupt mask, from the interrupt/endpoint
    /// condition matrix of the OTG core.
    fn ep_hcintmsk(&self, ep_idx: u8) -> u32 {
        let ep = &self.eps[ep_idx as usize];
        let mut msk = r::HCINT_CHH | r::HCINT_XFRC | r::HCINT_AHBERR;
        match ep.ep_type {
            EpType::Isochronous => {
                msk |= r::HCINT_FRMOR;
                if ep.dir_in {
                    msk |= r::HCINT_TXERR | r::HCINT_BBERR;
                }
            }
            EpType::Interrupt => {
                msk |= r::HCINT_TXERR | r::HCINT_FRMOR | r::HCINT_STALL | r::HCINT_NAK;
                if ep.dir_in {
                    msk |= r::HCINT_DTERR | r::HCINT_BBERR;
                }
            }
            EpType::Control => {
                msk |= r::HCINT_TXERR | r::HCINT_STALL | r::HCINT_NAK;
                if ep.dir_in {
                    msk |= r::HCINT_DTERR | r::HCINT_BBERR;
                }
            }
            EpType::Bulk => {
                msk |= r::HCINT_TXERR | r::HCINT_STALL | r::HCINT_NAK;
                if ep.dir_in {
                    msk |= r::HCINT_DTERR | r::HCINT_BBERR;
                }
            }
        }
        msk
    }

    fn ep_hcchar(&self, ep_idx: u8) -> u32 {
        let ep = &self.eps[ep_idx as usize];
        r::HCCHAR_CHENA
            | r::hcchar_dad(ep.dev_addr as u32)
            | r::hcchar_mcnt(1)
            | r::hcchar_eptyp(ep.ep_type as u32)
            | if ep.low_speed { r::HCCHAR_LSDEV } else { 0 }
            | if ep.dir_in { r::HCCHAR_EPDIR } else { 0 }
            | r::hcchar_epnum(ep.number as u32)
            | r::hcchar_mps(ep.max_packet_size as u32)
    }

    /// Bind a free channel to the endpoint's front URB and arm it.
    ///
    /// Fails benignly (endpoint stays pending) when the matching pool
    /// is empty or the core's request queue is out of space.
    fn activate_ep(&mut self, ep_idx: u8) -> bool {
        debug_assert!(self.eps[ep_idx as usize].channel.is_none());
        let periodic = self.eps[ep_idx as usize].ep_type.is_periodic();

        let txsts = self
            .bus
            .read(if periodic { r::HPTXSTS } else { r::HNPTXSTS });
        let mut spc = (txsts & r::TXSTS_QSAV_MASK) >> r::TXSTS_QSAV_SHIFT;

        if spc <= r::MIN_QSPACE {
            warn!(
                "usbh: ep{} no space in {} queue (spc={})",
                ep_idx,
                if periodic { "P" } else { "NP" },
                spc
            );
            return false;
        }

        let Some(ch) = self.channels.alloc(periodic, ep_idx) else {
            warn!(
                "usbh: ep{} no free {} channels",
                ep_idx,
                if periodic { "P" } else { "NP" }
            );
            return false;
        };

        let Some(urb_idx) = self.active_urb(ep_idx) else {
            // nothing to do after all; undo the binding
            self.channels.release(ch);
            return false;
        };
        debug_assert_eq!(self.urbs[urb_idx as usize].status, UrbStatus::Pending);

        // Stage the transfer window for this channel round.
        let (requested, actual, queued, setup_ptr) = {
            let urb = &mut self.urbs[urb_idx as usize];
            (
                urb.requested,
                urb.actual,
                urb.queued,
                urb.setup.as_mut_ptr(),
            )
        };
        let mut xfer_len: u32;
        {
            let ep = &mut self.eps[ep_idx as usize];
            if !queued {
                // fresh URB
                if ep.ep_type == EpType::Control {
                    xfer_len = 8;
                    ep.xfer.buf = setup_ptr;
                    ep.dt_pid = r::HCTSIZ_DPID_SETUP;
                    ep.dir_in = false;
                    ep.xfer.ctrl_phase = CtrlPhase::Setup;
                } else {
                    xfer_len = requested;
                    ep.xfer.buf = self.urbs[urb_idx as usize].buf;
                }
                ep.xfer.error_count = 0;
            } else {
                debug_assert!(requested >= actual);
                if ep.ep_type == EpType::Control {
                    match ep.xfer.ctrl_phase {
                        CtrlPhase::Setup => {
                            xfer_len = 8;
                            ep.xfer.buf = setup_ptr;
                            ep.dt_pid = r::HCTSIZ_DPID_SETUP;
                        }
                        CtrlPhase::Data => {
                            xfer_len = requested - actual;
                            ep.xfer.buf =
                                unsafe { self.urbs[urb_idx as usize].buf.add(actual as usize) };
                        }
                        CtrlPhase::Status => {
                            xfer_len = 0;
                            ep.dt_pid = r::HCTSIZ_DPID_DATA1;
                            ep.xfer.error_count = 0;
                        }
                    }
                } else {
                    xfer_len = requested - actual;
                    ep.xfer.buf = unsafe { self.urbs[urb_idx as usize].buf.add(actual as usize) };
                }
            }
        }

        // interrupt mask depends on the (possibly phase-updated)
        // direction, so compute it after the staging above
        let mut hcintmsk = self.ep_hcintmsk(ep_idx);
        let ep = &mut self.eps[ep_idx as usize];
        if ep.xfer.error_count > 0 {
            hcintmsk |= r::HCINT_ACK;
        }
        ep.xfer.partial = 0;

        let mps = ep.max_packet_size as u32;
        if ep.ep_type == EpType::Isochronous {
            ep.dt_pid = r::HCTSIZ_DPID_DATA0;
            // one transaction per (micro)frame unless high-bandwidth
            if xfer_len > mps {
                xfer_len = mps;
            }
        } else if xfer_len > r::HCTSIZ_XFRSIZ_MASK {
            xfer_len = r::HCTSIZ_XFRSIZ_MASK - mps + 1;
        }

        let mut xfer_packets: u32;
        if xfer_len > 0 {
            xfer_packets = (xfer_len + mps - 1) / mps;
            if xfer_packets > 0x3FF {
                xfer_packets = 0x3FF;
                xfer_len = xfer_packets * mps;
            }
        } else {
            xfer_packets = 1; // zero-length transfers still need a packet
        }
        if ep.dir_in {
            xfer_len = xfer_packets * mps;
        }

        let dir_in = ep.dir_in;
        let dt_pid = ep.dt_pid;
        ep.xfer.len = xfer_len;
        ep.xfer.packets = xfer_packets as u16;
        ep.channel = Some(ch);

        let hcchar_base = self.ep_hcchar(ep_idx);

        self.bus.write(self.bus.hc(ch, r::HCINT), 0xFFFF_FFFF);
        self.bus.write(
            self.bus.hc(ch, r::HCTSIZ),
            dt_pid | r::hctsiz_pktcnt(xfer_packets) | r::hctsiz_xfrsiz(xfer_len),
        );
        self.bus.write(self.bus.hc(ch, r::HCINTMSK), hcintmsk);

        // queue periodic transfers for the next (odd/even) frame
        let mut hcchar = hcchar_base;
        if self.bus.read(r::HFNUM) & 1 == 0 {
            hcchar |= r::HCCHAR_ODDFRM;
        }
        self.bus.write(self.bus.hc(ch, r::HCCHAR), hcchar);
        if dir_in && xfer_packets > 1 {
            // queue two back-to-back IN requests when space allows
            spc -= 1;
            if spc > r::MIN_QSPACE {
                self.bus.set_bits(self.bus.hc(ch, r::HCCHAR), r::HCCHAR_CHENA);
            } else {
                warn!("usbh: ep{} could not queue back-to-back packets", ep_idx);
            }
        }

        {
            let urb = &mut self.urbs[urb_idx as usize];
            if !urb.queued {
                urb.queued = true;
                debug!("usbh: ep{} start ({}B)", ep_idx, xfer_len);
            } else {
                debug!("usbh: ep{} restart ({}B)", ep_idx, xfer_len);
            }
        }

        self.move_to_active(ep_idx);

        self.bus.set_bits(r::HAINTMSK, 1 << ch);
        if dir_in {
            self.bus.set_bits(r::GINTMSK, r::GINTSTS_HCINT);
        } else if periodic {
            self.bus
                .set_bits(r::GINTMSK, r::GINTSTS_HCINT | r::GINTSTS_PTXFE);
        } else {
            self.bus
                .set_bits(r::GINTMSK, r::GINTSTS_HCINT | r::GINTSTS_NPTXFE);
        }

        true
    }

    /// Account transferred bytes after a channel stopped; returns true
    /// when the URB is done (full length moved, or a short IN packet
    /// ended the transfer early).
    fn update_urb(&mut self, ep_idx: u8, urb_idx: u8, hctsiz: u32, completed: bool) -> bool {
        let ep = &self.eps[ep_idx as usize];
        let len = if !completed {
            ep.max_packet_size as u32
                * (ep.xfer.packets as u32 - ((hctsiz & r::HCTSIZ_PKTCNT_MASK) >> r::HCTSIZ_PKTCNT_SHIFT))
        } else if ep.dir_in {
            ep.xfer.len - (hctsiz & r::HCTSIZ_XFRSIZ_MASK)
        } else {
            ep.xfer.len
        };

        let dir_in = ep.dir_in;
        let urb = &mut self.urbs[urb_idx as usize];
        if urb.actual + len > urb.requested {
            error!(
                "usbh: ep{} trimming actual {} -> {}",
                ep_idx,
                urb.actual + len,
                urb.requested
            );
            urb.actual = urb.requested;
            return true;
        }
        urb.actual += len;

        urb.actual == urb.requested
            || (dir_in && completed && (hctsiz & r::HCTSIZ_XFRSIZ_MASK) != 0)
    }

    fn save_dt_pid(&mut self, ep_idx: u8, hctsiz: u32) {
        self.eps[ep_idx as usize].dt_pid = hctsiz & r::HCTSIZ_DPID_MASK;
    }

    // ===== commit =====

    /// Arm as many non-periodic endpoints as resources allow, control
    /// endpoints before bulk.
    pub(crate) fn try_commit_np(&mut self) {
        for ty in [EpType::Control as usize, EpType::Bulk as usize] {
            while let Some(&ep_idx) = self.pending[ty].first() {
                if !self.activate_ep(ep_idx) {
                    return;
                }
            }
        }
    }

    /// Arm periodic endpoints: isochronous unconditionally, interrupt
    /// endpoints when their frame counter expires.
    pub(crate) fn try_commit_p(&mut self, sof: bool) {
        while let Some(&ep_idx) = self.pending[EpType::Isochronous as usize].first() {
            if !self.activate_ep(ep_idx) {
                return;
            }
        }

        let snapshot = self.pending[EpType::Interrupt as usize].clone();
        for ep_idx in snapshot {
            if self.eps[ep_idx as usize].queue != EpQueue::Pending {
                continue;
            }
            if sof && self.eps[ep_idx as usize].xfer.frame_counter > 0 {
                self.eps[ep_idx as usize].xfer.frame_counter -= 1;
            }
            if self.eps[ep_idx as usize].xfer.frame_counter == 0 {
                if !self.activate_ep(ep_idx) {
                    return;
                }
                let interval = self.eps[ep_idx as usize].interval;
                self.eps[ep_idx as usize].xfer.frame_counter = interval;
            }
        }

        if self.pending[EpType::Isochronous as usize].is_empty()
            && self.pending[EpType::Interrupt as usize].is_empty()
        {
            self.bus.clear_bits(r::GINTMSK, r::GINTSTS_SOF);
        } else {
            self.bus.set_bits(r::GINTMSK, r::GINTSTS_SOF);
        }
    }

    // ===== purge on disconnect =====

    fn purge_list(&mut self, queue: EpQueue, ty: usize) {
        loop {
            let list = if queue == EpQueue::Active {
                &self.active[ty]
            } else {
                &self.pending[ty]
            };
            let Some(&ep_idx) = list.first() else { break };

            if let Some(ch) = self.eps[ep_idx as usize].channel {
                warn!(
                    "usbh: ep{} had channel {} assigned ({:?})",
                    ep_idx, ch, self.channels.records[ch as usize].halt_reason
                );
                let hctsiz = self.bus.read(self.bus.hc(ch, r::HCTSIZ));
                self.release_channel(ch);
                if let Some(urb_idx) = self.active_urb(ep_idx) {
                    self.update_urb(ep_idx, urb_idx, hctsiz, false);
                }
            }
            // force-complete every queued URB of this endpoint
            while let Some(urb_idx) = self.active_urb(ep_idx) {
                warn!("usbh: ep{} abort urb {}, disconnected", ep_idx, urb_idx);
                self.transfer_completed(ep_idx, urb_idx, UrbStatus::Disconnected);
            }
            self.remove_from_queues(ep_idx);
        }
    }

    pub(crate) fn purge_active(&mut self) {
        for ty in 0..4 {
            self.purge_list(EpQueue::Active, ty);
        }
    }

    pub(crate) fn purge_pending(&mut self) {
        for ty in 0..4 {
            self.purge_list(EpQueue::Pending, ty);
        }
    }

    // ===== FIFO pump =====

    /// Write at most one packet per endpoint of `ty`'s active list into
    /// the TX FIFO; returns the bytes still owed after the pass.
    fn write_packets(&mut self, ty: usize, mut space_words: u32) -> u32 {
        let list = self.active[ty].clone();
        let mut remaining: u32 = 0;

        for ep_idx in list {
            let ep = &self.eps[ep_idx as usize];
            let Some(ch) = ep.channel else { continue };
            if ep.dir_in || self.channels.records[ch as usize].halt_reason != HaltReason::None {
                continue;
            }
            let rem = ep.xfer.len.saturating_sub(ep.xfer.partial);
            if rem == 0 {
                continue;
            }
            remaining += rem;

            if space_words == 0 {
                break;
            }

            let packet = rem.min(ep.max_packet_size as u32);
            let mut words = (packet + 3) / 4;
            if words > space_words {
                words = space_words;
            }
            space_words -= words;
            let mut written = words * 4;
            if written > packet {
                written = packet;
            }

            debug!(
                "usbh: ep{} fifo write {} words ({}B), partial={}",
                ep_idx,
                words,
                written,
                ep.xfer.partial
            );

            let src = self.eps[ep_idx as usize].xfer.buf;
            for w in 0..words {
                // OUT buffers may not be word-aligned or word-sized;
                // assemble each FIFO word byte-wise
                let mut word = 0u32;
                for b in 0..4 {
                    let off = (w * 4 + b) as usize;
                    if (off as u32) < written {
                        word |= (unsafe { *src.add(off) } as u32) << (8 * b);
                    }
                }
                self.bus.fifo_write(ch, word);
            }

            let ep = &mut self.eps[ep_idx as usize];
            ep.xfer.buf = unsafe { ep.xfer.buf.add(written as usize) };
            ep.xfer.partial += written;
            remaining -= written;
        }

        remaining
    }

    // ===== low-level submit/abort =====

    pub(crate) fn lld_submit(&mut self, urb_idx: u8) {
        let ep_idx = self.urbs[urb_idx as usize].ep;

        if self.bus.read(r::HPRT) & r::HPRT_PENA == 0 {
            warn!("usbh: ep{} can't submit, port disabled", ep_idx);
            self.complete_urb_detached(urb_idx, UrbStatus::Disconnected);
            return;
        }

        if self.eps[ep_idx as usize].urbs.push_back(urb_idx).is_err() {
            warn!("usbh: ep{} urb queue full", ep_idx);
            self.complete_urb_detached(urb_idx, UrbStatus::Error);
            return;
        }

        if self.eps[ep_idx as usize].queue == EpQueue::None {
            self.move_to_pending(ep_idx);
            if self.eps[ep_idx as usize].ep_type.is_periodic() {
                self.bus.set_bits(r::GINTMSK, r::GINTSTS_SOF);
            } else {
                self.try_commit_np();
            }
        }
    }

    /// Abort a pending URB. Returns true when the URB completed within
    /// this call; false when the channel halt was requested and the
    /// channel-halted interrupt will finish the job.
    pub(crate) fn lld_abort(&mut self, urb_idx: u8, status: UrbStatus) -> bool {
        let ep_idx = self.urbs[urb_idx as usize].ep;
        let ep = &self.eps[ep_idx as usize];

        if let Some(ch) = ep.channel {
            if self.active_urb(ep_idx) == Some(urb_idx) {
                if self.channels.records[ch as usize].halt_reason == HaltReason::None {
                    info!("usbh: ep{} abort: halting channel {}", ep_idx, ch);
                    self.urbs[urb_idx as usize].abort_status = status;
                    self.halt_channel(ch, HaltReason::Abort);
                } else {
                    // already halting; the halt interrupt completes the
                    // URB, though with the original status
                    info!("usbh: ep{} abort: channel already halting", ep_idx);
                }
                return false;
            }
        }

        info!("usbh: ep{} abort: urb {} not active", ep_idx, urb_idx);
        self.transfer_completed(ep_idx, urb_idx, status);
        true
    }

    // ===== completion paths =====

    fn complete_bulk_int(&mut self, ch: u8, ep_idx: u8, urb_idx: u8, hctsiz: u32) {
        self.release_channel(ch);
        self.save_dt_pid(ep_idx, hctsiz);
        if self.update_urb(ep_idx, urb_idx, hctsiz, true) {
            debug!("usbh: ep{} done", ep_idx);
            self.transfer_completed(ep_idx, urb_idx, UrbStatus::Ok);
        } else {
            // transfer larger than one channel round; re-queue
            warn!("usbh: ep{} incomplete", ep_idx);
            self.move_to_pending(ep_idx);
        }
        if self.eps[ep_idx as usize].ep_type.is_periodic() {
            self.try_commit_p(false);
        } else {
            self.try_commit_np();
        }
    }

    fn complete_control(&mut self, ch: u8, ep_idx: u8, urb_idx: u8, hctsiz: u32) {
        debug_assert!(self.eps[ep_idx as usize].xfer.ctrl_phase != CtrlPhase::Setup);
        self.release_channel(ch);
        if self.eps[ep_idx as usize].xfer.ctrl_phase == CtrlPhase::Data {
            if self.update_urb(ep_idx, urb_idx, hctsiz, true) {
                debug!("usbh: ep{} DATA done", ep_idx);
                let ep = &mut self.eps[ep_idx as usize];
                ep.xfer.ctrl_phase = CtrlPhase::Status;
                ep.dir_in = !ep.dir_in;
            } else {
                warn!("usbh: ep{} DATA incomplete", ep_idx);
                self.save_dt_pid(ep_idx, hctsiz);
            }
            self.move_to_pending(ep_idx);
        } else {
            debug!("usbh: ep{} STATUS done", ep_idx);
            self.transfer_completed(ep_idx, urb_idx, UrbStatus::Ok);
        }
        self.try_commit_np();
    }

    fn complete_control_setup(&mut self, ch: u8, ep_idx: u8, urb_idx: u8) {
        self.release_channel(ch);
        let requested = self.urbs[urb_idx as usize].requested;
        let setup_in = self.urbs[urb_idx as usize].setup[0] & 0x80 != 0;
        let ep = &mut self.eps[ep_idx as usize];
        if requested > 0 {
            debug!("usbh: ep{} SETUP done -> DATA", ep_idx);
            ep.xfer.ctrl_phase = CtrlPhase::Data;
            ep.dir_in = setup_in;
            ep.dt_pid = r::HCTSIZ_DPID_DATA1;
            ep.xfer.error_count = 0;
        } else {
            debug!("usbh: ep{} SETUP done -> STATUS", ep_idx);
            ep.dir_in = true;
            ep.xfer.ctrl_phase = CtrlPhase::Status;
        }
        self.move_to_pending(ep_idx);
        self.try_commit_np();
    }

    fn complete_iso(&mut self, ch: u8, ep_idx: u8, urb_idx: u8, hctsiz: u32) {
        debug!("usbh: ep{} iso done", ep_idx);
        self.release_channel(ch);
        self.update_urb(ep_idx, urb_idx, hctsiz, true);
        self.transfer_completed(ep_idx, urb_idx, UrbStatus::Ok);
        self.try_commit_p(false);
    }

    // ===== per-channel interrupt conditions =====

    fn hcint_channel(&mut self, ch: u8) {
        let hcint_reg = self.bus.hc(ch, r::HCINT);
        let mut hcint = self.bus.read(hcint_reg);
        hcint &= self.bus.read(self.bus.hc(ch, r::HCINTMSK));
        self.bus.write(hcint_reg, hcint);

        debug_assert!(hcint & r::HCINT_AHBERR == 0);
        let Some(ep_idx) = self.channels.records[ch as usize].ep else {
            return;
        };

        if hcint & r::HCINT_STALL != 0 {
            // STALL halts the endpoint; the completion path runs on CHH
            debug_assert!(self.eps[ep_idx as usize].ep_type != EpType::Isochronous);
            self.bus
                .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_STALL);
            self.halt_channel(ch, HaltReason::Stall);
            warn!("usbh: ep{} STALL", ep_idx);
        }
        if hcint & r::HCINT_NAK != 0 {
            let ep = &self.eps[ep_idx as usize];
            debug_assert!(ep.ep_type != EpType::Isochronous);
            if !ep.dir_in || ep.ep_type == EpType::Interrupt {
                self.bus
                    .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_NAK);
                self.halt_channel(ch, HaltReason::Nak);
            } else {
                // IN control/bulk: restart directly, no halt needed
                self.eps[ep_idx as usize].xfer.error_count = 0;
                self.bus
                    .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_ACK);
                self.bus
                    .set_bits(self.bus.hc(ch, r::HCCHAR), r::HCCHAR_CHENA);
            }
            debug!("usbh: ep{} NAK", ep_idx);
        }
        if hcint & r::HCINT_ACK != 0 {
            // a successful handshake ends the error-retry window
            self.eps[ep_idx as usize].xfer.error_count = 0;
            self.bus
                .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_ACK);
            debug!("usbh: ep{} ACK", ep_idx);
        }
        if hcint & r::HCINT_TXERR != 0 {
            self.bus
                .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_TXERR);
            self.eps[ep_idx as usize].xfer.error_count += 1;
            self.halt_channel(ch, HaltReason::Error);
            error!("usbh: ep{} TXERR", ep_idx);
        }
        if hcint & r::HCINT_BBERR != 0 {
            debug_assert!(self.eps[ep_idx as usize].dir_in);
            self.bus
                .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_BBERR);
            // babble is not recoverable; force the error count to the
            // limit so the halt path fails the transfer
            self.eps[ep_idx as usize].xfer.error_count = MAX_TRANSACTION_ERRORS;
            self.halt_channel(ch, HaltReason::Error);
            error!("usbh: ep{} BBERR", ep_idx);
        }
        if hcint & r::HCINT_FRMOR != 0 {
            debug_assert!(self.eps[ep_idx as usize].ep_type.is_periodic());
            self.bus
                .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_FRMOR);
            self.eps[ep_idx as usize].xfer.error_count = MAX_TRANSACTION_ERRORS;
            self.halt_channel(ch, HaltReason::Error);
            error!("usbh: ep{} FRMOR", ep_idx);
        }
        if hcint & r::HCINT_DTERR != 0 {
            debug_assert!(self.eps[ep_idx as usize].dir_in);
            // restart directly; the next IN retries with the right PID
            self.eps[ep_idx as usize].xfer.error_count = 0;
            self.bus
                .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_ACK);
            self.bus
                .set_bits(self.bus.hc(ch, r::HCCHAR), r::HCCHAR_CHENA);
            error!("usbh: ep{} DTERR", ep_idx);
        }
        if hcint & r::HCINT_XFRC != 0 {
            self.xfrc_int(ch, ep_idx);
        }
        if hcint & r::HCINT_CHH != 0 {
            self.chh_int(ch, ep_idx);
        }
    }

    fn xfrc_int(&mut self, ch: u8, ep_idx: u8) {
        let Some(urb_idx) = self.active_urb(ep_idx) else {
            return;
        };
        let hctsiz = self.bus.read(self.bus.hc(ch, r::HCTSIZ));
        self.bus
            .clear_bits(self.bus.hc(ch, r::HCINTMSK), r::HCINT_XFRC);

        let ep_type = self.eps[ep_idx as usize].ep_type;
        let dir_in = self.eps[ep_idx as usize].dir_in;
        match ep_type {
            EpType::Control => {
                if self.eps[ep_idx as usize].xfer.ctrl_phase == CtrlPhase::Setup {
                    self.complete_control_setup(ch, ep_idx, urb_idx);
                } else if dir_in {
                    // IN data drains through the RX FIFO; wait for halt
                    self.halt_channel(ch, HaltReason::TransferComplete);
                } else {
                    self.complete_control(ch, ep_idx, urb_idx, hctsiz);
                }
            }
            EpType::Bulk => {
                if dir_in {
                    self.halt_channel(ch, HaltReason::TransferComplete);
                } else {
                    self.complete_bulk_int(ch, ep_idx, urb_idx, hctsiz);
                }
            }
            EpType::Interrupt => {
                if dir_in && hctsiz & r::HCTSIZ_PKTCNT_MASK != 0 {
                    self.halt_channel(ch, HaltReason::TransferComplete);
                } else {
                    self.complete_bulk_int(ch, ep_idx, urb_idx, hctsiz);
                }
            }
            EpType::Isochronous => {
                if dir_in && hctsiz & r::HCTSIZ_PKTCNT_MASK != 0 {
                    self.halt_channel(ch, HaltReason::TransferComplete);
                } else {
                    self.complete_iso(ch, ep_idx, urb_idx, hctsiz);
                }
            }
        }
    }

    fn chh_int(&mut self, ch: u8, ep_idx: u8) {
        let Some(urb_idx) = self.active_urb(ep_idx) else {
            return;
        };
        let hctsiz = self.bus.read(self.bus.hc(ch, r::HCTSIZ));
        let reason = self.channels.records[ch as usize].halt_reason;

        if reason == HaltReason::None {
            warn!("usbh: ch{} spurious halt", ch);
            return;
        }

        if reason == HaltReason::TransferComplete {
            debug_assert!(self.eps[ep_idx as usize].dir_in);
            match self.eps[ep_idx as usize].ep_type {
                EpType::Control => self.complete_control(ch, ep_idx, urb_idx, hctsiz),
                EpType::Bulk | EpType::Interrupt => {
                    self.complete_bulk_int(ch, ep_idx, urb_idx, hctsiz)
                }
                EpType::Isochronous => self.complete_iso(ch, ep_idx, urb_idx, hctsiz),
            }
            return;
        }

        self.release_channel(ch);
        self.save_dt_pid(ep_idx, hctsiz);
        let done = self.update_urb(ep_idx, urb_idx, hctsiz, false);
        let ep_type = self.eps[ep_idx as usize].ep_type;
        let dir_in = self.eps[ep_idx as usize].dir_in;

        match reason {
            HaltReason::Nak => {
                if ep_type == EpType::Interrupt && dir_in {
                    // no data this polling interval
                    self.transfer_completed(ep_idx, urb_idx, UrbStatus::Timeout);
                } else {
                    self.eps[ep_idx as usize].xfer.error_count = 0;
                    self.move_to_pending(ep_idx);
                }
            }
            HaltReason::Stall => {
                if ep_type == EpType::Control {
                    if self.eps[ep_idx as usize].xfer.ctrl_phase == CtrlPhase::Setup {
                        error!("usbh: ep{} faulty device: STALLed SETUP phase", ep_idx);
                    }
                } else {
                    self.eps[ep_idx as usize].state = EpState::Halted;
                }
                self.transfer_completed(ep_idx, urb_idx, UrbStatus::Stall);
            }
            HaltReason::Error => {
                let errors = self.eps[ep_idx as usize].xfer.error_count;
                if ep_type == EpType::Isochronous || done || errors >= MAX_TRANSACTION_ERRORS {
                    self.transfer_completed(ep_idx, urb_idx, UrbStatus::Error);
                } else {
                    error!("usbh: ep{} err={} retry", ep_idx, errors);
                    self.move_to_pending(ep_idx);
                }
            }
            HaltReason::Abort => {
                warn!("usbh: ep{} abort complete", ep_idx);
                let status = self.urbs[urb_idx as usize].abort_status;
                self.transfer_completed(ep_idx, urb_idx, status);
            }
            HaltReason::None | HaltReason::TransferComplete => unreachable!(),
        }

        if ep_type.is_periodic() {
            self.try_commit_p(false);
        } else {
            self.try_commit_np();
        }
    }

    fn hcint_int(&mut self) {
        let mut haint = self.bus.read(r::HAINT);
        haint &= self.bus.read(r::HAINTMSK);
        for ch in 0..crate::otg::channel::NUM_CHANNELS as u8 {
            if haint == 0 {
                break;
            }
            if haint & (1 << ch) != 0 {
                self.hcint_channel(ch);
                haint &= !(1 << ch);
            }
        }
    }

    // ===== global interrupts =====

    fn sof_int(&mut self) {
        if self.check_ls_activity {
            // Low-speed workaround for the OTG core: after a low-speed
            // port enable the core sometimes generates no keep-alives
            // even though HPRT reports enabled. Sample the D+/D- line
            // state in a short window at the top of the frame; only
            // report the port enabled once real activity shows up.
            // Hardware erratum handling; re-validate on other silicon.
            let remaining = self.bus.read(r::HFNUM) >> 16;
            if remaining < 5975 {
                warn!("usbh: ls-check: isr too late (time={})", 6000 - remaining);
                return;
            }
            loop {
                let line_status = self.bus.read(r::HPRT) & r::HPRT_PLSTS_MASK;
                let remaining = self.bus.read(r::HFNUM) >> 16;
                if self.bus.read(r::HPRT) & r::HPRT_PENA == 0 {
                    warn!("usbh: ls-check: port disabled");
                    return;
                }
                if line_status != r::HPRT_PLSTS_DM {
                    info!(
                        "usbh: ls-check: activity, line={}, time={}",
                        line_status >> 10,
                        6000 - remaining
                    );
                    self.check_ls_activity = false;
                    self.bus.modify(r::GINTMSK, |m| {
                        (m & !r::GINTSTS_SOF) | (r::GINTSTS_HCINT | r::GINTSTS_RXFLVL)
                    });
                    self.root_status |= crate::port::PORT_ENABLE;
                    self.root_c_status |= crate::port::PORT_C_ENABLE;
                    return;
                }
                if remaining < 5910 {
                    debug!("usbh: ls-check: no activity");
                    return;
                }
            }
        }

        self.try_commit_p(true);
    }

    fn rxflvl_int(&mut self) {
        self.bus.clear_bits(r::GINTMSK, r::GINTSTS_RXFLVL);
        while self.bus.read(r::GINTSTS) & r::GINTSTS_RXFLVL != 0 {
            let grxstsp = self.bus.read(r::GRXSTSP);
            let ch = (grxstsp & r::GRXSTSP_CHNUM_MASK) as u8;
            if ch as usize >= crate::otg::channel::NUM_CHANNELS {
                continue;
            }
            let hctsiz = self.bus.read(self.bus.hc(ch, r::HCTSIZ));

            if (grxstsp & r::GRXSTSP_PKTSTS_MASK) >> r::GRXSTSP_PKTSTS_SHIFT == r::PKTSTS_IN_DATA {
                let Some(ep_idx) = self.channels.records[ch as usize].ep else {
                    continue;
                };

                // re-arm the channel for the next packet as soon as
                // possible
                if hctsiz & r::HCTSIZ_PKTCNT_MASK != 0 {
                    self.bus
                        .set_bits(self.bus.hc(ch, r::HCCHAR), r::HCCHAR_CHENA);
                }

                let bcnt = (grxstsp & r::GRXSTSP_BCNT_MASK) >> r::GRXSTSP_BCNT_SHIFT;
                debug!(
                    "usbh: ep{} rxflvl {}B, rem={}B",
                    ep_idx,
                    bcnt,
                    hctsiz & r::HCTSIZ_XFRSIZ_MASK
                );
                debug_assert!(
                    bcnt + self.eps[ep_idx as usize].xfer.partial
                        <= self.eps[ep_idx as usize].xfer.len
                );

                let dest = self.eps[ep_idx as usize].xfer.buf;
                let words = bcnt / 4;
                let tail = (bcnt & 3) as usize;
                for w in 0..words {
                    let word = self.bus.fifo_read(ch);
                    unsafe {
                        core::ptr::write_unaligned(dest.add((w * 4) as usize) as *mut u32, word)
                    };
                }
                if tail != 0 {
                    let word = self.bus.fifo_read(ch);
                    let bytes = word.to_le_bytes();
                    for b in 0..tail {
                        unsafe { *dest.add((words * 4) as usize + b) = bytes[b] };
                    }
                }

                let ep = &mut self.eps[ep_idx as usize];
                ep.xfer.buf = unsafe { ep.xfer.buf.add(bcnt as usize) };
                ep.xfer.partial += bcnt;
            }
            // other packet statuses (IN complete, data-toggle error,
            // channel halted) arrive as channel interrupts
        }
        self.bus.set_bits(r::GINTMSK, r::GINTSTS_RXFLVL);
    }

    fn nptxfe_int(&mut self) {
        let space = self.bus.read(r::HNPTXSTS) & r::TXSTS_FSAVL_MASK;
        let mut rem = self.write_packets(EpType::Control as usize, space);
        let space = self.bus.read(r::HNPTXSTS) & r::TXSTS_FSAVL_MASK;
        rem += self.write_packets(EpType::Bulk as usize, space);
        if rem == 0 {
            self.bus.clear_bits(r::GINTMSK, r::GINTSTS_NPTXFE);
        }
    }

    fn ptxfe_int(&mut self) {
        let space = self.bus.read(r::HPTXSTS) & r::TXSTS_FSAVL_MASK;
        let mut rem = self.write_packets(EpType::Isochronous as usize, space);
        let space = self.bus.read(r::HPTXSTS) & r::TXSTS_FSAVL_MASK;
        rem += self.write_packets(EpType::Interrupt as usize, space);
        if rem == 0 {
            self.bus.clear_bits(r::GINTMSK, r::GINTSTS_PTXFE);
        }
    }

    /// Drop the logical port, purge every queued transfer and gate the
    /// channel/RX interrupts until the next enable.
    pub(crate) fn disable_port(&mut self) {
        self.root_status &= !(crate::port::PORT_CONNECTION | crate::port::PORT_ENABLE);
        self.root_c_status |= crate::port::PORT_C_CONNECTION | crate::port::PORT_C_ENABLE;

        self.purge_active();
        self.purge_pending();

        self.bus
            .clear_bits(r::GINTMSK, r::GINTSTS_HCINT | r::GINTSTS_RXFLVL);
    }

    fn discint_int(&mut self) {
        info!("usbh: port disconnection detected");
        self.disable_port();
    }

    fn hprt_int(&mut self) {
        let hprt = self.bus.read(r::HPRT);
        // writing PENA=1 disables the port, keep it out of the
        // write-back mask
        let mut hprt_clr =
            hprt & !(r::HPRT_PENA | r::HPRT_PCDET | r::HPRT_PENCHNG | r::HPRT_POCCHNG);

        if hprt & r::HPRT_PCDET != 0 {
            hprt_clr |= r::HPRT_PCDET;
            if hprt & r::HPRT_PCSTS != 0 {
                info!("usbh: port connection detected");
                self.root_status |= crate::port::PORT_CONNECTION;
                self.root_c_status |= crate::port::PORT_C_CONNECTION;
            }
        }

        if hprt & r::HPRT_PENCHNG != 0 {
            hprt_clr |= r::HPRT_PENCHNG;
            if hprt & r::HPRT_PENA != 0 {
                info!("usbh: port enabled");
                self.root_status &=
                    !(crate::port::PORT_HIGH_SPEED | crate::port::PORT_LOW_SPEED);

                // size and flush the FIFOs now that traffic can start
                self.bus
                    .write(r::GRXFSIZ, r::fsiz_depth(r::RXFIFO_SIZE / 4));
                self.bus.write(
                    r::HNPTXFSIZ,
                    r::fsiz_start_addr(r::RXFIFO_SIZE / 4)
                        | r::fsiz_depth(r::NPTXFIFO_SIZE / 4),
                );
                self.bus.write(
                    r::HPTXFSIZ,
                    r::fsiz_start_addr(r::RXFIFO_SIZE / 4 + r::NPTXFIFO_SIZE / 4)
                        | r::fsiz_depth(r::PTXFIFO_SIZE / 4),
                );
                self.flush_txfifo(0x10);
                self.flush_rxfifo();

                for ch in 0..crate::otg::channel::NUM_CHANNELS as u8 {
                    self.bus.write(self.bus.hc(ch, r::HCINTMSK), 0);
                    self.bus.write(self.bus.hc(ch, r::HCINT), 0xFFFF_FFFF);
                }

                if hprt & r::HPRT_PSPD_MASK == r::HPRT_PSPD_LS {
                    self.root_status |= crate::port::PORT_LOW_SPEED;
                    self.bus.write(r::HFIR, 6000);
                    self.bus
                        .modify(r::HCFG, |v| (v & !r::HCFG_FSLSPCS_MASK) | r::HCFG_FSLSPCS_6);

                    // hold off the enable report until the low-speed
                    // activity check passes (see sof_int)
                    self.check_ls_activity = true;
                    self.bus.set_bits(r::GINTMSK, r::GINTSTS_SOF);
                } else {
                    self.bus.write(r::HFIR, 48000);
                    self.bus
                        .modify(r::HCFG, |v| (v & !r::HCFG_FSLSPCS_MASK) | r::HCFG_FSLSPCS_48);
                    self.check_ls_activity = false;

                    self.bus
                        .set_bits(r::GINTMSK, r::GINTSTS_HCINT | r::GINTSTS_RXFLVL);
                    self.root_status |= crate::port::PORT_ENABLE;
                    self.root_c_status |= crate::port::PORT_C_ENABLE;
                }
            } else {
                if hprt & r::HPRT_PCSTS != 0 {
                    if hprt & r::HPRT_POCA != 0 {
                        error!("usbh: port disabled by overcurrent");
                    } else {
                        error!("usbh: port disabled by babble");
                    }
                } else {
                    error!("usbh: port disabled by disconnect");
                }
                self.disable_port();
            }
        }

        if hprt & r::HPRT_POCCHNG != 0 {
            hprt_clr |= r::HPRT_POCCHNG;
            if hprt & r::HPRT_POCA != 0 {
                error!("usbh: overcurrent");
                self.root_status |= crate::port::PORT_OVERCURRENT;
            } else {
                debug!("usbh: overcurrent cleared");
                self.root_status &= !crate::port::PORT_OVERCURRENT;
            }
            self.root_c_status |= crate::port::PORT_C_OVERCURRENT;
        }

        self.bus.write(r::HPRT, hprt_clr);
    }

    /// Interrupt service dispatch; runs with the system lock held.
    pub(crate) fn serve_interrupt(&mut self) {
        if self.state == crate::host::HostState::Stopped {
            return;
        }
        let mut gintsts = self.bus.read(r::GINTSTS);

        if gintsts & r::GINTSTS_CMOD == 0 {
            error!("usbh: interrupt in device mode");
            self.bus.write(r::GINTSTS, gintsts);
            return;
        }

        gintsts &= self.bus.read(r::GINTMSK);
        if gintsts == 0 {
            return;
        }
        self.bus.write(r::GINTSTS, gintsts);

        if gintsts & r::GINTSTS_SOF != 0 {
            self.sof_int();
        }
        if gintsts & r::GINTSTS_RXFLVL != 0 {
            self.rxflvl_int();
        }
        if gintsts & r::GINTSTS_HPRTINT != 0 {
            self.hprt_int();
        }
        if gintsts & r::GINTSTS_DISCINT != 0 {
            self.discint_int();
        }
        if gintsts & r::GINTSTS_HCINT != 0 {
            self.hcint_int();
        }
        if gintsts & r::GINTSTS_NPTXFE != 0 {
            self.nptxfe_int();
        }
        if gintsts & r::GINTSTS_PTXFE != 0 {
            self.ptxfe_int();
        }
        if gintsts & r::GINTSTS_IPXFR != 0 {
            error!("usbh: incomplete periodic transfer");
        }
    }

    // ===== core bring-up =====

    fn core_reset(&mut self) {
        for _ in 0..RESET_SPIN_LIMIT {
            if self.bus.read(r::GRSTCTL) & r::GRSTCTL_AHBIDL != 0 {
                break;
            }
        }
        crate::timing::delay_us(1);
        self.bus.write(r::GRSTCTL, r::GRSTCTL_CSRST);
        for _ in 0..RESET_SPIN_LIMIT {
            if self.bus.read(r::GRSTCTL) & r::GRSTCTL_CSRST == 0 {
                break;
            }
        }
        crate::timing::delay_us(1);
        for _ in 0..RESET_SPIN_LIMIT {
            if self.bus.read(r::GRSTCTL) & r::GRSTCTL_AHBIDL != 0 {
                break;
            }
        }
    }

    fn flush_rxfifo(&mut self) {
        self.bus.write(r::GRSTCTL, r::GRSTCTL_RXFFLSH);
        for _ in 0..RESET_SPIN_LIMIT {
            if self.bus.read(r::GRSTCTL) & r::GRSTCTL_RXFFLSH == 0 {
                break;
            }
        }
        crate::timing::delay_us(1);
    }

    fn flush_txfifo(&mut self, fifo: u32) {
        self.bus
            .write(r::GRSTCTL, r::grstctl_txfnum(fifo) | r::GRSTCTL_TXFFLSH);
        for _ in 0..RESET_SPIN_LIMIT {
            if self.bus.read(r::GRSTCTL) & r::GRSTCTL_TXFFLSH == 0 {
                break;
            }
        }
        crate::timing::delay_us(1);
    }

    /// Force host mode, power the port and unmask the port-level
    /// interrupts. Clock enable and NVIC wiring are the application's
    /// responsibility.
    pub(crate) fn start_controller(&mut self) {
        self.bus.write(r::GINTMSK, 0);
        self.bus
            .write(r::GUSBCFG, r::GUSBCFG_PHYSEL | r::gusbcfg_trdt(5));

        self.core_reset();

        self.bus.write(r::GCCFG, r::GCCFG_PWRDWN);

        self.bus.write(
            r::GUSBCFG,
            r::GUSBCFG_FHMOD | r::GUSBCFG_PHYSEL | r::gusbcfg_trdt(5),
        );

        self.bus.write(r::PCGCCTL, 0);
        self.bus.write(r::GCCFG, r::GCCFG_VBDEN | r::GCCFG_PWRDWN);

        self.bus
            .write(r::HCFG, r::HCFG_FSLSS | r::HCFG_FSLSPCS_48);

        self.bus.write(r::GAHBCFG, 0);
        self.bus.write(r::GOTGINT, 0xFFFF_FFFF);

        self.bus.set_bits(r::HPRT, r::HPRT_PPWR);

        self.flush_txfifo(0x10);
        self.flush_rxfifo();

        self.bus.write(r::GINTSTS, 0xFFFF_FFFF);
        self.bus.write(
            r::GINTMSK,
            r::GINTSTS_DISCINT | r::GINTSTS_HPRTINT | r::GINTSTS_MMIS,
        );

        self.root_status = crate::port::PORT_POWER;
        self.root_c_status = 0;

        self.bus.set_bits(r::GAHBCFG, r::GAHBCFG_GINTMSK);
    }
}
