//! Mass storage class driver (Bulk-Only Transport, SCSI command set)
//!
//! A BOT transaction is three phases on the bulk pipes: a 31-byte
//! Command Block Wrapper, an optional data stage, and a 13-byte
//! Command Status Wrapper. The CSW must echo the command's tag and
//! carry the right signature, and the reported residue may not exceed
//! the requested length; anything else is a transport error and
//! triggers a Bulk-Only reset. A device-reported command failure is a
//! different animal: it is surfaced to the caller after an automatic
//! REQUEST SENSE, so the diagnostic is in the log even when the caller
//! only sees "failed".
//!
//! The protocol engine is generic over [`BotPipes`] so it runs against
//! the real bulk endpoints and against scripted transports in tests.

use heapless::Vec;
use log::{error, info, warn};

use crate::class::ClassDriver;
use crate::descriptor::{self, InterfaceDescriptor, InterfaceIter};
use crate::enumeration::{Device, DriverId};
use crate::error::{Result, UsbError};
use crate::host::{UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::urb::{EpHandle, EpType, SetupPacket, UrbStatus};

/// Concurrent mass-storage function instances
pub const MAX_INSTANCES: usize = 2;
/// Logical units supported per instance
pub const MAX_LUNS: usize = 2;

/// Bulk-Only Mass Storage Reset class request
pub const REQ_BOT_RESET: u8 = 0xFF;
/// GET MAX LUN class request
pub const REQ_GET_MAX_LUN: u8 = 0xFE;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_SIZE: usize = 31;
pub const CSW_SIZE: usize = 13;

pub const CBW_FLAGS_D2H: u8 = 0x80;
pub const CBW_FLAGS_H2D: u8 = 0x00;

/// TEST UNIT READY polls while media spins up
pub const TEST_UNIT_READY_RETRIES: u8 = 10;
/// Backoff between TEST UNIT READY polls
pub const TEST_UNIT_READY_DELAY_MS: u32 = 200;

const CBW_TIMEOUT_MS: u32 = 1000;
const DATA_TIMEOUT_MS: u32 = 20000;
const CSW_TIMEOUT_MS: u32 = 1000;

/// Largest block count one READ(10)/WRITE(10) can carry
pub const MAX_BLOCKS_PER_COMMAND: u32 = 0xFFFF;

// SCSI operation codes
const SCSI_TEST_UNIT_READY: u8 = 0x00;
const SCSI_REQUEST_SENSE: u8 = 0x03;
const SCSI_INQUIRY: u8 = 0x12;
const SCSI_READ_CAPACITY_10: u8 = 0x25;
const SCSI_READ_10: u8 = 0x28;
const SCSI_WRITE_10: u8 = 0x2A;

/// Command Block Wrapper
#[derive(Debug, Clone)]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; 16],
}

impl Cbw {
    pub fn new(lun: u8) -> Self {
        Self {
            tag: 0,
            data_transfer_length: 0,
            flags: CBW_FLAGS_H2D,
            lun,
            cb_length: 0,
            cb: [0; 16],
        }
    }

    pub fn to_bytes(&self) -> [u8; CBW_SIZE] {
        let mut b = [0u8; CBW_SIZE];
        b[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        b[4..8].copy_from_slice(&self.tag.to_le_bytes());
        b[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        b[12] = self.flags;
        b[13] = self.lun;
        b[14] = self.cb_length;
        b[15..31].copy_from_slice(&self.cb);
        b
    }
}

/// Command Status Wrapper
#[derive(Debug, Clone, Copy)]
pub struct Csw {
    pub signature: u32,
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

impl Csw {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < CSW_SIZE {
            return None;
        }
        Some(Self {
            signature: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            tag: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            data_residue: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            status: b[12],
        })
    }
}

/// Transport-level outcome of one BOT transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionResult {
    Ok,
    Disconnected,
    Stall,
    BusError,
    /// CSW failed validation (signature, tag, or residue)
    SyncError,
}

/// Device-reported outcome from the CSW status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandResult {
    Passed,
    Failed,
    PhaseError,
}

impl CommandResult {
    fn from_csw_status(s: u8) -> Self {
        match s {
            0 => Self::Passed,
            1 => Self::Failed,
            _ => Self::PhaseError,
        }
    }
}

/// Combined result of one SCSI command over BOT
#[derive(Debug, Clone, Copy)]
pub struct BotOutcome {
    pub transaction: TransactionResult,
    pub command: CommandResult,
    pub residue: u32,
}

impl BotOutcome {
    fn transport(t: TransactionResult) -> Self {
        Self {
            transaction: t,
            command: CommandResult::Failed,
            residue: 0,
        }
    }
}

/// Data stage of a BOT transaction
pub enum DataStage<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Transport under the BOT engine: two bulk pipes plus the recovery
/// controls. Implemented by the live host endpoints and by scripted
/// mocks in tests.
pub trait BotPipes {
    fn bulk_out(&mut self, data: &[u8], timeout_ms: u32) -> (UrbStatus, usize);
    fn bulk_in(&mut self, buf: &mut [u8], timeout_ms: u32) -> (UrbStatus, usize);
    /// CLEAR_FEATURE(ENDPOINT_HALT) + local toggle reset, IN pipe
    fn clear_in_halt(&mut self) -> Result<()>;
    /// CLEAR_FEATURE(ENDPOINT_HALT) + local toggle reset, OUT pipe
    fn clear_out_halt(&mut self) -> Result<()>;
    /// Bulk-Only Mass Storage Reset followed by both halt clears
    fn bot_reset(&mut self) -> Result<()>;
    fn delay_ms(&mut self, ms: u32) {
        crate::timing::delay_ms(ms);
    }
}

fn map_status(status: UrbStatus) -> TransactionResult {
    match status {
        UrbStatus::Ok => TransactionResult::Ok,
        UrbStatus::Cancelled | UrbStatus::Disconnected => TransactionResult::Disconnected,
        UrbStatus::Stall => TransactionResult::Stall,
        _ => TransactionResult::BusError,
    }
}

/// The BOT command/data/status sequencer. Owns the monotonically
/// increasing transaction tag.
pub struct BotEngine {
    tag: u32,
}

impl BotEngine {
    pub const fn new() -> Self {
        Self { tag: 0 }
    }

    /// Run one full BOT transaction.
    pub fn transaction<P: BotPipes>(
        &mut self,
        pipes: &mut P,
        cbw: &mut Cbw,
        mut data: DataStage<'_>,
    ) -> BotOutcome {
        self.tag = self.tag.wrapping_add(1);
        cbw.tag = self.tag;

        // command phase
        let bytes = cbw.to_bytes();
        let (status, actual) = pipes.bulk_out(&bytes, CBW_TIMEOUT_MS);
        match map_status(status) {
            TransactionResult::Ok => {}
            t => {
                error!("msd: command phase: {:?}", t);
                return BotOutcome::transport(t);
            }
        }
        if actual != CBW_SIZE {
            error!("msd: command phase: short write ({}B)", actual);
            return BotOutcome::transport(TransactionResult::BusError);
        }

        // data phase
        if cbw.data_transfer_length > 0 {
            let (status, actual, is_in) = match &mut data {
                DataStage::In(buf) => {
                    let (s, a) = pipes.bulk_in(buf, DATA_TIMEOUT_MS);
                    (s, a, true)
                }
                DataStage::Out(buf) => {
                    let (s, a) = pipes.bulk_out(buf, DATA_TIMEOUT_MS);
                    (s, a, false)
                }
                DataStage::None => {
                    error!("msd: CBW claims data but none supplied");
                    return BotOutcome::transport(TransactionResult::BusError);
                }
            };
            match map_status(status) {
                TransactionResult::Ok => {
                    if actual as u32 != cbw.data_transfer_length {
                        // short data stages are reconciled through the
                        // CSW residue below
                        warn!(
                            "msd: data phase: {}B of {}B",
                            actual, cbw.data_transfer_length
                        );
                    }
                }
                TransactionResult::Stall => {
                    // a stalled data stage is recoverable: clear the
                    // halt and read the CSW, which reports Failed
                    warn!("msd: data phase stalled, clearing halt");
                    let cleared = if is_in {
                        pipes.clear_in_halt()
                    } else {
                        pipes.clear_out_halt()
                    };
                    if cleared.is_err() {
                        error!("msd: endpoint reset failed");
                        return BotOutcome::transport(TransactionResult::Stall);
                    }
                }
                t => {
                    error!("msd: data phase: {:?}", t);
                    return BotOutcome::transport(t);
                }
            }
        }

        // status phase, one retry allowed after a stall
        let mut csw_buf = [0u8; CSW_SIZE];
        let mut attempt = 0;
        let (status, actual) = loop {
            let (status, actual) = pipes.bulk_in(&mut csw_buf, CSW_TIMEOUT_MS);
            if status == UrbStatus::Stall && attempt == 0 {
                warn!("msd: status phase stalled, retrying");
                if pipes.clear_in_halt().is_err() {
                    break (status, actual);
                }
                attempt += 1;
                continue;
            }
            break (status, actual);
        };
        match map_status(status) {
            TransactionResult::Ok => {}
            t => {
                error!("msd: status phase: {:?}", t);
                return BotOutcome::transport(t);
            }
        }
        if actual != CSW_SIZE {
            error!("msd: status phase: short read ({}B)", actual);
            return BotOutcome::transport(TransactionResult::BusError);
        }

        let Some(csw) = Csw::from_bytes(&csw_buf) else {
            return BotOutcome::transport(TransactionResult::BusError);
        };
        if csw.signature != CSW_SIGNATURE {
            error!("msd: status phase: bad signature {:08x}", csw.signature);
            return BotOutcome::transport(TransactionResult::BusError);
        }
        if csw.tag != self.tag {
            error!(
                "msd: status phase: tag mismatch (expected {}, got {})",
                self.tag, csw.tag
            );
            return BotOutcome::transport(TransactionResult::SyncError);
        }
        if csw.data_residue > cbw.data_transfer_length {
            error!(
                "msd: status phase: residue {} exceeds request {}",
                csw.data_residue, cbw.data_transfer_length
            );
            return BotOutcome::transport(TransactionResult::SyncError);
        }
        if csw.data_residue != 0 {
            warn!("msd: residue={}", csw.data_residue);
        }

        BotOutcome {
            transaction: TransactionResult::Ok,
            command: CommandResult::from_csw_status(csw.status),
            residue: csw.data_residue,
        }
    }
}

// ===== SCSI commands =====

pub fn scsi_inquiry<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    resp: &mut [u8; 36],
) -> BotOutcome {
    let mut cbw = Cbw::new(lun);
    cbw.data_transfer_length = resp.len() as u32;
    cbw.flags = CBW_FLAGS_D2H;
    cbw.cb_length = 6;
    cbw.cb[0] = SCSI_INQUIRY;
    cbw.cb[4] = resp.len() as u8;
    engine.transaction(pipes, &mut cbw, DataStage::In(resp))
}

pub fn scsi_request_sense<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    resp: &mut [u8; 18],
) -> BotOutcome {
    let mut cbw = Cbw::new(lun);
    cbw.data_transfer_length = resp.len() as u32;
    cbw.flags = CBW_FLAGS_D2H;
    cbw.cb_length = 12;
    cbw.cb[0] = SCSI_REQUEST_SENSE;
    cbw.cb[4] = resp.len() as u8;
    engine.transaction(pipes, &mut cbw, DataStage::In(resp))
}

pub fn scsi_test_unit_ready<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
) -> BotOutcome {
    let mut cbw = Cbw::new(lun);
    cbw.flags = CBW_FLAGS_D2H;
    cbw.cb_length = 6;
    cbw.cb[0] = SCSI_TEST_UNIT_READY;
    engine.transaction(pipes, &mut cbw, DataStage::None)
}

pub fn scsi_read_capacity10<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    resp: &mut [u8; 8],
) -> BotOutcome {
    let mut cbw = Cbw::new(lun);
    cbw.data_transfer_length = resp.len() as u32;
    cbw.flags = CBW_FLAGS_D2H;
    cbw.cb_length = 12;
    cbw.cb[0] = SCSI_READ_CAPACITY_10;
    engine.transaction(pipes, &mut cbw, DataStage::In(resp))
}

fn rw10_cb(op: u8, lba: u32, blocks: u16) -> [u8; 16] {
    let mut cb = [0u8; 16];
    cb[0] = op;
    cb[2..6].copy_from_slice(&lba.to_be_bytes());
    cb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cb
}

pub fn scsi_read10<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    block_size: u32,
    lba: u32,
    blocks: u16,
    data: &mut [u8],
) -> BotOutcome {
    let mut cbw = Cbw::new(lun);
    cbw.data_transfer_length = blocks as u32 * block_size;
    cbw.flags = CBW_FLAGS_D2H;
    cbw.cb_length = 10;
    cbw.cb = rw10_cb(SCSI_READ_10, lba, blocks);
    engine.transaction(pipes, &mut cbw, DataStage::In(data))
}

pub fn scsi_write10<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    block_size: u32,
    lba: u32,
    blocks: u16,
    data: &[u8],
) -> BotOutcome {
    let mut cbw = Cbw::new(lun);
    cbw.data_transfer_length = blocks as u32 * block_size;
    cbw.flags = CBW_FLAGS_H2D;
    cbw.cb_length = 10;
    cbw.cb = rw10_cb(SCSI_WRITE_10, lba, blocks);
    engine.transaction(pipes, &mut cbw, DataStage::Out(data))
}

// ===== logical unit state machine =====

/// Block geometry of a ready logical unit
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockDeviceInfo {
    pub blk_size: u32,
    pub blk_num: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LunState {
    Stop,
    /// Attached, not yet probed
    Active,
    Connecting,
    Ready,
    Reading,
    Writing,
    Disconnecting,
}

/// Fire REQUEST SENSE after a failed command and log the diagnostic.
fn auto_sense<P: BotPipes>(engine: &mut BotEngine, pipes: &mut P, lun: u8) {
    let mut sense = [0u8; 18];
    let res = scsi_request_sense(engine, pipes, lun, &mut sense);
    match (res.transaction, res.command) {
        (TransactionResult::Ok, CommandResult::Passed) => {
            error!(
                "msd: sense key={:x} asc={:02x} ascq={:02x}",
                sense[2] & 0xF,
                sense[12],
                sense[13]
            );
        }
        _ => error!("msd: REQUEST SENSE failed"),
    }
}

/// Probe a logical unit: INQUIRY, TEST UNIT READY with spin-up
/// backoff, then READ CAPACITY(10). Returns the block geometry.
pub fn lun_connect<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
) -> Result<BlockDeviceInfo> {
    info!("msd: INQUIRY");
    let mut inq = [0u8; 36];
    let res = scsi_inquiry(engine, pipes, lun, &mut inq);
    match (res.transaction, res.command) {
        (TransactionResult::Ok, CommandResult::Passed) => {}
        (TransactionResult::Ok, CommandResult::Failed) => {
            auto_sense(engine, pipes, lun);
            return Err(UsbError::InvalidState);
        }
        (TransactionResult::Ok, CommandResult::PhaseError) => {
            let _ = pipes.bot_reset();
            return Err(UsbError::TransactionError);
        }
        _ => {
            let _ = pipes.bot_reset();
            return Err(UsbError::TransactionError);
        }
    }

    // only direct-access devices are supported
    if inq[0] & 0x1F != 0 {
        warn!("msd: unsupported peripheral device type {:02x}", inq[0]);
        return Err(UsbError::Unsupported);
    }

    let mut ready = false;
    for _ in 0..TEST_UNIT_READY_RETRIES {
        info!("msd: TEST UNIT READY");
        let res = scsi_test_unit_ready(engine, pipes, lun);
        match (res.transaction, res.command) {
            (TransactionResult::Ok, CommandResult::Passed) => {
                ready = true;
                break;
            }
            (TransactionResult::Ok, CommandResult::Failed) => {
                // media still spinning up
                auto_sense(engine, pipes, lun);
                pipes.delay_ms(TEST_UNIT_READY_DELAY_MS);
            }
            (TransactionResult::Ok, CommandResult::PhaseError) => {
                let _ = pipes.bot_reset();
                return Err(UsbError::TransactionError);
            }
            _ => {
                let _ = pipes.bot_reset();
                return Err(UsbError::TransactionError);
            }
        }
    }
    if !ready {
        warn!("msd: unit never became ready");
        return Err(UsbError::Timeout);
    }

    info!("msd: READ CAPACITY(10)");
    let mut cap = [0u8; 8];
    let res = scsi_read_capacity10(engine, pipes, lun, &mut cap);
    match (res.transaction, res.command) {
        (TransactionResult::Ok, CommandResult::Passed) => {}
        (TransactionResult::Ok, CommandResult::Failed) => {
            auto_sense(engine, pipes, lun);
            return Err(UsbError::InvalidState);
        }
        _ => {
            let _ = pipes.bot_reset();
            return Err(UsbError::TransactionError);
        }
    }

    let last_block = u32::from_be_bytes([cap[0], cap[1], cap[2], cap[3]]);
    let blk_size = u32::from_be_bytes([cap[4], cap[5], cap[6], cap[7]]);
    let info = BlockDeviceInfo {
        blk_size,
        blk_num: last_block.wrapping_add(1),
    };
    info!(
        "msd: block size={}B, blocks={} (~{} MB)",
        info.blk_size,
        info.blk_num,
        ((info.blk_size as u64 * info.blk_num as u64) / (1024 * 1024)) as u32
    );
    Ok(info)
}

/// Read `n` blocks starting at `start_blk`, splitting into READ(10)
/// commands of at most [`MAX_BLOCKS_PER_COMMAND`] blocks each.
pub fn lun_read<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    geo: BlockDeviceInfo,
    mut start_blk: u32,
    buf: &mut [u8],
    mut n: u32,
) -> Result<()> {
    debug_assert!(buf.len() as u64 >= n as u64 * geo.blk_size as u64);
    let mut offset = 0usize;
    while n > 0 {
        let blocks = n.min(MAX_BLOCKS_PER_COMMAND) as u16;
        let chunk = blocks as usize * geo.blk_size as usize;
        let res = scsi_read10(
            engine,
            pipes,
            lun,
            geo.blk_size,
            start_blk,
            blocks,
            &mut buf[offset..offset + chunk],
        );
        match (res.transaction, res.command) {
            (TransactionResult::Ok, CommandResult::Passed) => {}
            (TransactionResult::Ok, CommandResult::Failed) => {
                error!("msd: READ(10) failed");
                auto_sense(engine, pipes, lun);
                return Err(UsbError::InvalidState);
            }
            (TransactionResult::Ok, CommandResult::PhaseError) => {
                let _ = pipes.bot_reset();
                return Err(UsbError::TransactionError);
            }
            _ => {
                let _ = pipes.bot_reset();
                return Err(UsbError::TransactionError);
            }
        }
        n -= blocks as u32;
        start_blk += blocks as u32;
        offset += chunk;
    }
    Ok(())
}

/// Write `n` blocks starting at `start_blk`; same splitting rule as
/// [`lun_read`].
pub fn lun_write<P: BotPipes>(
    engine: &mut BotEngine,
    pipes: &mut P,
    lun: u8,
    geo: BlockDeviceInfo,
    mut start_blk: u32,
    buf: &[u8],
    mut n: u32,
) -> Result<()> {
    debug_assert!(buf.len() as u64 >= n as u64 * geo.blk_size as u64);
    let mut offset = 0usize;
    while n > 0 {
        let blocks = n.min(MAX_BLOCKS_PER_COMMAND) as u16;
        let chunk = blocks as usize * geo.blk_size as usize;
        let res = scsi_write10(
            engine,
            pipes,
            lun,
            geo.blk_size,
            start_blk,
            blocks,
            &buf[offset..offset + chunk],
        );
        match (res.transaction, res.command) {
            (TransactionResult::Ok, CommandResult::Passed) => {}
            (TransactionResult::Ok, CommandResult::Failed) => {
                error!("msd: WRITE(10) failed");
                auto_sense(engine, pipes, lun);
                return Err(UsbError::InvalidState);
            }
            (TransactionResult::Ok, CommandResult::PhaseError) => {
                let _ = pipes.bot_reset();
                return Err(UsbError::TransactionError);
            }
            _ => {
                let _ = pipes.bot_reset();
                return Err(UsbError::TransactionError);
            }
        }
        n -= blocks as u32;
        start_blk += blocks as u32;
        offset += chunk;
    }
    Ok(())
}

// ===== live transport over host endpoints =====

/// [`BotPipes`] over a device's real bulk endpoints
pub(crate) struct HostPipes<'a> {
    pub host: &'a UsbHost,
    pub ep0: EpHandle,
    pub ep_in: EpHandle,
    pub ep_out: EpHandle,
    pub ep_in_addr: u8,
    pub ep_out_addr: u8,
    pub ifnum: u8,
}

impl BotPipes for HostPipes<'_> {
    fn bulk_out(&mut self, data: &[u8], timeout_ms: u32) -> (UrbStatus, usize) {
        self.host.bulk_out(self.ep_out, data, timeout_ms)
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout_ms: u32) -> (UrbStatus, usize) {
        self.host.bulk_in(self.ep_in, buf, timeout_ms)
    }

    fn clear_in_halt(&mut self) -> Result<()> {
        self.host
            .clear_endpoint_halt(self.ep0, self.ep_in, self.ep_in_addr)
    }

    fn clear_out_halt(&mut self) -> Result<()> {
        self.host
            .clear_endpoint_halt(self.ep0, self.ep_out, self.ep_out_addr)
    }

    fn bot_reset(&mut self) -> Result<()> {
        warn!("msd: bulk-only reset");
        let req = SetupPacket::new(
            SetupPacket::OUT_CLASS_INTERFACE,
            REQ_BOT_RESET,
            0,
            self.ifnum as u16,
            0,
        );
        self.host
            .control_nodata(self.ep0, req, CONTROL_REQUEST_TIMEOUT_MS)
            .into_result()?;
        self.clear_in_halt()?;
        self.clear_out_halt()
    }
}

// ===== class driver =====

struct Lun {
    state: LunState,
    info: BlockDeviceInfo,
}

struct MsdInstance {
    ep0: EpHandle,
    ep_in: EpHandle,
    ep_out: EpHandle,
    ep_in_addr: u8,
    ep_out_addr: u8,
    ifnum: u8,
    engine: BotEngine,
    max_lun: u8,
    luns: Vec<Lun, MAX_LUNS>,
}

/// Host-owned arena of mass-storage instances
pub struct MsdPool {
    slots: [Option<MsdInstance>; MAX_INSTANCES],
}

impl MsdPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; MAX_INSTANCES],
        }
    }
}

fn find_bulk_endpoints(desc: &[u8]) -> Option<(InterfaceDescriptor, u8, u16, u8, u16)> {
    // `desc` starts at an interface descriptor or a configuration
    // bundle; either way, walk to the first matching interface and pick
    // its bulk endpoint pair
    let scan_interface = |iface: &crate::descriptor::InterfaceView<'_>| {
        let d = iface.desc;
        if d.alternate_setting != 0
            || d.num_endpoints < 2
            || d.interface_class != 0x08
            || d.interface_sub_class != 0x06
            || d.interface_protocol != 0x50
        {
            return None;
        }
        let mut ep_in = None;
        let mut ep_out = None;
        for (ep, _) in iface.endpoints() {
            if EpType::from_attributes(ep.attributes) != EpType::Bulk {
                info!("msd: skipping non-bulk endpoint {:02x}", ep.endpoint_address);
                continue;
            }
            if ep.is_in() {
                info!("msd: bulk IN endpoint {:02x}", ep.endpoint_address);
                ep_in = Some((ep.endpoint_address, ep.max_packet_size));
            } else {
                info!("msd: bulk OUT endpoint {:02x}", ep.endpoint_address);
                ep_out = Some((ep.endpoint_address, ep.max_packet_size));
            }
        }
        match (ep_in, ep_out) {
            (Some((ia, im)), Some((oa, om))) => Some((d, ia, im, oa, om)),
            _ => None,
        }
    };

    if desc.first().copied()? >= 2 && desc.get(1) == Some(&descriptor::desc_type::CONFIGURATION) {
        let (_, interfaces) = InterfaceIter::new(desc).ok()?;
        for iface in interfaces {
            if let Some(found) = scan_interface(&iface) {
                return Some(found);
            }
        }
        None
    } else {
        let view = crate::descriptor::InterfaceView::from_interface_slice(desc)?;
        scan_interface(&view)
    }
}

impl ClassDriver for MsdPool {
    fn name(&self) -> &'static str {
        "MSD"
    }

    fn matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        class == 0x08 && subclass == 0x06 && protocol == 0x50
    }

    fn load(&mut self, host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId> {
        let (ifdesc, in_addr, in_mps, out_addr, out_mps) = find_bulk_endpoints(desc)?;
        let ep0 = dev.ep0?;

        let slot = self.slots.iter().position(|s| s.is_none())?;

        // number of logical units
        let req = SetupPacket::new(
            SetupPacket::IN_CLASS_INTERFACE,
            REQ_GET_MAX_LUN,
            0,
            ifdesc.interface_number as u16,
            1,
        );
        let mut buf = [0u8; 1];
        let (status, _) = host.control_request(ep0, req, &mut buf, CONTROL_REQUEST_TIMEOUT_MS);
        let mut max_lun = match status {
            UrbStatus::Ok => buf[0] + 1,
            // devices without multiple LUNs stall GET MAX LUN
            UrbStatus::Stall => 1,
            _ => {
                error!("msd: GET MAX LUN failed");
                return None;
            }
        };
        info!("msd: max_lun = {}", max_lun);
        if max_lun as usize > MAX_LUNS {
            max_lun = MAX_LUNS as u8;
            warn!("msd: using max_lun = {}", max_lun);
        }

        let low_speed = dev.is_low_speed();
        let mk_ep = |addr: u8, mps: u16, dir_in: bool| crate::host::EpConfig {
            ep_type: EpType::Bulk,
            number: addr & 0x0F,
            dir_in,
            max_packet_size: mps,
            interval: 0,
            dev_addr: dev.address,
            low_speed,
        };
        let ep_in = host.ep_open(mk_ep(in_addr, in_mps, true)).ok()?;
        let ep_out = match host.ep_open(mk_ep(out_addr, out_mps, false)) {
            Ok(ep) => ep,
            Err(_) => {
                host.ep_close(ep_in);
                return None;
            }
        };

        let mut inst = MsdInstance {
            ep0,
            ep_in,
            ep_out,
            ep_in_addr: in_addr,
            ep_out_addr: out_addr,
            ifnum: ifdesc.interface_number,
            engine: BotEngine::new(),
            max_lun,
            luns: Vec::new(),
        };
        for _ in 0..max_lun {
            inst.luns
                .push(Lun {
                    state: LunState::Active,
                    info: BlockDeviceInfo::default(),
                })
                .ok();
        }

        self.slots[slot] = Some(inst);

        // probe every unit now; a unit that fails stays Active and can
        // be retried via msd_connect
        if let Some(inst) = self.slots[slot].as_mut() {
            for lun in 0..max_lun {
                let _ = Self::connect_lun(inst, host, lun);
            }
        }

        Some(DriverId::Msd(slot as u8))
    }

    fn unload(&mut self, host: &UsbHost, id: DriverId) {
        let DriverId::Msd(slot) = id else { return };
        if let Some(inst) = self.slots[slot as usize].take() {
            host.ep_close(inst.ep_in);
            host.ep_close(inst.ep_out);
        }
    }
}

impl MsdPool {
    fn connect_lun(inst: &mut MsdInstance, host: &UsbHost, lun: u8) -> Result<()> {
        let l = inst
            .luns
            .get_mut(lun as usize)
            .ok_or(UsbError::InvalidParameter)?;
        match l.state {
            LunState::Ready => return Ok(()),
            LunState::Active => {}
            _ => return Err(UsbError::InvalidState),
        }
        l.state = LunState::Connecting;

        let mut pipes = HostPipes {
            host,
            ep0: inst.ep0,
            ep_in: inst.ep_in,
            ep_out: inst.ep_out,
            ep_in_addr: inst.ep_in_addr,
            ep_out_addr: inst.ep_out_addr,
            ifnum: inst.ifnum,
        };
        match lun_connect(&mut inst.engine, &mut pipes, lun) {
            Ok(info) => {
                let l = &mut inst.luns[lun as usize];
                l.info = info;
                l.state = LunState::Ready;
                info!("msd: lun {} connected", lun);
                Ok(())
            }
            Err(e) => {
                inst.luns[lun as usize].state = LunState::Active;
                Err(e)
            }
        }
    }
}

impl UsbHost {
    /// Number of logical units exposed by MSD instance `slot`
    pub fn msd_lun_count(&self, slot: u8) -> u8 {
        self.msd.borrow().slots[slot as usize]
            .as_ref()
            .map(|i| i.max_lun)
            .unwrap_or(0)
    }

    /// (Re-)probe a logical unit
    pub fn msd_connect(&self, slot: u8, lun: u8) -> Result<()> {
        let mut pool = self.msd.borrow_mut();
        let inst = pool.slots[slot as usize]
            .as_mut()
            .ok_or(UsbError::InvalidState)?;
        MsdPool::connect_lun(inst, self, lun)
    }

    /// Block geometry of a ready unit
    pub fn msd_info(&self, slot: u8, lun: u8) -> Option<BlockDeviceInfo> {
        let pool = self.msd.borrow();
        let inst = pool.slots[slot as usize].as_ref()?;
        let l = inst.luns.get(lun as usize)?;
        (l.state == LunState::Ready).then_some(l.info)
    }

    /// True once a unit is at least attached
    pub fn msd_is_inserted(&self, slot: u8, lun: u8) -> bool {
        let pool = self.msd.borrow();
        pool.slots[slot as usize]
            .as_ref()
            .and_then(|i| i.luns.get(lun as usize))
            .map(|l| {
                matches!(
                    l.state,
                    LunState::Active
                        | LunState::Connecting
                        | LunState::Ready
                        | LunState::Reading
                        | LunState::Writing
                )
            })
            .unwrap_or(false)
    }

    fn msd_rw<F>(&self, slot: u8, lun: u8, busy: LunState, op: F) -> Result<()>
    where
        F: FnOnce(&mut MsdInstance, &UsbHost) -> Result<()>,
    {
        let mut pool = self.msd.borrow_mut();
        let inst = pool.slots[slot as usize]
            .as_mut()
            .ok_or(UsbError::InvalidState)?;
        {
            let l = inst
                .luns
                .get_mut(lun as usize)
                .ok_or(UsbError::InvalidParameter)?;
            if l.state != LunState::Ready {
                return Err(UsbError::InvalidState);
            }
            l.state = busy;
        }
        let ret = op(inst, self);
        let l = &mut inst.luns[lun as usize];
        if matches!(l.state, LunState::Reading | LunState::Writing) {
            l.state = LunState::Ready;
        }
        ret
    }

    /// Read `n` blocks from a ready unit into `buf`
    pub fn msd_read(
        &self,
        slot: u8,
        lun: u8,
        start_blk: u32,
        buf: &mut [u8],
        n: u32,
    ) -> Result<()> {
        self.msd_rw(slot, lun, LunState::Reading, |inst, host| {
            let geo = inst.luns[lun as usize].info;
            let mut pipes = HostPipes {
                host,
                ep0: inst.ep0,
                ep_in: inst.ep_in,
                ep_out: inst.ep_out,
                ep_in_addr: inst.ep_in_addr,
                ep_out_addr: inst.ep_out_addr,
                ifnum: inst.ifnum,
            };
            lun_read(&mut inst.engine, &mut pipes, lun, geo, start_blk, buf, n)
        })
    }

    /// Write `n` blocks from `buf` to a ready unit
    pub fn msd_write(
        &self,
        slot: u8,
        lun: u8,
        start_blk: u32,
        buf: &[u8],
        n: u32,
    ) -> Result<()> {
        self.msd_rw(slot, lun, LunState::Writing, |inst, host| {
            let geo = inst.luns[lun as usize].info;
            let mut pipes = HostPipes {
                host,
                ep0: inst.ep0,
                ep_in: inst.ep_in,
                ep_out: inst.ep_out,
                ep_in_addr: inst.ep_in_addr,
                ep_out_addr: inst.ep_out_addr,
                ifnum: inst.ifnum,
            };
            lun_write(&mut inst.engine, &mut pipes, lun, geo, start_blk, buf, n)
        })
    }

    /// True when the medium is write-protected. Mode-sense based
    /// detection is not implemented; units always report writable.
    pub fn msd_is_protected(&self, _slot: u8, _lun: u8) -> bool {
        false
    }

    /// Park a ready unit back in the attached-but-unprobed state.
    pub fn msd_disconnect(&self, slot: u8, lun: u8) -> Result<()> {
        let mut pool = self.msd.borrow_mut();
        let inst = pool.slots[slot as usize]
            .as_mut()
            .ok_or(UsbError::InvalidState)?;
        let l = inst
            .luns
            .get_mut(lun as usize)
            .ok_or(UsbError::InvalidParameter)?;
        match l.state {
            LunState::Active => Ok(()),
            LunState::Ready => {
                l.state = LunState::Active;
                Ok(())
            }
            _ => Err(UsbError::InvalidState),
        }
    }

    /// Flush device caches. The bulk pipes are synchronous, so there
    /// is nothing buffered host-side.
    pub fn msd_sync(&self, slot: u8, lun: u8) -> Result<()> {
        let pool = self.msd.borrow();
        let inst = pool.slots[slot as usize]
            .as_ref()
            .ok_or(UsbError::InvalidState)?;
        let l = inst.luns.get(lun as usize).ok_or(UsbError::InvalidParameter)?;
        match l.state {
            LunState::Ready => Ok(()),
            _ => Err(UsbError::InvalidState),
        }
    }
}
