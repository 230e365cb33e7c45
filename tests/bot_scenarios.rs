//! Bulk-Only Transport scenarios against the scripted transport:
//! the mass-storage connect sequence, large-read splitting, stalled
//! data phases and CSW validation.

mod common;

use common::{csw, ScriptedPipes, Step};
use stm32_otg_usbh::class::msd::{
    lun_connect, lun_read, scsi_read10, BlockDeviceInfo, BotEngine, CommandResult,
    TransactionResult, CBW_SIZE, MAX_BLOCKS_PER_COMMAND,
};
use stm32_otg_usbh::error::UsbError;
use stm32_otg_usbh::urb::UrbStatus;

fn inquiry_response(pdt: u8) -> Vec<u8> {
    let mut r = vec![0u8; 36];
    r[0] = pdt;
    r[1] = 0x80; // removable
    r
}

fn capacity_response(last_block: u32, block_size: u32) -> Vec<u8> {
    let mut r = vec![0u8; 8];
    r[0..4].copy_from_slice(&last_block.to_be_bytes());
    r[4..8].copy_from_slice(&block_size.to_be_bytes());
    r
}

/// A 100 MB stick: INQUIRY type 0, TEST UNIT READY passes first try,
/// READ CAPACITY(10) reports last block 204799 of 512 bytes.
#[test]
fn connect_reports_capacity_of_ready_unit() {
    let mut pipes = ScriptedPipes::new([
        // INQUIRY: command, data, status (tag 1)
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, inquiry_response(0)),
        Step::In(UrbStatus::Ok, csw(1, 0, 0)),
        // TEST UNIT READY (tag 2)
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, csw(2, 0, 0)),
        // READ CAPACITY(10) (tag 3)
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, capacity_response(204_799, 512)),
        Step::In(UrbStatus::Ok, csw(3, 0, 0)),
    ]);

    let mut engine = BotEngine::new();
    let info = lun_connect(&mut engine, &mut pipes, 0).expect("connect failed");
    assert_eq!(info.blk_num, 204_800);
    assert_eq!(info.blk_size, 512);
    assert!(pipes.script_exhausted());
    assert_eq!(pipes.bot_resets, 0);
}

/// Non-direct-access peripheral types are rejected at INQUIRY.
#[test]
fn connect_rejects_non_direct_access_device() {
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, inquiry_response(0x05)), // CD-ROM
        Step::In(UrbStatus::Ok, csw(1, 0, 0)),
    ]);
    let mut engine = BotEngine::new();
    let err = lun_connect(&mut engine, &mut pipes, 0).unwrap_err();
    assert_eq!(err, UsbError::Unsupported);
}

/// Slow media: TEST UNIT READY fails a few times (sense fetched each
/// time) before the unit reports ready.
#[test]
fn connect_polls_test_unit_ready_through_spinup() {
    let mut steps = vec![
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, inquiry_response(0)),
        Step::In(UrbStatus::Ok, csw(1, 0, 0)),
    ];
    let mut tag = 1;
    // two not-ready rounds, each TUR failure followed by REQUEST SENSE
    for _ in 0..2 {
        tag += 1;
        steps.push(Step::Out(UrbStatus::Ok));
        steps.push(Step::In(UrbStatus::Ok, csw(tag, 0, 1))); // TUR failed
        tag += 1;
        steps.push(Step::Out(UrbStatus::Ok));
        let mut sense = vec![0u8; 18];
        sense[2] = 0x02; // NOT READY
        sense[12] = 0x04; // LOGICAL UNIT NOT READY
        steps.push(Step::In(UrbStatus::Ok, sense));
        steps.push(Step::In(UrbStatus::Ok, csw(tag, 0, 0)));
    }
    tag += 1;
    steps.push(Step::Out(UrbStatus::Ok));
    steps.push(Step::In(UrbStatus::Ok, csw(tag, 0, 0))); // TUR ok
    tag += 1;
    steps.push(Step::Out(UrbStatus::Ok));
    steps.push(Step::In(UrbStatus::Ok, capacity_response(1023, 512)));
    steps.push(Step::In(UrbStatus::Ok, csw(tag, 0, 0)));

    let mut engine = BotEngine::new();
    let mut pipes = ScriptedPipes::new(steps);
    let info = lun_connect(&mut engine, &mut pipes, 0).expect("connect failed");
    assert_eq!(info.blk_num, 1024);
    assert!(pipes.script_exhausted());
}

fn read10_fields(cbw: &[u8]) -> (u32, u16) {
    assert_eq!(cbw.len(), CBW_SIZE);
    assert_eq!(cbw[15], 0x28, "not a READ(10) CBW");
    let lba = u32::from_be_bytes([cbw[17], cbw[18], cbw[19], cbw[20]]);
    let blocks = u16::from_be_bytes([cbw[22], cbw[23]]);
    (lba, blocks)
}

/// A read larger than the per-command block limit is split into
/// consecutive READ(10) commands of at most 0xFFFF blocks; success is
/// reported only when every piece succeeds.
#[test]
fn large_read_splits_at_per_command_limit() {
    let geo = BlockDeviceInfo {
        blk_size: 1, // 1-byte blocks keep the test buffer small
        blk_num: 400_000,
    };
    let total: u32 = 300_000;
    let start = 100;

    // expected split: 4 x 65535 + 37860
    let mut expected = Vec::new();
    let mut left = total;
    while left > 0 {
        let chunk = left.min(MAX_BLOCKS_PER_COMMAND);
        expected.push(chunk as u16);
        left -= chunk;
    }
    assert_eq!(expected.len(), 5);
    assert!(expected[..4].iter().all(|&c| c == 0xFFFF));

    let mut steps = Vec::new();
    for (i, &chunk) in expected.iter().enumerate() {
        steps.push(Step::Out(UrbStatus::Ok)); // CBW
        steps.push(Step::In(UrbStatus::Ok, vec![0xA5; chunk as usize])); // data
        steps.push(Step::In(UrbStatus::Ok, csw(i as u32 + 1, 0, 0)));
    }

    let mut engine = BotEngine::new();
    let mut pipes = ScriptedPipes::new(steps);
    let mut buf = vec![0u8; total as usize];
    lun_read(&mut engine, &mut pipes, 0, geo, start, &mut buf, total).expect("read failed");

    assert!(pipes.script_exhausted());
    let mut lba = start;
    for (i, &chunk) in expected.iter().enumerate() {
        let (cbw_lba, cbw_blocks) = read10_fields(&pipes.sent[i]);
        assert_eq!(cbw_lba, lba);
        assert_eq!(cbw_blocks, chunk);
        lba += chunk as u32;
    }
    assert!(buf.iter().all(|&b| b == 0xA5));
}

/// A failing middle command aborts the split read.
#[test]
fn split_read_fails_when_any_piece_fails() {
    let geo = BlockDeviceInfo {
        blk_size: 1,
        blk_num: 400_000,
    };
    let steps = vec![
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, vec![0; 0xFFFF]),
        Step::In(UrbStatus::Ok, csw(1, 0, 0)),
        // second piece: command failed -> auto-sense runs
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, vec![0; 0x1000]),
        Step::In(UrbStatus::Ok, csw(2, 0, 1)),
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, vec![0u8; 18]),
        Step::In(UrbStatus::Ok, csw(3, 0, 0)),
    ];
    let mut engine = BotEngine::new();
    let mut pipes = ScriptedPipes::new(steps);
    let mut buf = vec![0u8; 0xFFFF + 0x1000];
    let err = lun_read(
        &mut engine,
        &mut pipes,
        0,
        geo,
        0,
        &mut buf,
        0xFFFF + 0x1000,
    )
    .unwrap_err();
    assert_eq!(err, UsbError::InvalidState);
}

/// A STALL on the bulk IN pipe during the data phase is recovered by
/// an endpoint reset; the command then reports device failure (not a
/// transport error), which lets the caller's sense path run.
#[test]
fn data_phase_stall_recovers_to_command_failure() {
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),                  // CBW
        Step::In(UrbStatus::Stall, Vec::new()),    // data stalls
        Step::In(UrbStatus::Ok, csw(1, 512, 1)),   // CSW: command failed
    ]);
    let mut engine = BotEngine::new();
    let mut buf = vec![0u8; 512];
    let res = scsi_read10(&mut engine, &mut pipes, 0, 512, 0, 1, &mut buf);
    assert_eq!(res.transaction, TransactionResult::Ok);
    assert_eq!(res.command, CommandResult::Failed);
    assert_eq!(pipes.in_halts_cleared, 1);
    assert_eq!(pipes.bot_resets, 0);
}

/// If the endpoint reset itself fails, the transaction surfaces the
/// stall as a transport error.
#[test]
fn data_phase_stall_with_failed_reset_is_transport_error() {
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Stall, Vec::new()),
    ]);
    pipes.fail_clear_in = true;
    let mut engine = BotEngine::new();
    let mut buf = vec![0u8; 512];
    let res = scsi_read10(&mut engine, &mut pipes, 0, 512, 0, 1, &mut buf);
    assert_eq!(res.transaction, TransactionResult::Stall);
}

/// CSW validation: wrong tag, wrong signature, or a residue exceeding
/// the request are never accepted as success.
#[test]
fn csw_validation_rejects_bad_wrappers() {
    // wrong tag
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, vec![0u8; 512]),
        Step::In(UrbStatus::Ok, csw(0xDEAD, 0, 0)),
    ]);
    let mut engine = BotEngine::new();
    let mut buf = vec![0u8; 512];
    let res = scsi_read10(&mut engine, &mut pipes, 0, 512, 0, 1, &mut buf);
    assert_eq!(res.transaction, TransactionResult::SyncError);

    // wrong signature
    let mut bad_sig = csw(1, 0, 0);
    bad_sig[0] = 0x00;
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, vec![0u8; 512]),
        Step::In(UrbStatus::Ok, bad_sig),
    ]);
    let mut engine = BotEngine::new();
    let res = scsi_read10(&mut engine, &mut pipes, 0, 512, 0, 1, &mut buf);
    assert_eq!(res.transaction, TransactionResult::BusError);

    // residue larger than the request
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, vec![0u8; 512]),
        Step::In(UrbStatus::Ok, csw(1, 1024, 0)),
    ]);
    let mut engine = BotEngine::new();
    let res = scsi_read10(&mut engine, &mut pipes, 0, 512, 0, 1, &mut buf);
    assert_eq!(res.transaction, TransactionResult::SyncError);
}

/// Transport-level CSW rejection during connect triggers a Bulk-Only
/// reset before the failure is surfaced.
#[test]
fn transport_error_triggers_bot_reset() {
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, inquiry_response(0)),
        Step::In(UrbStatus::Ok, csw(0xBEEF, 0, 0)), // tag mismatch
    ]);
    let mut engine = BotEngine::new();
    let err = lun_connect(&mut engine, &mut pipes, 0).unwrap_err();
    assert_eq!(err, UsbError::TransactionError);
    assert_eq!(pipes.bot_resets, 1);
}

/// The tag increases monotonically across transactions.
#[test]
fn tags_are_monotonic() {
    let mut pipes = ScriptedPipes::new([
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, csw(1, 0, 0)),
        Step::Out(UrbStatus::Ok),
        Step::In(UrbStatus::Ok, csw(2, 0, 0)),
    ]);
    let mut engine = BotEngine::new();
    let r1 = stm32_otg_usbh::class::msd::scsi_test_unit_ready(&mut engine, &mut pipes, 0);
    let r2 = stm32_otg_usbh::class::msd::scsi_test_unit_ready(&mut engine, &mut pipes, 0);
    assert_eq!(r1.transaction, TransactionResult::Ok);
    assert_eq!(r2.transaction, TransactionResult::Ok);

    let tag1 = u32::from_le_bytes(pipes.sent[0][4..8].try_into().unwrap());
    let tag2 = u32::from_le_bytes(pipes.sent[1][4..8].try_into().unwrap());
    assert!(tag2 > tag1);
}
