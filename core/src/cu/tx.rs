//! CU-side tx queue and completion handling.
//!
//! Each CU owns a singly-linked queue of unit addresses whose devibs
//! have an outbound operation prepared. Pushing onto an empty queue
//! kicks the transmit engine; completion of each command (and any
//! trailing data) pops the head and sends the next.

use log::*;

use super::callback::callback_devib;
use super::Cu;
use crate::proto::{ChopCmd, Packet};
use crate::trc::{records, RecordType};
use crate::txsm::TxsmRun;
use crate::types::UnitAddr;

/// Appends `ua` to the tx queue; returns whether the queue was empty
/// (in which case the caller must kick the engine).
pub(crate) fn push_tx_list(cu: &mut Cu, ua: UnitAddr) -> bool {
    match cu.tx_tail {
        None => {
            debug_assert!(cu.tx_head.is_none());
            cu.tx_head = Some(ua);
            cu.tx_tail = Some(ua);
            true
        }
        Some(tail_ua) => {
            debug_assert_eq!(cu.devibs[tail_ua as usize].next, tail_ua);
            cu.devibs[tail_ua as usize].next = ua;
            cu.tx_tail = Some(ua);
            cu.tracer.write_cond(
                cu.traced || cu.devibs[ua as usize].is_traced(),
                RecordType::CusQueueCommand,
                &records::dev_byte(cu.cuaddr, ua, tail_ua),
            );
            false
        }
    }
}

fn pop_tx_list(cu: &mut Cu) {
    let ua = cu.tx_head.expect("pop from empty tx list");
    let next = cu.devibs[ua as usize].next;
    if next == ua {
        cu.tx_head = None;
        cu.tx_tail = None;
    } else {
        // unlink by pointing the popped devib at itself
        cu.devibs[ua as usize].next = ua;
        cu.tx_head = Some(next);
    }
}

/// Finalises the devib's prepared operation into a wire packet,
/// arranging any trailing data and the post-send callback.
fn make_packet(cu: &mut Cu, ua: UnitAddr) -> Packet {
    let devib = &mut cu.devibs[ua as usize];
    let op = devib.op;

    match op.command() {
        Some(ChopCmd::UpdateStatus) => {
            let devs = crate::status::DevStatus(devib.payload[0]);
            if devs.device_end() {
                debug_assert!(devs.channel_end() || !devib.is_started());
                devib.flags.set_started(false);
                devib.flags.set_stopping(false);
            }
        }
        Some(ChopCmd::Data) => {
            let count = devib.payload_count();
            debug_assert!(!devib.is_cmd_write());
            debug_assert!(count <= devib.size);
            debug_assert!(!cu.tx_pending.busy());

            // a final burst implies ChannelEnd|DeviceEnd at the CSS;
            // the program is over for this device too
            if op.final_burst() {
                devib.flags.set_started(false);
                devib.flags.set_stopping(false);
            }

            // without ResponseRequired the device is called back as soon
            // as the data has left; with it, the callback waits for the
            // peer's Room update. Skip sends carry no data at all.
            if op.skip() || op.response_required() {
                cu.tx_callback_ua = None;
            } else {
                cu.tx_callback_ua = Some(ua);
            }

            if !op.skip() {
                let addr = devib.addr;
                cu.tx_pending.set_pending(addr, count);
            }
        }
        Some(ChopCmd::RequestRead) => {
            debug_assert!(devib.is_cmd_write());
        }
        _ => (),
    }

    let devib = &cu.devibs[ua as usize];
    let p = Packet::new(devib.op, ua, devib.payload[0], devib.payload[1]);
    cu.tracer.write_cond(
        cu.traced || devib.is_traced(),
        RecordType::CusMakePacket,
        &records::dev_packet(cu.cuaddr, ua, p),
    );
    p
}

pub(crate) fn send_command_to_css(cu: &mut Cu) {
    let ua = cu.tx_head.expect("send with empty tx list");
    let p = make_packet(cu, ua);
    cu.tracer.write_cond(
        cu.traced || cu.devibs[ua as usize].is_traced(),
        RecordType::CusSendTxPacket,
        &records::dev_packet(cu.cuaddr, ua, p),
    );
    let ch = cu.channel_mut();
    ch.tx.set_packet(p);
    ch.tx.start_src_cmdbuf();
}

fn try_tx_next_command(cu: &mut Cu) {
    if cu.tx_head.is_some() {
        send_command_to_css(cu);
    }
}

/// Entry point for a tx completion on the CU's link.
pub(crate) fn handle_tx_complete(cu: &mut Cu) {
    let tx_callback_ua = cu.tx_callback_ua;
    cu.tracer.write_cond(
        cu.traced,
        RecordType::CusTxComplete,
        &records::id_byte(cu.cuaddr, cu.tx_pending.state() as u8),
    );

    let Some(ch) = cu.channel.as_mut() else {
        error!("tx completion without a configured channel");
        return;
    };
    match cu.tx_pending.run(&mut ch.tx) {
        TxsmRun::Acted => (), // data transfer launched, not finished yet
        TxsmRun::Finished => {
            // command plus trailing data fully sent
            pop_tx_list(cu);
            if let Some(ua) = tx_callback_ua {
                cu.tx_callback_ua = None;
                callback_devib(cu, ua);
            }
            try_tx_next_command(cu);
        }
        TxsmRun::Noop => {
            // command-only send complete
            let ua = cu.tx_head.expect("tx completion with empty tx list");
            pop_tx_list(cu);
            if cu.devibs[ua as usize].flags.tx_callback() {
                cu.devibs[ua as usize].flags.set_tx_callback(false);
                callback_devib(cu, ua);
            }
            try_tx_next_command(cu);
        }
    }
}
