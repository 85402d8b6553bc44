//! CU-side handling of packets and data arriving from the CSS.

use log::*;

use super::callback::{callback_devib, default_devib_callback};
use super::Cu;
use crate::ccw::cmd_is_write;
use crate::proto::{ChopCmd, Packet};
use crate::trc::{records, RecordType};
use crate::types::UnitAddr;

/// A Start operation: latch the CCW command and the announced window.
/// For a Write-type command with immediate data the burst is routed
/// straight into the advertised buffer and the device's callback waits
/// for it to land; otherwise the device is called back immediately.
fn handle_rx_chop_start(cu: &mut Cu, ua: UnitAddr, p: Packet) {
    let ccwcmd = p.p0;
    let count = p.esize_count();

    {
        let devib = cu.devib_mut(ua);
        if devib.is_started() {
            // a spurious second Start resets the previous program
            warn!("start for already-started ua {ua}");
        }
        let traced = devib.flags.traced();
        devib.flags.0 = 0;
        devib.flags.set_traced(traced);
        devib.flags.set_started(true);

        if cmd_is_write(ccwcmd) {
            devib.flags.set_cmd_write(true);
            if count > 0 {
                // immediate data follows straight into the advertised
                // buffer; callback once it lands
                debug_assert!(count <= devib.size);
                devib.flags.set_rx_data_required(true);
                let addr = devib.addr;
                cu.rx_active = Some(ua);
                let ch = cu.channel_mut();
                ch.rx.start_dst_data(addr, u32::from(count));
                return;
            }
        } else {
            // Read-type: the payload announces the window we may write
            devib.size = count;
        }
    }

    cu.channel_mut().rx.start_dst_cmdbuf();
    callback_devib(cu, ua);
}

/// A Data operation: the body of a Write-type CCW segment is about to
/// arrive (or is implicit zeroes).
fn handle_rx_chop_data(cu: &mut Cu, ua: UnitAddr, p: Packet) {
    let count = u32::from(p.count());
    let zeroes = p.chop.skip();
    let stop = p.chop.stop();

    let devib = cu.devib_mut(ua);
    debug_assert!(devib.is_started());
    debug_assert!(devib.flags.rx_data_required());
    if stop {
        devib.flags.set_stopping(true);
    }
    let dstaddr = devib.addr;

    if count == 0 {
        // an empty burst delivers only its flags
        devib.flags.set_rx_data_required(false);
        cu.channel_mut().rx.start_dst_cmdbuf();
        callback_devib(cu, ua);
        return;
    }

    cu.rx_active = Some(ua);
    let ch = cu.channel_mut();
    if zeroes {
        ch.rx.start_dst_data_src_zeroes(dstaddr, count);
    } else {
        ch.rx.start_dst_data(dstaddr, count);
    }
}

/// A Room operation: the CSS announces how much more the device may send
/// on a Read-type continuation.
fn handle_rx_chop_room(cu: &mut Cu, ua: UnitAddr, p: Packet) {
    let count = p.count();
    let stop = p.chop.stop();

    let devib = cu.devib_mut(ua);
    debug_assert!(devib.is_started());
    devib.size = count;
    if stop {
        devib.flags.set_stopping(true);
    }

    cu.channel_mut().rx.start_dst_cmdbuf();
    callback_devib(cu, ua);
}

fn handle_rx_command_complete(cu: &mut Cu) {
    let p = cu.channel_mut().rx.packet();
    let ua = p.unit_addr;
    if ua as usize >= cu.num_devibs() {
        error!("packet from CSS for unit address {ua} out of range");
        cu.channel_mut().rx.start_dst_cmdbuf();
        return;
    }

    cu.tracer().write_cond(
        cu.is_traced() || cu.devib(ua).is_traced(),
        RecordType::CusRxCommandComplete,
        &records::dev_packet(cu.cuaddr(), ua, p),
    );

    {
        let devib = cu.devib_mut(ua);
        devib.op = p.chop;
        devib.payload = [p.p0, p.p1];
    }

    match p.chop.command() {
        Some(ChopCmd::Start) => handle_rx_chop_start(cu, ua, p),
        Some(ChopCmd::Data) => handle_rx_chop_data(cu, ua, p),
        Some(ChopCmd::Room) => handle_rx_chop_room(cu, ua, p),
        _ => {
            // transport desync: reject with a protocol-error sense
            error!("unexpected operation {:#04x} from CSS", p.chop.0);
            cu.channel_mut().rx.start_dst_cmdbuf();
            default_devib_callback(cu, ua);
        }
    }
}

fn handle_rx_data_complete(cu: &mut Cu, ua: UnitAddr) {
    cu.rx_active = None;
    cu.channel_mut().rx.start_dst_cmdbuf();

    cu.tracer().write_cond(
        cu.is_traced() || cu.devib(ua).is_traced(),
        RecordType::CusRxDataComplete,
        &records::dev_byte(cu.cuaddr(), ua, 0),
    );

    let devib = cu.devib_mut(ua);
    debug_assert!(devib.flags.rx_data_required());
    devib.flags.set_rx_data_required(false);
    callback_devib(cu, ua);
}

/// Entry point for an rx completion on the CU's link.
pub(crate) fn handle_rx_complete(cu: &mut Cu) {
    if let Some(ua) = cu.rx_active {
        handle_rx_data_complete(cu, ua);
    } else {
        handle_rx_command_complete(cu);
    }
}
