//! Building and sending response operations to a CU: chained Start
//! packets, Data bodies answering a RequestRead, and Room updates.

use super::chp::ChannelPath;
use super::fetch;
use super::func::suspend_or_send_start_packet;
use super::{notify, CssCtx};
use crate::proto::{Chop, ChopCmd, Packet};
use crate::status::DevStatus;
use crate::types::Sid;

/// Sends a command packet followed by `count` bytes consumed from the
/// current CCW segment (or generated as implicit zeroes when the Skp CCW
/// flag is set). Ends the segment and data-chains when it empties,
/// ORring Stop and End flags into the chop as needed.
pub(crate) fn send_command_with_data(
    ctx: &mut CssCtx,
    chp: &mut ChannelPath,
    sid: Sid,
    mut p: Packet,
    count: u16,
) {
    debug_assert!(!chp.tx_active);
    debug_assert!(count != 0);

    let (zeroes, addr) = {
        let schib = &mut ctx.schibs[sid as usize];
        let zeroes = schib.mda.ccw_flags.skp();
        let addr = if zeroes { 0 } else { schib.mda.data_addr };

        let rescount = schib.scsw.count;
        debug_assert!(count <= rescount);
        let rescount = rescount - count;
        if rescount > 0 {
            if !zeroes {
                schib.mda.data_addr += u32::from(count);
            }
            schib.scsw.count = rescount;
        } else {
            // segment finished: try data chaining for the next
            let ram = ctx.mem.read().unwrap();
            fetch::fetch_chain_data_ccw(schib, &ram, ctx.tracer, sid);
            if schib.scsw.schs.0 != 0 {
                p.chop.set_stop(true);
            }
            if schib.scsw.count == 0 {
                p.chop.set_end(true);
            }
        }
        (zeroes, addr)
    };

    if zeroes {
        p.chop.set_skip(true);
    } else {
        chp.tx_pending.set_pending(addr, count);
    }

    chp.send_tx_packet(ctx.tracer, sid, p);
}

/// Answers a RequestRead with a Data packet carrying the stashed
/// requested count, capped at what the current segment holds. A request
/// reaching (or passing) the segment end carries the End flag once the
/// segment chain is exhausted, telling the device no more data is
/// coming.
pub(crate) fn send_data_response(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    let (count, ua) = {
        let schib = &ctx.schibs[sid as usize];
        let count = schib.mda.devcount.min(schib.scsw.count);
        (count, schib.pmcw.unit_addr)
    };

    let mut p = Packet::with_count(Chop::make(ChopCmd::Data, 0), ua, count);
    if count == 0 {
        // nothing left to consume from the segment chain
        p.chop.set_end(true);
        chp.send_tx_packet(ctx.tracer, sid, p);
    } else {
        send_command_with_data(ctx, chp, sid, p, count);
    }
}

/// Advertises how much room the current segment has left for the device
/// to send into.
pub(crate) fn send_update_room(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    debug_assert!(!chp.tx_active);

    let schib = &ctx.schibs[sid as usize];
    let mut chop = Chop::make(ChopCmd::Room, 0);
    if schib.scsw.schs.0 != 0 {
        chop.set_stop(true);
    }

    let p = Packet::with_count(chop, schib.pmcw.unit_addr, schib.scsw.count);
    chp.send_tx_packet(ctx.tracer, sid, p);
}

/// Command-chains to the next CCW and sends its Start. A fetch error
/// terminates the program with Alert status; a PCI flag on the new CCW
/// raises an intermediate interruption before proceeding.
pub(crate) fn do_command_chain_and_send_start(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    debug_assert!(!chp.tx_active);

    let ccwcmd = {
        let ram = ctx.mem.read().unwrap();
        fetch::fetch_chain_command_ccw(&mut ctx.schibs[sid as usize], &ram, ctx.tracer, sid)
    };

    let schib = &mut ctx.schibs[sid as usize];
    if schib.scsw.schs.0 != 0 {
        schib.scsw.ctrl.set_ac_subchannel_active(false);
        schib.scsw.ctrl.set_ac_device_active(false);
        schib.scsw.ctrl.set_sc_alert(true);
        notify(ctx, sid, DevStatus(0));
        return;
    }

    // the start function continues across the chain
    schib.scsw.ctrl.set_fc_start(true);

    if schib.mda.ccw_flags.pci() {
        schib.scsw.ctrl.set_sc_intermediate(true);
        notify(ctx, sid, DevStatus(0));
    }

    suspend_or_send_start_packet(ctx, chp, sid, ccwcmd);
}

/// Generates the queued response for a subchannel popped off the
/// response list once the tx engine came free.
pub(crate) fn process_schib_response(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    debug_assert!(!chp.tx_active);

    let ctrl = ctx.schibs[sid as usize].scsw.ctrl;
    if !ctrl.ac_device_active() {
        // the device has ended its program; the pending response is a
        // command chain followed by the new CCW's Start
        do_command_chain_and_send_start(ctx, chp, sid);
    } else if ctrl.ccw_write() {
        // Write-type CCW: the pending response answers a RequestRead
        send_data_response(ctx, chp, sid);
    } else {
        // Read-type CCW: the pending response is a Room update
        send_update_room(ctx, chp, sid);
    }
}
