//! Processing of queued subchannel functions (Start, Resume).
//!
//! API calls enqueue a subchannel on its channel path's function list and
//! raise the function IRQ; the reactor drains the list here while the
//! path's tx engine is free.

use super::chp::ChannelPath;
use super::fetch;
use super::response::send_command_with_data;
use super::{notify, CssCtx};
use crate::bsize;
use crate::proto::{Chop, ChopCmd, Packet};
use crate::status::DevStatus;
use crate::types::Sid;

fn suspend(ctx: &mut CssCtx, sid: Sid) {
    let schib = &mut ctx.schibs[sid as usize];
    schib.scsw.ctrl.set_ac_subchannel_active(false);
    schib.scsw.ctrl.set_ac_device_active(false);
    schib.scsw.ctrl.set_ac_suspended(true);
    schib.scsw.ctrl.set_sc_intermediate(true);
    schib.scsw.user_flags.set_u(true);
    notify(ctx, sid, DevStatus(0));
}

/// Builds and sends a Start packet. For a Write-type CCW with data in the
/// segment and a non-zero advertised device window, immediate data
/// follows the packet; the amount is the minimum of window and segment,
/// rounded down to what bsize can carry.
fn send_start_packet(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid, ccwcmd: u8) {
    let schib = &ctx.schibs[sid as usize];
    let mut count = schib.scsw.count;
    let write = schib.scsw.ctrl.ccw_write();
    if write {
        count = count.min(schib.mda.devcount);
    }

    let ua = schib.pmcw.unit_addr;
    let esize = bsize::encode(count);
    let p = Packet::with_esize(Chop::make(ChopCmd::Start, 0), ua, ccwcmd, esize);
    if write && count > 0 {
        let count = esize.decode();
        send_command_with_data(ctx, chp, sid, p, count);
    } else {
        chp.send_tx_packet(ctx.tracer, sid, p);
    }
}

pub(crate) fn suspend_or_send_start_packet(
    ctx: &mut CssCtx,
    chp: &mut ChannelPath,
    sid: Sid,
    ccwcmd: u8,
) {
    debug_assert!(!chp.tx_active);

    if ctx.schibs[sid as usize].mda.ccw_flags.suspend() {
        suspend(ctx, sid);
    } else {
        send_start_packet(ctx, chp, sid, ccwcmd);
    }
}

fn process_schib_start(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    let ccwcmd = {
        let ram = ctx.mem.read().unwrap();
        let schib = &mut ctx.schibs[sid as usize];
        let c = &mut schib.scsw.ctrl;
        c.set_sc(0);
        c.set_ac_start_pending(false);
        c.set_fc_start(true);
        fetch::fetch_first_command_ccw(schib, &ram, ctx.tracer, sid)
    };

    let schib = &mut ctx.schibs[sid as usize];
    if schib.scsw.schs.0 != 0 {
        schib.scsw.user_flags.set_cc(1);
        schib.scsw.ctrl.set_sc_alert(true);
        notify(ctx, sid, DevStatus(0));
        return;
    }

    suspend_or_send_start_packet(ctx, chp, sid, ccwcmd);
}

fn process_schib_resume(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    let ccwcmd = {
        let ram = ctx.mem.read().unwrap();
        let schib = &mut ctx.schibs[sid as usize];
        schib.scsw.user_flags.set_u(false);
        let c = &mut schib.scsw.ctrl;
        c.set_sc(0);
        c.set_ac_resume_pending(false);
        c.set_fc_start(true);
        fetch::fetch_resume_ccw(schib, &ram, ctx.tracer, sid)
    };

    let schib = &mut ctx.schibs[sid as usize];
    if schib.scsw.schs.0 != 0 {
        schib.scsw.ctrl.set_sc_alert(true);
        notify(ctx, sid, DevStatus(0));
        return;
    }

    // a resume proceeds past the Suspend flag that parked the program
    send_start_packet(ctx, chp, sid, ccwcmd);
}

/// Prepares and sends the channel operation for a subchannel popped off
/// the function list. Halt and Clear are reserved and never enqueued.
pub(crate) fn process_schib_func(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    ctx.schibs[sid as usize].scsw.schs.0 = 0;
    let ctrl = ctx.schibs[sid as usize].scsw.ctrl;

    if ctrl.ac_start_pending() {
        process_schib_start(ctx, chp, sid);
    } else if ctrl.ac_resume_pending() {
        process_schib_resume(ctx, chp, sid);
    }
    // no activity pending: no-op
}
