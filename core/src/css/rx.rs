//! CSS-side handling of packets and data arriving from a CU.

use log::*;

use super::chp::ChannelPath;
use super::fetch;
use super::response::{
    do_command_chain_and_send_start, send_data_response, send_update_room,
};
use super::{notify, CssCtx};
use crate::proto::{ChopCmd, Packet};
use crate::status::DevStatus;
use crate::trc::{records, RecordType};
use crate::types::Sid;

/// Terminates a channel program on DeviceEnd. Returns whether the caller
/// should deliver status-pending (false when command chaining continues
/// the program).
fn end_channel_program(
    ctx: &mut CssCtx,
    chp: &mut ChannelPath,
    sid: Sid,
    devs: DevStatus,
    advcount: u16,
) -> bool {
    let do_chain = {
        let schib = &mut ctx.schibs[sid as usize];
        schib.scsw.ctrl.set_ac_device_active(false);
        // remember the advertised window for start-write-immediate data
        schib.mda.devcount = advcount;

        // DeviceEnd without ChannelEnd is a malformed end
        if !devs.channel_end() {
            schib.scsw.schs.set_interface_control_check(true);
            schib.scsw.ctrl.set_sc_alert(true);
            return true;
        }

        // a program ending with the segment partly consumed is an
        // incorrect-length indication unless the CCW suppresses it
        if schib.scsw.count != 0 && !schib.mda.ccw_flags.sli() {
            schib.scsw.schs.set_incorrect_length(true);
        }

        // only command-chain on a "normal" ending status
        let unusual = devs.0
            & !(DevStatus(0)
                .with_channel_end(true)
                .with_device_end(true)
                .with_status_modifier(true))
                .0
            != 0;
        let do_chain = schib.mda.ccw_flags.cc() && !unusual;
        if !do_chain {
            schib.scsw.ctrl.set_sc_secondary(true);
            return true;
        }

        // StatusModifier skips the next CCW before the chain fetch
        if devs.status_modifier() {
            schib.scsw.ccw_addr += crate::ccw::Ccw::SIZE;
        }
        do_chain
    };
    debug_assert!(do_chain);

    if chp.tx_active {
        let ua = ctx.schibs[sid as usize].pmcw.unit_addr;
        chp.ua_response_slist.push(ctx.schibs, chp.first_sid, ua);
    } else {
        do_command_chain_and_send_start(ctx, chp, sid);
    }

    false
}

/// Handles a device status, from an UpdateStatus packet or implied by a
/// Data burst carrying the End flag.
///
/// An unsolicited status (no ChannelEnd) normally records the advertised
/// window and alerts the application; but if FC.Start shows we have a
/// Start crossing it in flight, the device will accept that Start and
/// the stale status is discarded.
fn handle_device_status(
    ctx: &mut CssCtx,
    chp: &mut ChannelPath,
    sid: Sid,
    devs: DevStatus,
    advcount: u16,
) {
    let mut do_notify = true;

    if devs.channel_end() {
        // primary or primary+secondary status
        {
            let schib = &mut ctx.schibs[sid as usize];
            schib.scsw.ctrl.set_sc_primary(true);
            schib.scsw.ctrl.set_ac_subchannel_active(false);
            schib.scsw.ctrl.set_fc_start(false);
        }
        if devs.device_end() {
            do_notify = end_channel_program(ctx, chp, sid, devs, advcount);
        }
    } else {
        let schib = &mut ctx.schibs[sid as usize];
        if schib.scsw.ctrl.fc_start() {
            // crossed with an in-flight Start: discard
            return;
        }
        schib.mda.devcount = advcount;
        schib.scsw.ctrl.set_sc_alert(true);
    }

    if do_notify {
        notify(ctx, sid, devs);
    }
}

/// Completion of a data burst previously routed into (or discarded
/// around) a subchannel's current CCW segment.
fn handle_rx_data_complete(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid) {
    chp.rx_data_for_ua = None;

    if chp.rx_overrun {
        // the burst exceeded the segment and was discarded; the check is
        // already recorded in scsw.schs
        chp.rx_overrun = false;
        chp.rx_response_required = false;
        chp.rx_data_end_ds = DevStatus(0);
        notify(ctx, sid, DevStatus(0));
        return;
    }

    let devs = chp.rx_data_end_ds;
    ctx.tracer.write_cond(
        chp.traced,
        RecordType::CssRxDataComplete,
        &records::sid_byte(sid, devs.0),
    );
    if devs.0 != 0 {
        // the Data chop carried End: implicit immediate device status
        chp.rx_data_end_ds = DevStatus(0);
        handle_device_status(ctx, chp, sid, devs, 0);
        return;
    }

    {
        let schib = &mut ctx.schibs[sid as usize];
        if schib.mda.ccw_flags.pci() && schib.mda.ccw_flags.cd() {
            // PCI on a data-chained CCW: flag progress and carry on
            schib.scsw.ctrl.set_sc_intermediate(true);
            notify(ctx, sid, DevStatus(0));
        }
    }

    if !chp.rx_response_required {
        return;
    }
    chp.rx_response_required = false;

    if chp.tx_active {
        let ua = ctx.schibs[sid as usize].pmcw.unit_addr;
        chp.ua_response_slist.push(ctx.schibs, chp.first_sid, ua);
    } else {
        send_update_room(ctx, chp, sid);
    }
}

/// An incoming Data command: the device is about to send (or skip) a
/// burst for the current Read-type CCW segment.
fn handle_rx_data_command(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid, p: Packet) {
    let ua = p.unit_addr;
    let count = p.count();
    let zeroes = p.chop.skip();

    debug_assert!(chp.rx_data_for_ua.is_none());
    chp.rx_data_for_ua = Some(ua);

    if p.chop.response_required() {
        chp.rx_response_required = true;
    }
    if p.chop.final_burst() {
        chp.rx_data_end_ds = DevStatus::end_ok();
    }

    if count == 0 {
        // an empty burst delivers only its flags
        handle_rx_data_complete(ctx, chp, sid);
        return;
    }

    let rescount = ctx.schibs[sid as usize].scsw.count;
    if count > rescount {
        // device overran the announced window: take the burst off the
        // link but into nowhere, and alert
        let schib = &mut ctx.schibs[sid as usize];
        schib.scsw.schs.set_incorrect_length(true);
        schib.scsw.ctrl.set_sc_alert(true);
        chp.rx_overrun = true;
        let ch = chp.channel.as_mut().unwrap();
        if zeroes {
            handle_rx_data_complete(ctx, chp, sid);
        } else {
            ch.rx.start_dst_discard(u32::from(count));
        }
        return;
    }

    // consume the segment
    let (addr, discard) = {
        let schib = &mut ctx.schibs[sid as usize];
        let addr = schib.mda.data_addr;
        let discard = schib.mda.ccw_flags.skp();
        if count == rescount {
            let ram = ctx.mem.read().unwrap();
            fetch::fetch_chain_data_ccw(schib, &ram, ctx.tracer, sid);
        } else {
            schib.mda.data_addr += u32::from(count);
            schib.scsw.count = rescount - count;
        }
        (addr, discard)
    };

    let ch = chp.channel.as_mut().unwrap();
    if discard {
        // Skp flag set in the CCW: the data never lands
        if zeroes {
            // nothing even travels the link
            handle_rx_data_complete(ctx, chp, sid);
        } else {
            ch.rx.start_dst_discard(u32::from(count));
        }
    } else if zeroes {
        ch.rx.start_dst_data_src_zeroes(addr, u32::from(count));
    } else {
        ch.rx.start_dst_data(addr, u32::from(count));
    }
}

/// An incoming RequestRead: the device asks for `count` bytes from the
/// current Write-type CCW segment.
fn handle_request_read(ctx: &mut CssCtx, chp: &mut ChannelPath, sid: Sid, p: Packet) {
    let count = p.count();

    {
        let schib = &mut ctx.schibs[sid as usize];
        if !schib.scsw.ctrl.ccw_write() {
            // device requested data from a non-Write CCW
            schib.scsw.schs.set_interface_control_check(true);
            schib.scsw.ctrl.set_sc_alert(true);
            notify(ctx, sid, DevStatus(0));
            return;
        }

        // stash the requested count where the (possibly deferred)
        // response can retrieve it
        schib.mda.devcount = count;
    }

    if chp.tx_active {
        let ua = ctx.schibs[sid as usize].pmcw.unit_addr;
        chp.ua_response_slist.push(ctx.schibs, chp.first_sid, ua);
    } else {
        send_data_response(ctx, chp, sid);
    }
}

fn handle_rx_command_complete(ctx: &mut CssCtx, chp: &mut ChannelPath) {
    let p = chp.channel.as_mut().unwrap().rx.packet();
    let ua = p.unit_addr;
    if !chp.contains_ua(ua) {
        error!("packet from CU for unit address {ua} outside path range");
        return;
    }
    let sid = chp.sid_of(ua);
    ctx.tracer.write_cond(
        chp.traced || ctx.schibs[sid as usize].is_traced(),
        RecordType::CssRxCommandComplete,
        &records::packet_sid(p, sid),
    );

    match p.chop.command() {
        Some(ChopCmd::Data) => handle_rx_data_command(ctx, chp, sid, p),
        Some(ChopCmd::UpdateStatus) => {
            handle_device_status(ctx, chp, sid, p.devs(), p.esize_count());
        }
        Some(ChopCmd::RequestRead) => handle_request_read(ctx, chp, sid, p),
        _ => {
            // transport desync; record on the addressed subchannel
            error!("unexpected operation {:#04x} from CU", p.chop.0);
            let schib = &mut ctx.schibs[sid as usize];
            schib.scsw.schs.set_interface_control_check(true);
            schib.scsw.ctrl.set_sc_alert(true);
            notify(ctx, sid, DevStatus(0));
        }
    }
}

/// Entry point for an rx completion on a channel path: either a data
/// burst finished landing, or a command packet arrived.
pub(crate) fn handle_rx_complete(ctx: &mut CssCtx, chp: &mut ChannelPath) {
    if let Some(ua) = chp.rx_data_for_ua {
        let sid = chp.sid_of(ua);
        handle_rx_data_complete(ctx, chp, sid);
    } else {
        handle_rx_command_complete(ctx, chp);
    }

    if chp.rx_data_for_ua.is_none() {
        chp.channel.as_mut().unwrap().rx.start_dst_cmdbuf();
    }
}
