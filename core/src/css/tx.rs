//! CSS-side tx completion handling.

use log::*;

use super::chp::ChannelPath;
use super::{notify, CssCtx};
use crate::proto::ChopCmd;
use crate::status::DevStatus;
use crate::trc::{records, RecordType};
use crate::txsm::TxsmRun;
use crate::types::Sid;

/// A Start has fully left the link (command plus any immediate data):
/// the subchannel and device become active.
fn handle_tx_start_complete(ctx: &mut CssCtx, sid: Sid) {
    let schib = &mut ctx.schibs[sid as usize];
    schib.scsw.ctrl.set_ac_subchannel_active(true);
    schib.scsw.ctrl.set_ac_device_active(true);

    if schib.mda.ccw_flags.pci() {
        // flag that the channel program has started and carry on
        schib.scsw.ctrl.set_sc_intermediate(true);
        notify(ctx, sid, DevStatus(0));
    }
}

/// Data following a Data command has been sent.
fn handle_tx_data_after_data_complete(ctx: &mut CssCtx, sid: Sid) {
    let schib = &mut ctx.schibs[sid as usize];
    if schib.mda.ccw_flags.pci() && schib.mda.ccw_flags.cd() {
        // PCI on a data-chained CCW: flag that the previous segment has
        // been consumed and carry on
        schib.scsw.ctrl.set_sc_intermediate(true);
        notify(ctx, sid, DevStatus(0));
    }
}

fn handle_tx_data_complete(ctx: &mut CssCtx, chp: &mut ChannelPath) {
    // reread the packet to find where the data went
    let p = chp.channel.as_ref().unwrap().tx.packet();
    let Some(sid) = chp.contains_ua(p.unit_addr).then(|| chp.sid_of(p.unit_addr)) else {
        error!("tx data completion for out-of-range unit address");
        return;
    };

    match p.chop.command() {
        // Start command sent with immediate data
        Some(ChopCmd::Start) => handle_tx_start_complete(ctx, sid),
        Some(ChopCmd::Data) => handle_tx_data_after_data_complete(ctx, sid),
        _ => error!("unexpected tx packet {:#04x} with data", p.chop.0),
    }
}

fn handle_tx_command_complete(ctx: &mut CssCtx, chp: &mut ChannelPath) {
    let p = chp.channel.as_ref().unwrap().tx.packet();
    if p.chop.command() == Some(ChopCmd::Start) && chp.contains_ua(p.unit_addr) {
        // Start command sent with no immediate data
        handle_tx_start_complete(ctx, chp.sid_of(p.unit_addr));
    }
}

/// Entry point for a tx completion on a channel path: advances the
/// pending-data sequencer and, once the whole operation has been sent,
/// dispatches on what it was.
pub(crate) fn handle_tx_complete(ctx: &mut CssCtx, chp: &mut ChannelPath) {
    ctx.tracer.write_cond(
        chp.traced,
        RecordType::CssTxComplete,
        &records::byte(chp.tx_pending.state() as u8),
    );

    debug_assert!(chp.tx_active);
    let res = chp
        .tx_pending
        .run(&mut chp.channel.as_mut().unwrap().tx);
    if res == TxsmRun::Acted {
        return; // tx engine still busy sending the pending data
    }

    chp.tx_active = false;

    if res == TxsmRun::Finished {
        handle_tx_data_complete(ctx, chp);
    } else {
        handle_tx_command_complete(ctx, chp);
    }
}
