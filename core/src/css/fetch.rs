//! CCW fetch and chain logic.
//!
//! Three fetch variants feed the subchannel state machine: the first CCW
//! of a program (increments the CCW address, forbids a leading TIC), a
//! resume fetch (refetches the previous CCW without incrementing) and a
//! chain fetch (follows at most one TIC; a second consecutive TIC is a
//! program check). Fetch errors land in `scsw.schs` and leave the command
//! as 0.

use super::schib::Schib;
use crate::ccw::{cmd_is_write, Ccw, CMD_TIC};
use crate::mem::Ram;
use crate::trc::{records, RecordType, Tracer};
use crate::types::Sid;

fn update_ccw_cmd_write_flag(schib: &mut Schib, ccwcmd: u8) {
    schib.scsw.ctrl.set_ccw_write(cmd_is_write(ccwcmd));
}

/// Stores all non-command fields of a fetched CCW into the schib:
/// the next CCW address, the current flags, the segment count and the
/// data pointer.
fn update_ccw_fields(schib: &mut Schib, next_ccw_addr: u32, ccw: Ccw) {
    schib.scsw.ccw_addr = next_ccw_addr;
    schib.mda.ccw_flags = ccw.flags;
    schib.scsw.count = ccw.count;
    schib.mda.data_addr = ccw.addr;
}

fn trace_fetch(tracer: &Tracer, schib: &Schib, sid: Sid, addr: u32, ccw: Ccw) {
    tracer.write_cond(
        schib.is_traced(),
        RecordType::CssCcwFetch,
        &records::ccw_addr_sid(ccw, addr, sid),
    );
}

/// Fetches the first CCW of a channel program.
pub(crate) fn fetch_first_command_ccw(
    schib: &mut Schib,
    ram: &Ram,
    tracer: &Tracer,
    sid: Sid,
) -> u8 {
    let ccw_addr = schib.scsw.ccw_addr;
    let ccw = Ccw::fetch(ram, ccw_addr);
    trace_fetch(tracer, schib, sid, ccw_addr, ccw);

    if ccw.cmd == CMD_TIC {
        schib.scsw.schs.set_program_check(true);
        return 0;
    }

    update_ccw_fields(schib, ccw_addr + Ccw::SIZE, ccw);
    update_ccw_cmd_write_flag(schib, ccw.cmd);
    ccw.cmd
}

/// Refetches the CCW preceding `scsw.ccw_addr` for a resume, leaving the
/// CCW address where it was.
pub(crate) fn fetch_resume_ccw(schib: &mut Schib, ram: &Ram, tracer: &Tracer, sid: Sid) -> u8 {
    let ccw_addr = schib.scsw.ccw_addr - Ccw::SIZE;
    let ccw = Ccw::fetch(ram, ccw_addr);
    trace_fetch(tracer, schib, sid, ccw_addr, ccw);

    if ccw.cmd == CMD_TIC {
        schib.scsw.schs.set_program_check(true);
        return 0;
    }

    update_ccw_fields(schib, ccw_addr + Ccw::SIZE, ccw);
    update_ccw_cmd_write_flag(schib, ccw.cmd);
    ccw.cmd
}

/// Fetches the next CCW of a chain, following at most one TIC.
pub(crate) fn fetch_chain_ccw(schib: &mut Schib, ram: &Ram, tracer: &Tracer, sid: Sid) -> u8 {
    let mut ccw_addr = schib.scsw.ccw_addr;
    let mut ccw = Ccw::fetch(ram, ccw_addr);
    trace_fetch(tracer, schib, sid, ccw_addr, ccw);

    if ccw.cmd == CMD_TIC {
        ccw_addr = ccw.addr;
        ccw = Ccw::fetch(ram, ccw_addr);
        trace_fetch(tracer, schib, sid, ccw_addr, ccw);
        if ccw.cmd == CMD_TIC {
            schib.scsw.schs.set_program_check(true);
            return 0;
        }
    }

    update_ccw_fields(schib, ccw_addr + Ccw::SIZE, ccw);
    ccw.cmd
}

/// Continues a data chain at end of segment, if the current CCW asks for
/// one. On fetch error, or on the forbidden Suspend-while-data-chaining
/// combination, the segment count is zeroed and `scsw.schs` records the
/// check.
pub(crate) fn fetch_chain_data_ccw(schib: &mut Schib, ram: &Ram, tracer: &Tracer, sid: Sid) {
    if !schib.mda.ccw_flags.cd() {
        // ChainData not set so nothing to do, not an error
        schib.scsw.count = 0;
        return;
    }

    let _ = fetch_chain_ccw(schib, ram, tracer, sid);
    if schib.scsw.schs.0 != 0 {
        schib.scsw.count = 0;
        return;
    }

    if schib.mda.ccw_flags.suspend() {
        // Suspend not allowed when data chaining
        schib.scsw.count = 0;
        schib.scsw.schs.set_program_check(true);
    }
}

/// Continues a command chain. The chain-command flag must already be set
/// in the current CCW flags.
pub(crate) fn fetch_chain_command_ccw(
    schib: &mut Schib,
    ram: &Ram,
    tracer: &Tracer,
    sid: Sid,
) -> u8 {
    debug_assert!(schib.mda.ccw_flags.cc());
    let ccwcmd = fetch_chain_ccw(schib, ram, tracer, sid);
    if schib.scsw.schs.0 != 0 {
        return 0;
    }

    update_ccw_cmd_write_flag(schib, ccwcmd);
    ccwcmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccw::CcwFlags;
    use crate::trc::{Tracer, CSS_BUFFERSET_MAGIC};

    fn setup() -> (Schib, Ram, Tracer) {
        (
            Schib::new(0),
            Ram::new(256),
            Tracer::new(CSS_BUFFERSET_MAGIC),
        )
    }

    #[test]
    fn first_fetch_loads_fields() {
        let (mut schib, mut ram, tracer) = setup();
        Ccw::new(0x03, CcwFlags(0).with_cd(true), 16, 0x80).store(&mut ram, 0x20);
        schib.scsw.ccw_addr = 0x20;

        let cmd = fetch_first_command_ccw(&mut schib, &ram, &tracer, 0);
        assert_eq!(cmd, 0x03);
        assert_eq!(schib.scsw.ccw_addr, 0x28);
        assert_eq!(schib.scsw.count, 16);
        assert_eq!(schib.mda.data_addr, 0x80);
        assert!(schib.mda.ccw_flags.cd());
        assert!(schib.scsw.ctrl.ccw_write());
    }

    #[test]
    fn initial_tic_is_program_check() {
        let (mut schib, mut ram, tracer) = setup();
        Ccw::tic(0x40).store(&mut ram, 0);
        let cmd = fetch_first_command_ccw(&mut schib, &ram, &tracer, 0);
        assert_eq!(cmd, 0);
        assert!(schib.scsw.schs.program_check());
    }

    #[test]
    fn chain_follows_one_tic() {
        let (mut schib, mut ram, tracer) = setup();
        Ccw::tic(0x40).store(&mut ram, 0x10);
        Ccw::new(0x02, CcwFlags(0), 8, 0x90).store(&mut ram, 0x40);
        schib.scsw.ccw_addr = 0x10;

        let cmd = fetch_chain_ccw(&mut schib, &ram, &tracer, 0);
        assert_eq!(cmd, 0x02);
        assert_eq!(schib.scsw.ccw_addr, 0x48);
    }

    #[test]
    fn tic_to_tic_is_program_check() {
        let (mut schib, mut ram, tracer) = setup();
        Ccw::tic(0x40).store(&mut ram, 0x10);
        Ccw::tic(0x10).store(&mut ram, 0x40);
        schib.scsw.ccw_addr = 0x10;

        assert_eq!(fetch_chain_ccw(&mut schib, &ram, &tracer, 0), 0);
        assert!(schib.scsw.schs.program_check());
    }

    #[test]
    fn chain_data_suspend_is_program_check() {
        let (mut schib, mut ram, tracer) = setup();
        Ccw::new(0x03, CcwFlags(0).with_suspend(true), 4, 0).store(&mut ram, 0x18);
        schib.scsw.ccw_addr = 0x18;
        schib.mda.ccw_flags = CcwFlags(0).with_cd(true);

        fetch_chain_data_ccw(&mut schib, &ram, &tracer, 0);
        assert!(schib.scsw.schs.program_check());
        assert_eq!(schib.scsw.count, 0);
    }

    #[test]
    fn chain_data_without_cd_is_noop() {
        let (mut schib, ram, tracer) = setup();
        schib.scsw.count = 10;
        fetch_chain_data_ccw(&mut schib, &ram, &tracer, 0);
        assert_eq!(schib.scsw.count, 0);
        assert_eq!(schib.scsw.schs.0, 0);
    }
}
