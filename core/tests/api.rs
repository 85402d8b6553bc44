//! Condition-code contracts, ISC priority and list discipline.

mod common;

use std::sync::Arc;

use common::{pump, rig, Link};
use picochan_core::ccw::{Ccw, CcwFlags};
use picochan_core::css::PmcwFlags;
use picochan_core::cu::CALLBACK_NOOP;
use picochan_core::proto::ChopCmd;
use picochan_core::types::CondCode;

/// `sch_start` condition codes: 3 disabled, 2 function in progress,
/// 1 status pending, 0 otherwise.
#[test]
fn start_condition_codes() {
    let mut r = rig(Link::Mem, 2);
    let sid = r.first_sid;

    // invalid sid
    assert_eq!(r.css.sch_start(999, 0), CondCode::NotOperational);

    // disabled subchannel
    assert_eq!(r.css.sch_modify_enabled(sid, false), CondCode::Ok);
    assert_eq!(r.css.sch_start(sid, 0), CondCode::NotOperational);
    assert_eq!(r.css.sch_modify_enabled(sid, true), CondCode::Ok);

    // a device that never answers keeps the function in progress
    r.cu.devib_mut(0).cbindex = CALLBACK_NOOP;
    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };
    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    assert_eq!(r.css.sch_start(sid, prog), CondCode::Busy);
    assert_eq!(r.css.sch_modify_intparm(sid, 1), CondCode::Busy);

    // the second device has no callback: its default reject ends the
    // program with unit check, leaving the subchannel status-pending
    let sid2 = r.first_sid + 1;
    assert_eq!(r.css.sch_start(sid2, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    assert!(r.css.sch_store_scsw(sid2).unwrap().devs.unit_check());
    assert_eq!(r.css.sch_start(sid2, prog), CondCode::StatusPending);
    assert_eq!(r.css.sch_modify_intparm(sid2, 1), CondCode::StatusPending);

    r.css.check_invariants();
}

/// Cancelling a start that has not been transmitted unlinks it from the
/// function list and idles the subchannel.
#[test]
fn cancel_before_transmission() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };

    // cancel between the API call and the reactor running it
    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    assert_eq!(r.css.sch_cancel(sid), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::StatusPending); // nothing ever completed
    assert!(!scsw.function_in_progress());
    r.css.check_invariants();

    // cancel on an idle subchannel is rejected
    assert_eq!(r.css.sch_cancel(sid), CondCode::Busy);
}

/// ISC 0 outranks ISC 3 when both have pending interruptions.
#[test]
fn isc_priority_order() {
    let mut r = rig(Link::Mem, 2);
    let (lo, hi) = (r.first_sid, r.first_sid + 1);

    // complete programs on both; deliveries queue because no callback
    // is installed
    r.callbacks
        .register(
            1,
            Arc::new(|cu, ua| {
                if cu.devib(ua).op().command() == Some(ChopCmd::Start) {
                    cu.dev_update_status_ok(ua).unwrap();
                }
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;
    r.cu.devib_mut(1).cbindex = 1;

    // put the first device's subchannel on ISC 3, the second on ISC 0
    assert_eq!(
        r.css
            .sch_modify_flags(lo, PmcwFlags(0).with_enabled(true).with_isc(3).0),
        CondCode::Ok
    );
    assert_eq!(
        r.css
            .sch_modify_flags(hi, PmcwFlags(0).with_enabled(true).with_isc(0).0),
        CondCode::Ok
    );

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };

    assert_eq!(r.css.sch_start(lo, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    assert_eq!(r.css.sch_start(hi, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    assert!(r.css.is_isc_pending(0));
    assert!(r.css.is_isc_pending(3));

    // ISC 0 comes out first despite completing second
    let first = r.css.test_pending_interruption();
    assert!(first.stored());
    assert_eq!(first.sid, hi);
    assert_eq!(first.isc, 0);
    let (cc, _) = r.css.sch_test(hi);
    assert_eq!(cc, CondCode::Ok);

    let second = r.css.test_pending_interruption();
    assert!(second.stored());
    assert_eq!(second.sid, lo);
    assert_eq!(second.isc, 3);
    let (cc, _) = r.css.sch_test(lo);
    assert_eq!(cc, CondCode::Ok);

    assert!(!r.css.test_pending_interruption().stored());
    r.css.check_invariants();
}

/// A disabled ISC holds its interruptions back until re-enabled.
#[test]
fn disabled_isc_defers_delivery() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    r.callbacks
        .register(
            1,
            Arc::new(|cu, ua| {
                if cu.devib(ua).op().command() == Some(ChopCmd::Start) {
                    cu.dev_update_status_ok(ua).unwrap();
                }
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    r.css.set_isc_enabled(0, false);

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };
    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    assert!(r.css.is_isc_pending(0));
    assert!(!r.css.test_pending_interruption().stored());

    r.css.set_isc_enabled(0, true);
    let ic = r.css.test_pending_interruption();
    assert!(ic.stored());
    assert_eq!(ic.sid, sid);
}

/// `sch_modify` updates intparm and only the modifiable flag bits.
#[test]
fn modify_masks_flags() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    assert_eq!(r.css.sch_modify_intparm(sid, 0x1234_5678), CondCode::Ok);
    assert_eq!(r.css.sch_modify_flags(sid, 0xffff), CondCode::Ok);

    let pmcw = r.css.sch_store_pmcw(sid).unwrap();
    assert_eq!(pmcw.intparm, 0x1234_5678);
    assert_eq!(pmcw.flags.0, 0x001f);
    // path binding survives a modify
    assert_eq!(pmcw.chpid, 0);
    assert_eq!(pmcw.unit_addr, 0);

    assert!(r.css.sch_store(999).is_none());
}

/// `sch_run_wait_timeout` reports cc 2 when the device stays silent.
#[test]
fn run_wait_timeout_expires() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;
    r.cu.devib_mut(0).cbindex = CALLBACK_NOOP;

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };

    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(50);
    let (cc, _) = r.css.sch_run_wait_timeout(sid, prog, deadline);
    assert_eq!(cc, CondCode::Busy);
}
