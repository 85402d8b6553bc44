//! End-to-end channel-program scenarios over a full CSS/CU loopback.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::{pump, pump_rounds, rig, Link};
use picochan_core::bsize::Bsize;
use picochan_core::ccw::{Ccw, CcwFlags};
use picochan_core::proto::ChopCmd;
use picochan_core::status::DevStatus;
use picochan_core::types::CondCode;

const CMD_WRITE: u8 = 0x03;
const CMD_READ: u8 = 0x02;

/// S1: a zero-length write chained to a TIC loops forever without ever
/// turning status-pending.
#[test]
fn blink_echo_loop() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let starts = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&starts);
    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                let devib = cu.devib(ua);
                assert_eq!(devib.op().command(), Some(ChopCmd::Start));
                assert_eq!(devib.ccw_cmd(), 0x01);
                counted.fetch_add(1, Ordering::Relaxed);
                cu.dev_update_status_ok(ua).unwrap();
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(16, 4);
        Ccw::new(0x01, CcwFlags(0).with_cc(true), 0, 0).store(&mut ram, prog);
        Ccw::tic(prog).store(&mut ram, prog + Ccw::SIZE);
        prog
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump_rounds(&mut r.css, &mut r.cu, 40);

    assert!(starts.load(Ordering::Relaxed) >= 5);
    assert!(!r.css.test_pending_interruption().stored());
    assert!(!r.css.sch_store_scsw(sid).unwrap().status_pending());
    r.css.check_invariants();
}

/// S2: two chained writes, both carried as immediate data within the
/// device's advertised window.
#[test]
fn chained_write_with_immediate_data() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let dev_buf = r.cu_mem.write().unwrap().alloc(64, 4);
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();

    let record = Arc::clone(&seen);
    let record_mem = r.cu_mem.clone();
    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                let devib = cu.devib(ua);
                assert_eq!(devib.op().command(), Some(ChopCmd::Start));
                assert_eq!(devib.ccw_cmd(), CMD_WRITE);
                let n = Bsize::from_raw(devib.payload().1).decode() as usize;
                let data = record_mem.read().unwrap().read_slice(dev_buf, n).to_vec();
                record.lock().unwrap().push(data);
                cu.dev_update_status_ok_advert(ua, dev_buf, 64).unwrap();
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    // device announces its window before any program runs
    r.cu.dev_update_status_advert(0, DevStatus(0).with_attention(true), dev_buf, 64)
        .unwrap();
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok); // consume the attention
    assert!(scsw.ctrl.sc_alert());

    let (prog, buf_a, buf_b) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf_a = ram.alloc(8, 4);
        let buf_b = ram.alloc(8, 4);
        ram.write_slice(buf_a, b"hello");
        ram.write_slice(buf_b, b"end");
        let prog = ram.alloc(16, 4);
        Ccw::new(
            CMD_WRITE,
            CcwFlags(0).with_cc(true).with_sli(true),
            5,
            buf_a,
        )
        .store(&mut ram, prog);
        Ccw::new(CMD_WRITE, CcwFlags(0), 3, buf_b).store(&mut ram, prog + Ccw::SIZE);
        (prog, buf_a, buf_b)
    };
    let _ = (buf_a, buf_b);

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], b"hello");
    assert_eq!(seen[1], b"end");
    drop(seen);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.count, 0);
    assert_eq!(scsw.devs.0, 0x0c);
    assert_eq!(scsw.schs.0, 0);
    r.css.check_invariants();
}

/// S3: a read with a 64-byte announced window, partially filled by the
/// device in two bursts; SLI suppresses the incorrect-length check.
#[test]
fn read_with_announced_window() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let dev_buf = r.cu_mem.write().unwrap().alloc(64, 4);
    r.cu_mem
        .write()
        .unwrap()
        .write_slice(dev_buf, b"0123456789abcdefghij0123456789abcdefghij");

    let stage = Arc::new(AtomicU32::new(0));
    let st = Arc::clone(&stage);
    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                match st.fetch_add(1, Ordering::Relaxed) {
                    0 => {
                        // Start of the read: the window is the segment
                        assert_eq!(cu.devib(ua).ccw_cmd(), CMD_READ);
                        assert_eq!(cu.devib(ua).size, 64);
                        assert_eq!(cu.dev_send(ua, dev_buf, 20, 0).unwrap(), 20);
                    }
                    1 => {
                        // first burst sent: finish with the second
                        assert_eq!(cu.dev_send_final(ua, dev_buf + 20, 20).unwrap(), 20);
                    }
                    _ => (),
                }
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    let (prog, buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(64, 4);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_READ, CcwFlags(0).with_sli(true), 64, buf).store(&mut ram, prog);
        (prog, buf)
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.count, 24); // residual
    assert_eq!(scsw.devs.0, 0x0c);
    assert_eq!(scsw.schs.0, 0); // SLI suppressed the short-read check
    assert_eq!(
        r.css_mem.read().unwrap().read_slice(buf, 40),
        b"0123456789abcdefghij0123456789abcdefghij"
    );
}

/// Without SLI, the same short read ends with incorrect length.
#[test]
fn short_read_without_sli_flags_incorrect_length() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let dev_buf = r.cu_mem.write().unwrap().alloc(16, 4);
    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                if cu.devib(ua).op().command() == Some(ChopCmd::Start) {
                    let _ = cu.dev_send_final(ua, dev_buf, 8).unwrap();
                }
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    let (prog, _buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(32, 4);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_READ, CcwFlags(0), 32, buf).store(&mut ram, prog);
        (prog, buf)
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.count, 24);
    assert!(scsw.schs.incorrect_length());
}

/// S4: suspension delivers an intermediate interruption through the I/O
/// callback; cancel then quietly idles the subchannel.
#[test]
fn cancel_mid_suspend() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let delivered: Arc<Mutex<Vec<(u32, picochan_core::scsw::Scsw)>>> = Arc::default();
    let sink = Arc::clone(&delivered);
    r.css.set_io_callback(Some(Box::new(move |_css, ic, scsw| {
        sink.lock().unwrap().push((ic.intparm, scsw));
    })));
    assert_eq!(r.css.sch_modify_intparm(sid, 0xcafe), CondCode::Ok);

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_WRITE, CcwFlags(0).with_suspend(true), 0, 0).store(&mut ram, prog);
        prog
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    {
        let d = delivered.lock().unwrap();
        assert_eq!(d.len(), 1);
        let (intparm, scsw) = d[0];
        assert_eq!(intparm, 0xcafe);
        assert!(scsw.ctrl.sc_intermediate());
        assert!(scsw.ctrl.sc_pending());
        assert!(scsw.ctrl.ac_suspended());
        assert!(scsw.user_flags.u());
    }

    // the callback consumed the status; the suspended function remains
    assert_eq!(r.css.sch_cancel(sid), CondCode::Ok);
    let (cc, _) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::StatusPending); // nothing pending any more
    r.css.check_invariants();

    // the subchannel is reusable
    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    assert_eq!(delivered.lock().unwrap().len(), 2);
}

/// Resume after suspension re-runs the suspended CCW.
#[test]
fn suspend_resume_runs_device() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let starts = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&starts);
    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                counted.fetch_add(1, Ordering::Relaxed);
                cu.dev_update_status_ok(ua).unwrap();
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0).with_suspend(true), 0, 0).store(&mut ram, prog);
        prog
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert!(scsw.ctrl.ac_suspended());
    assert_eq!(starts.load(Ordering::Relaxed), 0); // nothing reached the device

    assert_eq!(r.css.sch_resume(sid), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    assert!(!scsw.user_flags.u());
    assert_eq!(starts.load(Ordering::Relaxed), 1);
}

/// S6: an hldev send of 600 bytes spans three chained 256/256/88 read
/// segments, with Room exchanges in between.
#[test]
fn hldev_send_spans_segments() {
    use picochan_core::hldev;

    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let src = r.cu_mem.write().unwrap().alloc(600, 4);
    {
        let mut ram = r.cu_mem.write().unwrap();
        for i in 0..600u32 {
            ram.write(src + i, (i % 251) as u8);
        }
    }

    let slot: Arc<Mutex<Option<hldev::HldevHandle>>> = Arc::default();
    let slot2 = Arc::clone(&slot);
    let h = hldev::config_init(
        &mut r.cu,
        0,
        1,
        Arc::new(move |cu, ua| {
            assert_eq!(cu.devib(ua).ccw_cmd(), CMD_READ);
            let h = slot2.lock().unwrap().clone().unwrap();
            hldev::send_final(cu, &h, ua, src, 600).unwrap();
        }),
        None,
    )
    .unwrap();
    *slot.lock().unwrap() = Some(Arc::clone(&h));

    let (prog, buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(600, 4);
        let prog = ram.alloc(24, 4);
        Ccw::new(CMD_READ, CcwFlags(0).with_cd(true), 256, buf).store(&mut ram, prog);
        Ccw::new(CMD_READ, CcwFlags(0).with_cd(true), 256, buf + 256)
            .store(&mut ram, prog + Ccw::SIZE);
        Ccw::new(CMD_READ, CcwFlags(0), 88, buf + 512).store(&mut ram, prog + 2 * Ccw::SIZE);
        (prog, buf)
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    assert_eq!(scsw.schs.0, 0);
    assert_eq!(scsw.count, 0);

    let ram = r.css_mem.read().unwrap();
    for i in 0..600u32 {
        assert_eq!(ram.read(buf + i), (i % 251) as u8, "byte {i}");
    }
}

/// A devib Skip send materialises zeroes at the CSS with no data on the
/// link.
#[test]
fn send_zeroes_fills_buffer_locally() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                if cu.devib(ua).op().command() == Some(ChopCmd::Start) {
                    let window = cu.devib(ua).size;
                    cu.dev_send_zeroes(ua, window, picochan_core::proto::CHOP_FLAG_FINAL)
                        .unwrap();
                }
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    let (prog, buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(32, 4);
        ram.fill(buf, 32, 0xee);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_READ, CcwFlags(0), 32, buf).store(&mut ram, prog);
        (prog, buf)
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    assert_eq!(r.css_mem.read().unwrap().read_slice(buf, 32), &[0u8; 32]);
}

/// An unregistered device rejects its Start with command-reject sense
/// and unit check.
#[test]
fn default_callback_rejects_start() {
    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x0b, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert!(scsw.devs.unit_check());
    assert!(r.cu.devib(0).sense.flags.command_reject());
}

/// S5: CSS and CU on separate threads over a memory channel; the trace
/// streams from both sides show each command transaction completed by
/// exactly one peer.
#[test]
fn memchan_cross_thread_loopback() {
    use picochan_core::trc::{RecordType, CSS_BUFFERSET_MAGIC, CUS_BUFFERSET_MAGIC};

    let mut r = rig(Link::Mem, 1);
    let sid = r.first_sid;

    r.callbacks
        .register(
            1,
            Arc::new(move |cu, ua| {
                if cu.devib(ua).op().command() == Some(ChopCmd::Start) {
                    cu.dev_update_status_ok(ua).unwrap();
                }
            }),
        )
        .unwrap();
    r.cu.devib_mut(0).cbindex = 1;

    r.css.set_trace(true);
    r.css.chp_set_trace(0, true).unwrap();
    let mut cu = r.cu;
    cu.set_trace(true);
    cu.trace_cu(true);
    assert_eq!(r.css.tracer().magic(), CSS_BUFFERSET_MAGIC);
    assert_eq!(cu.tracer().magic(), CUS_BUFFERSET_MAGIC);

    let stop = Arc::new(AtomicU32::new(0));
    let stop_flag = Arc::clone(&stop);
    let worker = std::thread::spawn(move || {
        while stop_flag.load(Ordering::Relaxed) == 0 {
            cu.wait();
        }
        cu
    });

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let prog = ram.alloc(8, 4);
        Ccw::new(0x01, CcwFlags(0), 0, 0).store(&mut ram, prog);
        prog
    };

    const PROGRAMS: usize = 3;
    for _ in 0..PROGRAMS {
        let (cc, scsw) = r.css.sch_run_wait(sid, prog);
        assert_eq!(cc, CondCode::Ok);
        assert_eq!(scsw.devs.0, 0x0c);
    }

    stop.store(1, Ordering::Relaxed);
    let cu = worker.join().unwrap();

    // Each command transfer leaves one record on the side that advanced
    // its state (peer seen idle, byte 0) and one on the side that
    // performed the transfer (peer seen staged, byte 1).
    let css_records = r.css.tracer().records();
    let cu_records = cu.tracer().records();
    let mut sent = 0usize;
    let mut completed_by_sender = 0usize;
    let mut completed_by_receiver = 0usize;
    for rec in css_records.iter().chain(cu_records.iter()) {
        match rec.rec_type {
            RecordType::DmachanSrcCmdbufMem => {
                sent += 1;
                if rec.data[1] != 0 {
                    completed_by_sender += 1;
                }
            }
            RecordType::DmachanDstCmdbufMem => {
                if rec.data[1] != 0 {
                    completed_by_receiver += 1;
                }
            }
            _ => (),
        }
    }

    // one Start and one UpdateStatus per program, in each direction
    assert_eq!(sent, PROGRAMS * 2);
    assert_eq!(completed_by_sender + completed_by_receiver, sent);
}

/// Exercises a program over every backend, including the reset drain on
/// the byte and bit lanes.
#[test]
fn loopback_over_every_backend() {
    for link in [Link::Mem, Link::Uart, Link::Pio] {
        let mut r = rig(link, 1);
        let sid = r.first_sid;

        let dev_buf = r.cu_mem.write().unwrap().alloc(16, 4);
        r.cu_mem.write().unwrap().write_slice(dev_buf, b"0123456789abcdef");
        r.callbacks
            .register(
                1,
                Arc::new(move |cu, ua| {
                    if cu.devib(ua).op().command() == Some(ChopCmd::Start) {
                        let _ = cu.dev_send_final(ua, dev_buf, 16).unwrap();
                    }
                }),
            )
            .unwrap();
        r.cu.devib_mut(0).cbindex = 1;

        let (prog, buf) = {
            let mut ram = r.css_mem.write().unwrap();
            let buf = ram.alloc(16, 4);
            let prog = ram.alloc(8, 4);
            Ccw::new(CMD_READ, CcwFlags(0), 16, buf).store(&mut ram, prog);
            (prog, buf)
        };

        assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
        pump(&mut r.css, &mut r.cu);

        let (cc, scsw) = r.css.sch_test(sid);
        assert_eq!(cc, CondCode::Ok);
        assert_eq!(scsw.devs.0, 0x0c);
        assert_eq!(scsw.count, 0);
        assert_eq!(
            r.css_mem.read().unwrap().read_slice(buf, 16),
            b"0123456789abcdef"
        );
    }
}
