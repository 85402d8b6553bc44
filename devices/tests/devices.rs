//! The device templates driven over a full CSS/CU loopback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use picochan_core::ccw::{Ccw, CcwFlags};
use picochan_core::css::{Css, PmcwFlags};
use picochan_core::cu::{CallbackTable, Cu, CuConfig};
use picochan_core::dmachan;
use picochan_core::mem::{self, MemHandle};
use picochan_core::types::{CondCode, Sid};

use picochan_devices::bridge::{Bridge, BridgeConfig, CMD_FETCH, CMD_PUBLISH};
use picochan_devices::linereader::{LineReader, LineReaderConfig, CMD_READ_LINE};
use picochan_devices::pinbank::{PinBank, CMD_BLANK, CMD_DRIVE, CMD_SENSE};

struct Rig {
    css: Css,
    cu: Cu,
    css_mem: MemHandle,
    first_sid: Sid,
}

fn rig(num_devices: u16) -> Rig {
    let css_mem = mem::new_handle(65536);
    let cu_mem = mem::new_handle(65536);

    let mut css = Css::new(&css_mem);
    css.start(None, 0xff);
    css.chp_claim(0).unwrap();
    let first_sid = css.chp_alloc(0, num_devices).unwrap();

    let (a, b) = dmachan::memchan_pair(&css_mem, &cu_mem);
    css.chp_configure_memchan(0, a).unwrap();

    let callbacks = CallbackTable::new();
    let mut cu = Cu::new(
        &cu_mem,
        &callbacks,
        &CuConfig {
            cuaddr: 0,
            num_devibs: usize::from(num_devices),
        },
    );
    cu.configure_memcu(b).unwrap();
    cu.start().unwrap();
    css.chp_start(0).unwrap();

    for i in 0..num_devices {
        let cc = css.sch_modify_flags(first_sid + i, PmcwFlags(0).with_enabled(true).0);
        assert_eq!(cc, CondCode::Ok);
    }

    Rig {
        css,
        cu,
        css_mem,
        first_sid,
    }
}

fn pump(css: &mut Css, cu: &mut Cu) {
    for _ in 0..10_000 {
        let a = css.poll();
        let b = cu.poll();
        if !a && !b {
            return;
        }
    }
    panic!("link did not quiesce");
}

#[test]
fn linereader_delivers_a_line() {
    let mut r = rig(1);
    let sid = r.first_sid;

    let script: Arc<Mutex<VecDeque<u8>>> = Arc::default();
    script.lock().unwrap().extend(b"hi there\nleftover");
    let feed = Arc::clone(&script);
    let lr = LineReader::install(
        &mut r.cu,
        0,
        Box::new(move || feed.lock().unwrap().pop_front()),
        LineReaderConfig::default(),
    )
    .unwrap();

    let (prog, buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(128, 4);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_READ_LINE, CcwFlags(0).with_sli(true), 128, buf).store(&mut ram, prog);
        (prog, buf)
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    lr.tick(&mut r.cu);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    let got = 128 - scsw.count;
    assert_eq!(got, 9);
    assert_eq!(
        r.css_mem.read().unwrap().read_slice(buf, 9),
        b"hi there\n"
    );
}

#[test]
fn linereader_times_out_empty() {
    let mut r = rig(1);
    let sid = r.first_sid;

    let lr = LineReader::install(
        &mut r.cu,
        0,
        Box::new(|| None),
        LineReaderConfig {
            timeout: Duration::from_millis(5),
            ..LineReaderConfig::default()
        },
    )
    .unwrap();

    let prog = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(128, 4);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_READ_LINE, CcwFlags(0).with_sli(true), 128, buf).store(&mut ram, prog);
        prog
    };

    assert_eq!(r.css.sch_start(sid, prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    std::thread::sleep(Duration::from_millis(10));
    lr.tick(&mut r.cu);
    pump(&mut r.css, &mut r.cu);

    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert!(scsw.devs.unit_exception());
}

#[test]
fn pinbank_drive_sense_blank() {
    let mut r = rig(1);
    let sid = r.first_sid;

    let bank = PinBank::install(&mut r.cu, 0, 8).unwrap();

    // drive three levels, one strobe each
    let (drive_prog, sense_prog, blank_prog, sense_buf, blank_buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let data = ram.alloc(4, 4);
        ram.write_slice(data, &[0xaa, 0x55, 0xf0]);
        let sense_buf = ram.alloc(4, 4);
        let blank_buf = ram.alloc(16, 4);
        ram.fill(blank_buf, 16, 0xee);

        let drive_prog = ram.alloc(8, 4);
        Ccw::new(CMD_DRIVE, CcwFlags(0).with_sli(true), 3, data).store(&mut ram, drive_prog);
        let sense_prog = ram.alloc(8, 4);
        Ccw::new(CMD_SENSE, CcwFlags(0).with_sli(true), 1, sense_buf).store(&mut ram, sense_prog);
        let blank_prog = ram.alloc(8, 4);
        Ccw::new(CMD_BLANK, CcwFlags(0).with_sli(true), 16, blank_buf)
            .store(&mut ram, blank_prog);
        (drive_prog, sense_prog, blank_prog, sense_buf, blank_buf)
    };

    assert_eq!(r.css.sch_start(sid, drive_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    {
        let pins = bank.pins();
        let p = pins.lock().unwrap();
        assert_eq!(p.levels, 0xf0);
        assert_eq!(p.strobes, 3);
    }

    assert_eq!(r.css.sch_start(sid, sense_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, _) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(r.css_mem.read().unwrap().read(sense_buf), 0xf0);

    assert_eq!(r.css.sch_start(sid, blank_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, _) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(r.css_mem.read().unwrap().read_slice(blank_buf, 16), &[0u8; 16]);
}

#[test]
fn pinbank_immediate_drive_after_advertise() {
    let mut r = rig(1);
    let sid = r.first_sid;

    let bank = PinBank::install(&mut r.cu, 0, 8).unwrap();
    bank.advertise(&mut r.cu, 0);
    pump(&mut r.css, &mut r.cu);
    // consume the attention that carried the advertisement
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert!(scsw.devs.attention());

    let drive_prog = {
        let mut ram = r.css_mem.write().unwrap();
        let data = ram.alloc(4, 4);
        ram.write_slice(data, &[0x12, 0x34]);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_DRIVE, CcwFlags(0).with_sli(true), 2, data).store(&mut ram, prog);
        prog
    };

    assert_eq!(r.css.sch_start(sid, drive_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    {
        let pins = bank.pins();
        let p = pins.lock().unwrap();
        assert_eq!(p.levels, 0x34);
        assert_eq!(p.strobes, 2);
    }
}

#[test]
fn bridge_round_trip() {
    let mut r = rig(1);
    let sid = r.first_sid;

    let (in_tx, in_rx) = crossbeam_channel::unbounded();
    let (out_tx, out_rx) = crossbeam_channel::unbounded();
    let bridge = Bridge::install(&mut r.cu, 0, in_rx, out_tx, &BridgeConfig::default()).unwrap();

    // a message arrives from the "network": attention is raised
    in_tx.send(b"sensor/21 temperature=33".to_vec()).unwrap();
    bridge.pump(&mut r.cu);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert!(scsw.devs.attention());

    // fetch it with a read program
    let (fetch_prog, fetch_buf) = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(256, 4);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_FETCH, CcwFlags(0).with_sli(true), 256, buf).store(&mut ram, prog);
        (prog, buf)
    };
    assert_eq!(r.css.sch_start(sid, fetch_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    let n = usize::from(256 - scsw.count);
    assert_eq!(
        r.css_mem.read().unwrap().read_slice(fetch_buf, n),
        b"sensor/21 temperature=33"
    );

    // publish one back out
    let publish_prog = {
        let mut ram = r.css_mem.write().unwrap();
        let msg = ram.alloc(32, 4);
        ram.write_slice(msg, b"actuator/3 open");
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_PUBLISH, CcwFlags(0).with_sli(true), 15, msg).store(&mut ram, prog);
        prog
    };
    assert_eq!(r.css.sch_start(sid, publish_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert_eq!(scsw.devs.0, 0x0c);
    assert_eq!(out_rx.try_recv().unwrap(), b"actuator/3 open".to_vec());
}

#[test]
fn bridge_fetch_empty_is_exception() {
    let mut r = rig(1);
    let sid = r.first_sid;

    let (_in_tx, in_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let (out_tx, _out_rx) = crossbeam_channel::unbounded();
    let _bridge = Bridge::install(&mut r.cu, 0, in_rx, out_tx, &BridgeConfig::default()).unwrap();

    let fetch_prog = {
        let mut ram = r.css_mem.write().unwrap();
        let buf = ram.alloc(64, 4);
        let prog = ram.alloc(8, 4);
        Ccw::new(CMD_FETCH, CcwFlags(0).with_sli(true), 64, buf).store(&mut ram, prog);
        prog
    };
    assert_eq!(r.css.sch_start(sid, fetch_prog), CondCode::Ok);
    pump(&mut r.css, &mut r.cu);
    let (cc, scsw) = r.css.sch_test(sid);
    assert_eq!(cc, CondCode::Ok);
    assert!(scsw.devs.unit_exception());
}
