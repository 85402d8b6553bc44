//! Clocked pin-bank device.
//!
//! An 8-bit pin image with a strobe line: Write-type programs drive the
//! pins (one strobe per byte applied), Read-type programs sample them.
//! The device advertises its drive buffer at end of program so a
//! following Write-type Start can carry its byte as immediate data, and
//! the blank command exercises the Skip path where the CSS materialises
//! zeroes without link traffic.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::*;
use picochan_core::cu::Cu;
use picochan_core::hldev::{self, HldevHandle};
use picochan_core::mem::Address;
use picochan_core::proto::CHOP_FLAG_FINAL;
use picochan_core::status::sense_code;
use picochan_core::types::UnitAddr;

/// Drive the pins from program data (Write-type)
pub const CMD_DRIVE: u8 = 0x01;

/// Sample the pins into program storage (Read-type)
pub const CMD_SENSE: u8 = 0x02;

/// Fill the program's buffer with zeroes without sending any (Read-type)
pub const CMD_BLANK: u8 = 0x04;

/// Shared pin image observable by the testbench or real pin driver
#[derive(Debug, Default)]
pub struct PinState {
    pub levels: u8,
    pub strobes: u64,
}

pub type Pins = Arc<Mutex<PinState>>;

struct Inner {
    pins: Pins,
    /// Drive buffer in CU storage, advertised for immediate-write data
    drive_buf: Address,
    drive_len: u16,
    hldev: Option<HldevHandle>,
}

pub struct PinBank {
    inner: Arc<Mutex<Inner>>,
    pins: Pins,
}

impl PinBank {
    pub fn install(cu: &mut Cu, ua: UnitAddr, drive_len: u16) -> Result<Self> {
        let pins = Pins::default();
        let drive_buf = cu.mem().write().unwrap().alloc(usize::from(drive_len), 4);

        let inner = Arc::new(Mutex::new(Inner {
            pins: Arc::clone(&pins),
            drive_buf,
            drive_len,
            hldev: None,
        }));

        // unregistered commands fall through to the start callback
        let reject_inner = Arc::clone(&inner);
        let h = hldev::config_init(
            cu,
            ua,
            1,
            Arc::new(move |cu, ua| {
                let h = reject_inner.lock().unwrap().hldev.clone().unwrap();
                hldev::end_reject(cu, &h, ua, sense_code::INVALID_CMD);
            }),
            None,
        )?;
        inner.lock().unwrap().hldev = Some(Arc::clone(&h));

        let drive_inner = Arc::clone(&inner);
        hldev::register_command(
            &h,
            CMD_DRIVE,
            Arc::new(move |cu, ua| drive(cu, &drive_inner, ua)),
        );
        let sense_inner = Arc::clone(&inner);
        hldev::register_command(
            &h,
            CMD_SENSE,
            Arc::new(move |cu, ua| sense(cu, &sense_inner, ua)),
        );
        let blank_inner = Arc::clone(&inner);
        hldev::register_command(
            &h,
            CMD_BLANK,
            Arc::new(move |cu, ua| blank(cu, &blank_inner, ua)),
        );

        Ok(Self { inner, pins })
    }

    pub fn pins(&self) -> Pins {
        Arc::clone(&self.pins)
    }

    /// Announces the drive buffer as an unsolicited status so the next
    /// Write-type Start can carry its data immediately. Call once after
    /// the CU starts (and before any program runs).
    pub fn advertise(&self, cu: &mut Cu, ua: UnitAddr) {
        let inner = self.inner.lock().unwrap();
        if let Err(e) = cu.dev_update_status_advert(
            ua,
            picochan_core::status::DevStatus(0).with_attention(true),
            inner.drive_buf,
            inner.drive_len,
        ) {
            error!("pinbank advertise failed: {e}");
        }
    }
}

fn apply_levels(cu: &Cu, inner: &Mutex<Inner>, n: u16) {
    let guard = inner.lock().unwrap();
    let ram = cu.mem().read().unwrap();
    let mut pins = guard.pins.lock().unwrap();
    for i in 0..n {
        pins.levels = ram.read(guard.drive_buf + u32::from(i));
        pins.strobes += 1;
    }
}

/// Write-type: pull the program's data into the drive buffer, then
/// apply one byte per strobe. Data the Start already delivered into the
/// advertised buffer is applied directly.
fn drive(cu: &mut Cu, inner: &Arc<Mutex<Inner>>, ua: UnitAddr) {
    let guard = inner.lock().unwrap();
    let h = guard.hldev.clone().unwrap();
    let (buf, len) = (guard.drive_buf, guard.drive_len);
    drop(guard);

    let immediate = picochan_core::bsize::Bsize::from_raw(cu.devib(ua).payload().1).decode();
    if immediate > 0 {
        apply_levels(cu, inner, immediate);
        hldev::end_ok(cu, &h, ua);
        return;
    }

    let inner2 = Arc::clone(inner);
    let apply = Arc::new(move |cu: &mut Cu, ua: UnitAddr| {
        let h = inner2.lock().unwrap().hldev.clone().unwrap();
        let n = hldev::count(&h, ua);
        apply_levels(cu, &inner2, n);
        hldev::end_ok(cu, &h, ua);
    });

    if let Err(e) = hldev::receive_then(cu, &h, ua, buf, len, Some(apply)) {
        error!("pinbank drive receive failed: {e}");
    }
}

/// Read-type: sample the pin image into the program's buffer.
fn sense(cu: &mut Cu, inner: &Arc<Mutex<Inner>>, ua: UnitAddr) {
    let guard = inner.lock().unwrap();
    let h = guard.hldev.clone().unwrap();
    let levels = guard.pins.lock().unwrap().levels;
    let staging = guard.drive_buf;
    drop(guard);

    cu.mem().write().unwrap().write(staging, levels);
    if let Err(e) = hldev::send_final(cu, &h, ua, staging, 1) {
        error!("pinbank sense failed: {e}");
    }
}

/// Read-type: the CSS fills its buffer with zeroes locally; nothing
/// crosses the link.
fn blank(cu: &mut Cu, inner: &Arc<Mutex<Inner>>, ua: UnitAddr) {
    let guard = inner.lock().unwrap();
    let h = guard.hldev.clone().unwrap();
    drop(guard);

    let window = cu.devib(ua).size;
    match cu.dev_send_zeroes(ua, window, CHOP_FLAG_FINAL) {
        Ok(_) => hldev::mark_ended(&h, ua),
        Err(e) => {
            error!("pinbank blank failed: {e}");
            hldev::end_reject(cu, &h, ua, sense_code::INVALID_CMD);
        }
    }
}
