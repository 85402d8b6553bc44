//! A higher-level helper for implementing devices on a CU.
//!
//! Wraps the raw devib callback protocol in a per-device state machine
//! that hides CCW segment boundaries: a logical receive keeps issuing
//! RequestReads across successive Data bursts until EOF or the buffer
//! fills, and a logical send streams a buffer across as many segments as
//! needed, asking for Room mid-stream and flagging End on the last
//! chunk. A per-set `ccwcmd -> callback` table lets device
//! implementations be table-driven.
//!
//! The Stopping flag is observed at every callback re-entry and
//! short-circuits to the set's `signal` hook (or a cancel status).

use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use log::*;

use crate::cu::{Cu, DevError};
use crate::mem::Address;
use crate::proto::{ChopCmd, CHOP_FLAG_FINAL, CHOP_FLAG_RESPONSE_REQUIRED};
use crate::status::{DevStatus, Sense, SenseFlags, SENSE_NONE};
use crate::trc::{records, RecordType};
use crate::types::UnitAddr;

/// Protocol-error sense codes raised by the helper itself
pub mod err {
    pub const NO_START_CALLBACK: u8 = 1;
    pub const RECEIVE_FROM_READ_CCW: u8 = 2;
    pub const SEND_TO_WRITE_CCW: u8 = 3;
    pub const IDLE_OP_NOT_START: u8 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::IntoStaticStr)]
pub enum HldevState {
    #[default]
    Idle,
    Started,
    Receiving,
    Sending,
    SendingFinal,
    Ending,
}

/// An hldev callback: like a devib callback, but dispatched through the
/// helper's state machine.
pub type HlCallback = Arc<dyn Fn(&mut Cu, UnitAddr) + Send + Sync>;

pub struct Hldev {
    callback: HlCallback,
    /// Destination/source cursor of the logical receive/send
    addr: Address,
    /// Total bytes of the logical transfer
    size: u16,
    /// Bytes moved so far
    count: u16,
    state: HldevState,
    /// No more data is available from the Write-type CCW
    eof: bool,
    ccwcmd: u8,
}

impl Hldev {
    fn reset(&mut self, start: &HlCallback) {
        self.callback = Arc::clone(start);
        self.addr = 0;
        self.size = 0;
        self.count = 0;
        self.state = HldevState::Idle;
        self.eof = false;
        self.ccwcmd = 0;
    }
}

pub struct HldevSet {
    first_ua: UnitAddr,
    hldevs: Vec<Hldev>,
    start: HlCallback,
    signal: Option<HlCallback>,
    commands: Vec<(u8, HlCallback)>,
}

impl HldevSet {
    fn index_of(&self, ua: UnitAddr) -> Option<usize> {
        let i = usize::from(ua).checked_sub(usize::from(self.first_ua))?;
        (i < self.hldevs.len()).then_some(i)
    }

    fn command_for(&self, ccwcmd: u8) -> Option<HlCallback> {
        self.commands
            .iter()
            .find(|(c, _)| *c == ccwcmd)
            .map(|(_, cb)| Arc::clone(cb))
    }
}

pub type HldevHandle = Arc<Mutex<HldevSet>>;

/// Builds an hldev set covering `num_devices` unit addresses from
/// `first_ua`, registers its devib callback at an unused table index and
/// points the covered devibs at it. `start` handles new channel
/// programs; `signal`, when present, handles Stopping instead of the
/// default cancel status.
pub fn config_init(
    cu: &mut Cu,
    first_ua: UnitAddr,
    num_devices: u16,
    start: HlCallback,
    signal: Option<HlCallback>,
) -> Result<HldevHandle> {
    ensure!(num_devices > 0, "hldev set needs at least one device");
    ensure!(
        usize::from(first_ua) + usize::from(num_devices) <= cu.num_devibs(),
        "hldev range exceeds the CU's devibs"
    );

    let set = Arc::new(Mutex::new(HldevSet {
        first_ua,
        hldevs: (0..num_devices)
            .map(|_| {
                let mut hd = Hldev {
                    callback: Arc::clone(&start),
                    addr: 0,
                    size: 0,
                    count: 0,
                    state: HldevState::Idle,
                    eof: false,
                    ccwcmd: 0,
                };
                hd.reset(&start);
                hd
            })
            .collect(),
        start,
        signal,
        commands: Vec::new(),
    }));

    let handle = Arc::clone(&set);
    let cbindex = cu
        .callbacks()
        .register_unused(Arc::new(move |cu, ua| devib_callback(cu, &handle, ua)))?;
    for i in 0..num_devices {
        cu.devib_mut(first_ua + i as UnitAddr).cbindex = cbindex;
    }
    Ok(set)
}

/// Routes Starts whose CCW command equals `ccwcmd` to `cb` instead of
/// the set's start callback.
pub fn register_command(h: &HldevHandle, ccwcmd: u8, cb: HlCallback) {
    h.lock().unwrap().commands.push((ccwcmd, cb));
}

/// The CCW command that started the current program.
pub fn ccw_cmd(h: &HldevHandle, ua: UnitAddr) -> u8 {
    let set = h.lock().unwrap();
    let i = set.index_of(ua).unwrap();
    set.hldevs[i].ccwcmd
}

/// Whether the peer has signalled end-of-data for the current receive.
pub fn is_eof(h: &HldevHandle, ua: UnitAddr) -> bool {
    let set = h.lock().unwrap();
    let i = set.index_of(ua).unwrap();
    set.hldevs[i].eof
}

/// Bytes moved so far by the current logical receive/send.
pub fn count(h: &HldevHandle, ua: UnitAddr) -> u16 {
    let set = h.lock().unwrap();
    let i = set.index_of(ua).unwrap();
    set.hldevs[i].count
}

//
// Logical receive
//

/// Receives up to `size` bytes from a Write-type CCW into `dstaddr`,
/// spanning as many segments as needed; `callback`, if given, becomes
/// the callback invoked when the receive completes (buffer full or EOF).
pub fn receive_then(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    dstaddr: Address,
    size: u16,
    callback: Option<HlCallback>,
) -> Result<(), DevError> {
    {
        let mut set = h.lock().unwrap();
        let i = set.index_of(ua).unwrap();
        let hd = &mut set.hldevs[i];
        debug_assert_eq!(hd.state, HldevState::Started);

        if let Some(cb) = callback {
            hd.callback = cb;
        }
        hd.addr = dstaddr;
        hd.size = size;
        hd.count = 0;
        hd.state = HldevState::Receiving;
    }
    cu.tracer().write_cond(
        cu.is_traced() || cu.devib(ua).is_traced(),
        RecordType::HldevReceive,
        &records::link_segment(ua, dstaddr, u32::from(size)),
    );

    cu.dev_receive(ua, dstaddr, size)
}

pub fn receive(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    dstaddr: Address,
    size: u16,
) -> Result<(), DevError> {
    receive_then(cu, h, ua, dstaddr, size, None)
}

/// Receives a buffer then ends the program normally.
pub fn receive_buffer_final(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    dstaddr: Address,
    size: u16,
) -> Result<(), DevError> {
    let h2 = Arc::clone(h);
    receive_then(
        cu,
        h,
        ua,
        dstaddr,
        size,
        Some(Arc::new(move |cu, ua| end_ok(cu, &h2, ua))),
    )
}

/// Receives up to `len` bytes then NUL-terminates and ends the program
/// normally. The destination must have room for `len + 1` bytes.
pub fn receive_string_final(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    dstaddr: Address,
    len: u16,
) -> Result<(), DevError> {
    let h2 = Arc::clone(h);
    receive_then(
        cu,
        h,
        ua,
        dstaddr,
        len,
        Some(Arc::new(move |cu, ua| {
            terminate_string(cu, &h2, ua);
            end_ok(cu, &h2, ua);
        })),
    )
}

/// Appends a NUL at the receive cursor.
pub fn terminate_string(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    let mut set = h.lock().unwrap();
    let i = set.index_of(ua).unwrap();
    let hd = &mut set.hldevs[i];
    cu.mem().write().unwrap().write(hd.addr, 0);
    hd.addr += 1;
    hd.count += 1;
}

/// Progresses a receive on arrival of a Data burst: accumulate, detect
/// EOF (peer End flag or Stopping), and either re-request the remainder
/// or hand the buffer to the completion callback.
fn do_receive(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    let done = {
        let mut set = h.lock().unwrap();
        let i = set.index_of(ua).unwrap();
        let devib = cu.devib(ua);
        debug_assert!(devib.is_cmd_write());

        let n = devib.payload_count();
        let eof = devib.is_stopping() || devib.op().end();
        let hd = &mut set.hldevs[i];
        debug_assert!(hd.count + n <= hd.size);
        hd.count += n;
        hd.addr += u32::from(n);
        if eof {
            hd.eof = true;
        }

        let remaining = hd.size - hd.count;
        let next_count = if remaining > 0 && !eof { remaining } else { 0 };
        cu.tracer().write_cond(
            cu.is_traced() || devib.is_traced(),
            RecordType::HldevReceiving,
            &records::link_segment(ua, u32::from(n), u32::from(next_count)),
        );

        if next_count > 0 {
            let addr = hd.addr;
            drop(set);
            if let Err(e) = cu.dev_receive(ua, addr, next_count) {
                error!("hldev receive continuation failed for ua {ua}: {e}");
            }
            None
        } else {
            hd.state = HldevState::Started;
            Some(Arc::clone(&hd.callback))
        }
    };

    if let Some(cb) = done {
        cb(cu, ua);
    }
}

//
// Logical send
//

fn start_send(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    srcaddr: Address,
    size: u16,
    callback: Option<HlCallback>,
    is_final: bool,
) -> Result<(), DevError> {
    debug_assert!(size > 0);
    let (n, flags) = {
        let mut set = h.lock().unwrap();
        let i = set.index_of(ua).unwrap();
        let window = cu.devib(ua).size;

        let hd = &mut set.hldevs[i];
        debug_assert_eq!(hd.state, HldevState::Started);
        if let Some(cb) = callback {
            hd.callback = cb;
        }
        hd.addr = srcaddr;
        hd.size = size;
        hd.count = 0;

        if size <= window {
            // enough announced room to send it all in one chunk
            if is_final {
                let start = Arc::clone(&set.start);
                set.hldevs[i].reset(&start);
                set.hldevs[i].state = HldevState::Ending;
                (size, CHOP_FLAG_FINAL)
            } else {
                hd.count = size;
                (size, 0)
            }
        } else {
            hd.state = if is_final {
                HldevState::SendingFinal
            } else {
                HldevState::Sending
            };
            hd.count = window;
            hd.addr = srcaddr + u32::from(window);
            (window, CHOP_FLAG_RESPONSE_REQUIRED)
        }
    };

    cu.tracer().write_cond(
        cu.is_traced() || cu.devib(ua).is_traced(),
        if is_final {
            RecordType::HldevSendFinal
        } else {
            RecordType::HldevSend
        },
        &records::link_segment(ua, srcaddr, u32::from(n)),
    );

    let sent = cu.dev_send(ua, srcaddr, n, flags)?;
    debug_assert_eq!(sent, n);
    if !is_final && n == sent && flags == 0 {
        // whole buffer fitted: the rest of the window shrinks
        cu.devib_mut(ua).size -= sent;
    }
    Ok(())
}

/// Sends `size` bytes from `srcaddr` to a Read-type CCW, spanning
/// segments as needed; the program continues afterwards.
pub fn send_then(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    srcaddr: Address,
    size: u16,
    callback: Option<HlCallback>,
) -> Result<(), DevError> {
    start_send(cu, h, ua, srcaddr, size, callback, false)
}

pub fn send(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    srcaddr: Address,
    size: u16,
) -> Result<(), DevError> {
    start_send(cu, h, ua, srcaddr, size, None, false)
}

/// Sends `size` bytes as the device's final data: the last chunk
/// carries the End flag and the program ends normally.
pub fn send_final(
    cu: &mut Cu,
    h: &HldevHandle,
    ua: UnitAddr,
    srcaddr: Address,
    size: u16,
) -> Result<(), DevError> {
    start_send(cu, h, ua, srcaddr, size, None, true)
}

/// Progresses a spanning send: next chunk on Room, End on the last.
fn do_send(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    let (src, n, flags) = {
        let mut set = h.lock().unwrap();
        let i = set.index_of(ua).unwrap();
        let window = cu.devib(ua).size;
        debug_assert!(!cu.devib(ua).is_cmd_write());

        let hd = &mut set.hldevs[i];
        let remaining = hd.size - hd.count;
        debug_assert!(remaining > 0);
        let is_final = hd.state == HldevState::SendingFinal;

        let src = hd.addr;
        let (n, flags) = if remaining > window {
            (window, CHOP_FLAG_RESPONSE_REQUIRED)
        } else if is_final {
            hd.state = HldevState::Ending;
            (remaining, CHOP_FLAG_FINAL)
        } else {
            hd.state = HldevState::Started;
            (remaining, 0)
        };
        hd.addr += u32::from(n);
        hd.count += n;

        cu.tracer().write_cond(
            cu.is_traced() || cu.devib(ua).is_traced(),
            RecordType::HldevSending,
            &records::link_segment(ua, u32::from(n), u32::from(window)),
        );
        (src, n, flags)
    };

    if let Err(e) = cu.dev_send(ua, src, n, flags) {
        error!("hldev send continuation failed for ua {ua}: {e}");
    }
}

//
// Ending a program
//

/// Ends the channel program with ChannelEnd|DeviceEnd, plus
/// `extra_devs` and UNIT_CHECK when a sense is present.
pub fn end(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr, extra_devs: DevStatus, sense: Sense) {
    {
        let mut set = h.lock().unwrap();
        let i = set.index_of(ua).unwrap();
        let start = Arc::clone(&set.start);
        let hd = &mut set.hldevs[i];
        hd.callback = start;
        hd.state = HldevState::Ending;
    }

    let mut devs = extra_devs.with_channel_end(true).with_device_end(true);
    if sense.is_set() {
        devs.set_unit_check(true);
    }
    cu.tracer().write_cond(
        cu.is_traced() || cu.devib(ua).is_traced(),
        RecordType::HldevEnd,
        &records::dev_byte(cu.cuaddr(), ua, devs.0),
    );

    cu.devib_mut(ua).sense = sense;
    if let Err(e) = cu.dev_update_status(ua, devs) {
        error!("hldev end failed for ua {ua}: {e}");
    }
}

pub fn end_ok(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    end(cu, h, ua, DevStatus(0), SENSE_NONE);
}

pub fn end_ok_sense(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr, sense: Sense) {
    end(cu, h, ua, DevStatus(0), sense);
}

pub fn end_reject(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr, code: u8) {
    end(cu, h, ua, DevStatus(0), Sense::reject(code));
}

pub fn end_exception(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    end(
        cu,
        h,
        ua,
        DevStatus(0).with_unit_exception(true),
        SENSE_NONE,
    );
}

pub fn end_exception_sense(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr, sense: Sense) {
    end(cu, h, ua, DevStatus(0).with_unit_exception(true), sense);
}

pub fn end_intervention(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr, code: u8) {
    end(
        cu,
        h,
        ua,
        DevStatus(0),
        Sense::new(SenseFlags(0).with_intervention_required(true), code),
    );
}

pub fn end_equipment_check(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr, code: u8) {
    end(
        cu,
        h,
        ua,
        DevStatus(0),
        Sense::new(SenseFlags(0).with_equipment_check(true), code),
    );
}

/// Marks the program ended outside the helper's own paths, e.g. after a
/// raw final-burst send through the low-level device API.
pub fn mark_ended(h: &HldevHandle, ua: UnitAddr) {
    let mut set = h.lock().unwrap();
    let set = &mut *set;
    let i = set.index_of(ua).unwrap();
    let start = Arc::clone(&set.start);
    set.hldevs[i].reset(&start);
    set.hldevs[i].state = HldevState::Ending;
}

/// Acknowledges a Stopping request with a cancel sense.
pub fn end_stopped(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    end(
        cu,
        h,
        ua,
        DevStatus(0),
        Sense::new(SenseFlags(0).with_cancel(true), 0),
    );
}

//
// Dispatch
//

enum Action {
    Nothing,
    Run(HlCallback),
    Receive,
    Send,
    Stopped,
    RejectNotStart,
}

/// The devib callback registered for every device of an hldev set.
pub fn devib_callback(cu: &mut Cu, h: &HldevHandle, ua: UnitAddr) {
    let action = {
        let mut set = h.lock().unwrap();
        let Some(i) = set.index_of(ua) else {
            drop(set);
            error!("hldev callback for ua {ua} outside the set");
            default_reject(cu, ua);
            return;
        };

        let devib = cu.devib(ua);
        cu.tracer().write_cond(
            cu.is_traced() || devib.is_traced(),
            RecordType::HldevDevibCallback,
            &records::dev_byte(cu.cuaddr(), ua, set.hldevs[i].state as u8),
        );

        if devib.is_stopping() {
            match &set.signal {
                Some(sig) => Action::Run(Arc::clone(sig)),
                None => Action::Stopped,
            }
        } else {
            let started = devib.is_started();
            let state = set.hldevs[i].state;
            match state {
                HldevState::Ending if !started => {
                    let start = Arc::clone(&set.start);
                    set.hldevs[i].reset(&start);
                    Action::Nothing
                }
                HldevState::Ending | HldevState::Idle => {
                    if devib.op().command() != Some(ChopCmd::Start) {
                        Action::RejectNotStart
                    } else {
                        let ccwcmd = devib.ccw_cmd();
                        let cb = set
                            .command_for(ccwcmd)
                            .unwrap_or_else(|| Arc::clone(&set.start));
                        let hd = &mut set.hldevs[i];
                        hd.ccwcmd = ccwcmd;
                        hd.eof = false;
                        hd.callback = Arc::clone(&cb);
                        hd.state = HldevState::Started;
                        Action::Run(cb)
                    }
                }
                HldevState::Started => {
                    Action::Run(Arc::clone(&set.hldevs[i].callback))
                }
                HldevState::Receiving => Action::Receive,
                HldevState::Sending | HldevState::SendingFinal => Action::Send,
            }
        }
    };

    match action {
        Action::Nothing => (),
        Action::Run(cb) => cb(cu, ua),
        Action::Receive => do_receive(cu, h, ua),
        Action::Send => do_send(cu, h, ua),
        Action::Stopped => end_stopped(cu, h, ua),
        Action::RejectNotStart => end_reject(cu, h, ua, err::IDLE_OP_NOT_START),
    }
}

fn default_reject(cu: &mut Cu, ua: UnitAddr) {
    crate::cu::default_devib_callback(cu, ua);
}
