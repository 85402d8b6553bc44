//! The Channel SubSystem: subchannel state machine, CCW chaining, ISC
//! priority dispatch and the architectural API.
//!
//! A [`Css`] is an event-driven reactor: API calls enqueue work and raise
//! the function IRQ, link completions raise DMA events, and
//! [`Css::poll`] drains them all. Applications either poll explicitly or
//! park a thread in [`Css::wait`] and let link peers wake it.

mod api;
mod chp;
mod fetch;
mod func;
mod lists;
mod response;
mod rx;
mod schib;
mod tx;

pub use chp::ChannelPath;
pub use schib::{Mda, Pmcw, PmcwFlags, Schib, PMCW_MODIFY_MASK};

use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Result};
use crossbeam_channel::Receiver;
use log::*;
use serde::{Deserialize, Serialize};

use crate::dmachan::{Channel, LinkKind};
use crate::mem::MemHandle;
use crate::scsw::Scsw;
use crate::status::DevStatus;
use crate::trc::{records, RecordType, Tracer, CSS_BUFFERSET_MAGIC};
use crate::types::{Chpid, LatchingEvent, Sid, UnitAddr, Waker};

/// Number of interrupt service classes; ISC 0 has the highest priority
pub const NUM_ISCS: usize = 8;

/// An I/O interruption code, as returned from
/// [`Css::test_pending_interruption`]. `cc` 0 means nothing was pending
/// and the other fields are meaningless; 1 means the interruption
/// information was stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intcode {
    pub intparm: u32,
    pub sid: Sid,
    pub isc: u8,
    pub cc: u8,
}

impl Intcode {
    pub fn stored(&self) -> bool {
        self.cc == 1
    }
}

/// I/O interruption callback. Runs on the CSS reactor; receives the CSS
/// itself so a completion handler can start follow-on channel programs.
pub type IoCallback = Box<dyn FnMut(&mut Css, Intcode, Scsw) + Send>;

/// ISC pending lists plus their status/enablement masks
pub(crate) struct IscState {
    dlists: [Option<Sid>; NUM_ISCS],
    enable_mask: u8,
    status_mask: u8,
    io_irq: LatchingEvent,
    waker: Waker,
}

impl IscState {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            dlists: [None; NUM_ISCS],
            enable_mask: 0,
            status_mask: 0,
            io_irq: LatchingEvent::default(),
            waker,
        }
    }

    fn raise_io_irq(&mut self) {
        self.io_irq.set();
        let _ = self.waker.try_send(());
    }

    fn push_pending(&mut self, schibs: &mut [Schib], sid: Sid) {
        let iscnum = schibs[sid as usize].pmcw.flags.isc();
        let was_empty = lists::dlist_push(&mut self.dlists[iscnum as usize], schibs, sid);
        if !was_empty {
            return;
        }

        self.status_mask |= 1 << iscnum;
        if self.enable_mask & (1 << iscnum) != 0 {
            self.raise_io_irq();
        }
    }

    pub(crate) fn is_on_pending_list(&self, schibs: &[Schib], sid: Sid) -> bool {
        let iscnum = schibs[sid as usize].pmcw.flags.isc();
        lists::dlist_contains(self.dlists[iscnum as usize], schibs, sid)
    }

    pub(crate) fn remove_pending(&mut self, schibs: &mut [Schib], sid: Sid) {
        let iscnum = schibs[sid as usize].pmcw.flags.isc();
        let head = &mut self.dlists[iscnum as usize];
        lists::dlist_remove(head, schibs, sid);
        if head.is_none() {
            self.status_mask &= !(1 << iscnum);
        }
    }

    fn pop_pending_from_isc(&mut self, schibs: &mut [Schib], iscnum: u8) -> Option<Sid> {
        if self.status_mask & (1 << iscnum) == 0 {
            return None;
        }
        let head = &mut self.dlists[iscnum as usize];
        let sid = lists::dlist_pop(head, schibs);
        debug_assert!(sid.is_some());
        if head.is_none() {
            self.status_mask &= !(1 << iscnum);
        }
        sid
    }

    /// Pops the head of the highest-priority enabled non-empty ISC list.
    pub(crate) fn pop_pending(&mut self, schibs: &mut [Schib]) -> Option<Sid> {
        let mask = self.enable_mask & self.status_mask;
        if mask == 0 {
            return None;
        }
        self.pop_pending_from_isc(schibs, mask.trailing_zeros() as u8)
    }

    fn set_isc_enabled(&mut self, iscnum: u8, enabled: bool) {
        debug_assert!((iscnum as usize) < NUM_ISCS);
        if enabled {
            self.enable_mask |= 1 << iscnum;
            if self.status_mask & (1 << iscnum) != 0 {
                self.raise_io_irq();
            }
        } else {
            self.enable_mask &= !(1 << iscnum);
        }
    }

    fn set_enable_mask(&mut self, mask: u8) {
        // newly-enabled bits with non-empty lists re-raise the I/O IRQ
        let newly = mask & !self.enable_mask;
        self.enable_mask = mask;
        if newly & self.status_mask != 0 {
            self.raise_io_irq();
        }
    }
}

/// Split-borrow context threaded through the engine internals
pub(crate) struct CssCtx<'a> {
    pub schibs: &'a mut [Schib],
    pub isc: &'a mut IscState,
    pub mem: &'a MemHandle,
    pub tracer: &'a Tracer,
}

/// Marks a subchannel status-pending (unless it already is) and queues
/// it on its ISC list.
pub(crate) fn notify(ctx: &mut CssCtx, sid: Sid, devs: DevStatus) {
    let schib = &mut ctx.schibs[sid as usize];
    if schib.is_status_pending() {
        return; // already pending, nothing to do
    }

    schib.scsw.devs = devs;
    schib.scsw.ctrl.set_sc_pending(true);
    ctx.tracer.write_cond(
        schib.is_traced(),
        RecordType::CssNotify,
        &records::sid_byte(sid, devs.0),
    );
    ctx.isc.push_pending(ctx.schibs, sid);
}

#[derive(Debug, Clone)]
pub struct CssConfig {
    pub num_schibs: usize,
    pub num_chps: usize,
}

impl Default for CssConfig {
    fn default() -> Self {
        Self {
            num_schibs: 32,
            num_chps: 4,
        }
    }
}

pub struct Css {
    schibs: Vec<Schib>,
    chps: Vec<ChannelPath>,
    isc: IscState,
    next_sid: Sid,
    io_callback: Option<IoCallback>,
    func_irq: LatchingEvent,
    started: bool,
    mem: MemHandle,
    tracer: Tracer,
    waker: Waker,
    wake_rx: Receiver<()>,
}

impl Css {
    pub fn new(mem: &MemHandle) -> Self {
        Self::with_config(mem, &CssConfig::default())
    }

    pub fn with_config(mem: &MemHandle, config: &CssConfig) -> Self {
        assert!(config.num_schibs >= 1 && config.num_schibs <= 65536);
        assert!(config.num_chps >= 1 && config.num_chps <= 256);

        let (waker, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            schibs: (0..config.num_schibs).map(|i| Schib::new(i as Sid)).collect(),
            chps: (0..config.num_chps).map(|_| ChannelPath::new()).collect(),
            isc: IscState::new(waker.clone()),
            next_sid: 0,
            io_callback: None,
            func_irq: LatchingEvent::default(),
            started: false,
            mem: MemHandle::clone(mem),
            tracer: Tracer::new(CSS_BUFFERSET_MAGIC),
            waker,
            wake_rx,
        }
    }

    /// Starts the CSS: installs the I/O callback (if any) and the initial
    /// ISC enablement mask.
    pub fn start(&mut self, io_callback: Option<IoCallback>, isc_mask: u8) {
        self.isc.set_enable_mask(isc_mask);
        if io_callback.is_some() {
            self.io_callback = io_callback;
        }
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn set_io_callback(&mut self, io_callback: Option<IoCallback>) {
        self.tracer
            .write(RecordType::CssSetIoCallback, &records::byte(0));
        self.io_callback = io_callback;
    }

    pub fn mem(&self) -> &MemHandle {
        &self.mem
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Enables or disables bufferset tracing; returns the old setting.
    pub fn set_trace(&mut self, trace: bool) -> bool {
        self.tracer.set_enable(trace)
    }

    pub fn schib(&self, sid: Sid) -> Option<&Schib> {
        self.schibs.get(sid as usize)
    }

    //
    // ISC enablement
    //

    pub fn set_isc_enabled(&mut self, iscnum: u8, enabled: bool) {
        self.isc.set_isc_enabled(iscnum, enabled);
    }

    pub fn is_isc_enabled(&self, iscnum: u8) -> bool {
        self.isc.enable_mask & (1 << iscnum) != 0
    }

    pub fn is_isc_pending(&self, iscnum: u8) -> bool {
        self.isc.status_mask & (1 << iscnum) != 0
    }

    pub fn set_isc_enable_mask(&mut self, mask: u8) {
        self.isc.set_enable_mask(mask);
    }

    //
    // Channel paths
    //

    fn chp_mut(&mut self, chpid: Chpid) -> Result<&mut ChannelPath> {
        let n = self.chps.len();
        match self.chps.get_mut(chpid as usize) {
            Some(chp) => Ok(chp),
            None => bail!("channel path {chpid} out of range ({n} paths)"),
        }
    }

    /// Reserves a channel path id for the caller.
    pub fn chp_claim(&mut self, chpid: Chpid) -> Result<()> {
        let chp = self.chp_mut(chpid)?;
        ensure!(
            !chp.claimed && !chp.allocated,
            "channel path {chpid} already in use"
        );
        chp.claimed = true;
        Ok(())
    }

    /// Claims the first unclaimed channel path, if any.
    pub fn chp_claim_unused(&mut self) -> Option<Chpid> {
        let chpid = self
            .chps
            .iter()
            .position(|chp| !chp.claimed && !chp.allocated)? as Chpid;
        self.chps[chpid as usize].claimed = true;
        Some(chpid)
    }

    /// Allocates `num_devices` subchannels to a channel path and returns
    /// the first subchannel id. Unit address `ua` on the path maps to
    /// subchannel `first_sid + ua`.
    pub fn chp_alloc(&mut self, chpid: Chpid, num_devices: u16) -> Result<Sid> {
        ensure!(self.started, "CSS not started");
        ensure!(
            num_devices >= 1 && num_devices <= 256,
            "device count {num_devices} out of range"
        );
        let first_sid = self.next_sid;
        ensure!(
            first_sid as usize + num_devices as usize <= self.schibs.len(),
            "out of subchannels"
        );

        let chp = self.chp_mut(chpid)?;
        ensure!(!chp.allocated, "channel path {chpid} already allocated");
        chp.first_sid = first_sid;
        chp.num_devices = num_devices;
        chp.allocated = true;

        self.next_sid += num_devices;
        for i in 0..num_devices {
            let ua = i as UnitAddr;
            let schib = &mut self.schibs[(first_sid + i) as usize];
            schib.pmcw.chpid = chpid;
            schib.pmcw.unit_addr = ua;
            schib.mda.next_ua = ua;
            schib.mda.prev_ua = ua;
        }

        self.tracer.write(
            RecordType::CssChpAlloc,
            &records::word_sid_byte(u32::from(num_devices), first_sid, chpid),
        );
        Ok(first_sid)
    }

    /// Attaches one side of a link to an allocated channel path.
    pub fn chp_configure(&mut self, chpid: Chpid, channel: Channel) -> Result<()> {
        let waker = self.waker.clone();
        let tracer = self.tracer.clone();
        let chp = self.chp_mut(chpid)?;
        ensure!(chp.allocated, "channel path {chpid} not allocated");
        ensure!(!chp.is_configured(), "channel path {chpid} already configured");

        channel.waker_cell().register(waker);
        let mut channel = channel;
        if chp.traced {
            channel.set_trace(Some(tracer), chpid);
        }
        chp.channel = Some(channel);
        self.tracer
            .write(RecordType::CssChpConfigured, &records::byte(chpid));
        Ok(())
    }

    pub fn chp_configure_memchan(&mut self, chpid: Chpid, channel: Channel) -> Result<()> {
        ensure!(channel.kind == LinkKind::Mem, "not a memory channel");
        self.chp_configure(chpid, channel)
    }

    pub fn chp_configure_uartchan(&mut self, chpid: Chpid, channel: Channel) -> Result<()> {
        ensure!(channel.kind == LinkKind::Uart, "not a uart channel");
        self.chp_configure(chpid, channel)
    }

    pub fn chp_configure_piochan(&mut self, chpid: Chpid, channel: Channel) -> Result<()> {
        ensure!(channel.kind == LinkKind::Pio, "not a pio channel");
        self.chp_configure(chpid, channel)
    }

    /// Starts a configured channel path: arms command reception and
    /// pokes the reset byte so the peer drains its rx pipeline.
    pub fn chp_start(&mut self, chpid: Chpid) -> Result<()> {
        let chp = self.chp_mut(chpid)?;
        ensure!(chp.is_configured(), "channel path {chpid} not configured");
        if chp.started {
            return Ok(());
        }

        chp.started = true;
        let ch = chp.channel.as_mut().unwrap();
        ch.rx.start_dst_cmdbuf();
        ch.tx.write_src_reset();
        self.tracer
            .write(RecordType::CssChpStarted, &records::byte(chpid));
        Ok(())
    }

    /// Enables or disables link tracing on a channel path; returns the
    /// old setting.
    pub fn chp_set_trace(&mut self, chpid: Chpid, trace: bool) -> Result<bool> {
        let tracer = self.tracer.clone();
        let chp = self.chp_mut(chpid)?;
        let old = chp.traced;
        chp.traced = trace;
        if let Some(ch) = chp.channel.as_mut() {
            ch.set_trace(trace.then_some(tracer), chpid);
        }
        self.tracer
            .write(RecordType::CssChpTraced, &records::id_byte(chpid, u8::from(trace)));
        Ok(old)
    }

    pub(crate) fn raise_func_irq(&mut self) {
        self.func_irq.set();
        let _ = self.waker.try_send(());
    }

    //
    // Reactor
    //

    /// Drains all raised work: link completions, queued functions, and
    /// the I/O interruption callback. Returns whether anything ran.
    pub fn poll(&mut self) -> bool {
        while self.wake_rx.try_recv().is_ok() {}

        let mut acted = false;
        loop {
            let mut any = self.service_links();
            if self.func_irq.get_clear() {
                self.service_func();
                any = true;
            }
            if self.isc.io_irq.get_clear() {
                self.dispatch_io();
                any = true;
            }
            if !any {
                break;
            }
            acted = true;
        }
        acted
    }

    /// Parks briefly for a wake from a link peer or API call, then polls.
    /// Returns whether anything ran.
    pub fn wait(&mut self) -> bool {
        if self.poll() {
            return true;
        }
        let _ = self.wake_rx.recv_timeout(Duration::from_millis(20));
        self.poll()
    }

    /// As [`Css::wait`] with an overall deadline.
    pub fn wait_deadline(&mut self, deadline: Instant) -> bool {
        if self.poll() {
            return true;
        }
        let now = Instant::now();
        if now < deadline {
            let _ = self.wake_rx.recv_timeout(deadline - now);
        }
        self.poll()
    }

    fn service_links(&mut self) -> bool {
        let mut acted = false;
        let Self {
            schibs,
            chps,
            isc,
            mem,
            tracer,
            ..
        } = self;

        for (chpid, chp) in chps.iter_mut().enumerate() {
            if !chp.started {
                continue;
            }

            let mut ctx = CssCtx {
                schibs: schibs.as_mut_slice(),
                isc: &mut *isc,
                mem,
                tracer,
            };

            let ch = chp.channel.as_mut().unwrap();
            let rx_st = ch.rx.handle_rx_irq();
            let tx_st = ch.tx.handle_tx_irq();
            if rx_st.raised || tx_st.raised {
                tracer.write_cond(
                    chp.traced,
                    RecordType::CssChpIrq,
                    &records::dev_byte(chpid as u8, rx_st.as_byte(), tx_st.as_byte()),
                );
            }

            // tx before rx: a peer response always postdates our own
            // completed send, even when both completions were batched
            if tx_st.complete {
                tx::handle_tx_complete(&mut ctx, chp);
                acted = true;
            }
            if rx_st.complete {
                rx::handle_rx_complete(&mut ctx, chp);
                acted = true;
            }

            // while the tx engine is free, flush queued responses
            while !chp.tx_active {
                let Some(ua) = chp.ua_response_slist.pop(ctx.schibs, chp.first_sid) else {
                    break;
                };
                let sid = chp.sid_of(ua);
                response::process_schib_response(&mut ctx, chp, sid);
                acted = true;
            }
        }
        acted
    }

    fn service_func(&mut self) {
        let Self {
            schibs,
            chps,
            isc,
            mem,
            tracer,
            ..
        } = self;

        for chp in chps.iter_mut() {
            if !chp.started {
                continue;
            }

            let mut ctx = CssCtx {
                schibs: schibs.as_mut_slice(),
                isc: &mut *isc,
                mem,
                tracer,
            };

            while !chp.tx_active {
                let Some(ua) =
                    lists::ua_dlist_pop(&mut chp.ua_func_dlist, ctx.schibs, chp.first_sid)
                else {
                    break;
                };
                let sid = chp.sid_of(ua);
                tracer.write_cond(
                    chp.traced,
                    RecordType::CssFuncIrq,
                    &records::sid_byte(sid, ua),
                );
                func::process_schib_func(&mut ctx, chp, sid);
            }
        }
    }

    fn dispatch_io(&mut self) {
        if self.io_callback.is_none() {
            // no callback installed: interruptions stay queued for
            // test_pending_interruption
            return;
        }

        loop {
            let Some(sid) = self.isc.pop_pending(&mut self.schibs) else {
                break;
            };
            let schib = &mut self.schibs[sid as usize];
            let scsw = schib.scsw;
            let ic = Intcode {
                intparm: schib.pmcw.intparm,
                sid,
                isc: schib.pmcw.flags.isc(),
                cc: 1,
            };
            schib.clear_pending();

            let Some(mut cb) = self.io_callback.take() else {
                break;
            };
            self.tracer.write(
                RecordType::CssIoCallback,
                &records::word_sid_byte(ic.intparm, sid, ic.isc),
            );
            cb(self, ic, scsw);
            if self.io_callback.is_none() {
                self.io_callback = Some(cb);
            } else {
                debug!("io callback replaced from within io callback");
            }
        }
    }

    /// Debugging aid: panics unless every subchannel that is
    /// status-pending sits on exactly one ISC list and every idle one
    /// carries the self-link sentinel. Subchannels withdrawn by
    /// `test_pending_interruption` but not yet tested are exempt from
    /// the first half.
    pub fn check_invariants(&self) {
        for (sid, schib) in self.schibs.iter().enumerate() {
            let on_lists = (0..NUM_ISCS)
                .filter(|&i| lists::dlist_contains(self.isc.dlists[i], &self.schibs, sid as Sid))
                .count();
            assert!(on_lists <= 1, "sid {sid} on {on_lists} ISC lists");
            if on_lists == 1 {
                assert!(
                    schib.is_status_pending(),
                    "sid {sid} on an ISC list but not status-pending"
                );
            }
            if !schib.is_status_pending() {
                assert_eq!(
                    schib.mda.next_sid, sid as Sid,
                    "idle sid {sid} not self-linked"
                );
            }
        }
    }

    /// Withdraws the highest-priority pending interruption, leaving the
    /// subchannel status-pending for a subsequent `sch_test`.
    pub fn test_pending_interruption(&mut self) -> Intcode {
        let Some(sid) = self.isc.pop_pending(&mut self.schibs) else {
            return Intcode::default();
        };
        let schib = &self.schibs[sid as usize];
        Intcode {
            intparm: schib.pmcw.intparm,
            sid,
            isc: schib.pmcw.flags.isc(),
            cc: 1,
        }
    }

}
