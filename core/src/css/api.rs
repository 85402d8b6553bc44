//! The architectural subchannel API plus its convenience wrappers.
//!
//! Every operation reports a 2-bit condition code. The API never blocks;
//! the `sch_wait` family are convenience wrappers that park the reactor
//! between tests and must only be used while the subchannel's ISC is
//! disabled (so the I/O callback does not consume the status first).

use std::time::Instant;

use super::lists;
use super::schib::{Pmcw, Schib, PMCW_MODIFY_MASK};
use crate::mem::Address;
use crate::scsw::Scsw;
use crate::trc::{records, RecordType};
use crate::types::{CondCode, Sid};

use super::Css;

impl Css {
    fn schib_ready_for_start(schib: &Schib) -> CondCode {
        if !schib.is_enabled() {
            CondCode::NotOperational
        } else if schib.has_function_in_progress() {
            CondCode::Busy
        } else if schib.is_status_pending() {
            CondCode::StatusPending
        } else {
            CondCode::Ok
        }
    }

    fn push_func(&mut self, sid: Sid) {
        let chpid = self.schibs[sid as usize].pmcw.chpid;
        let ua = self.schibs[sid as usize].pmcw.unit_addr;
        let chp = &mut self.chps[chpid as usize];
        lists::ua_dlist_push(&mut chp.ua_func_dlist, &mut self.schibs, chp.first_sid, ua);
        self.raise_func_irq();
    }

    /// Starts a channel program at `ccw_addr`.
    ///
    /// cc 0: started; 1: status pending must be cleared first; 2: a
    /// function is already in progress; 3: not enabled or invalid sid.
    pub fn sch_start(&mut self, sid: Sid, ccw_addr: Address) -> CondCode {
        let Some(schib) = self.schibs.get_mut(sid as usize) else {
            return CondCode::NotOperational;
        };

        let cc = Self::schib_ready_for_start(schib);
        if cc == CondCode::Ok {
            debug_assert_eq!(schib.mda.next_sid, sid); // not on any list
            schib.scsw.ccw_addr = ccw_addr;
            schib.scsw.ctrl.set_fc_start(true);
            schib.scsw.ctrl.set_ac_start_pending(true);
            self.push_func(sid);
        }

        self.tracer.write(
            RecordType::CssSchStart,
            &records::word_sid_byte(ccw_addr, sid, cc.as_u8()),
        );
        cc
    }

    /// Resumes a suspended channel program (refetching the CCW that
    /// suspended). Condition codes as for [`Css::sch_start`].
    pub fn sch_resume(&mut self, sid: Sid) -> CondCode {
        let Some(schib) = self.schibs.get_mut(sid as usize) else {
            return CondCode::NotOperational;
        };

        let cc = if !schib.is_enabled() {
            CondCode::NotOperational
        } else if schib.is_status_pending() {
            CondCode::StatusPending
        } else if schib.has_function_in_progress() && !schib.scsw.ctrl.ac_suspended() {
            CondCode::Busy
        } else {
            CondCode::Ok
        };

        if cc == CondCode::Ok {
            debug_assert_eq!(schib.mda.next_sid, sid);
            schib.scsw.ctrl.set_ac_suspended(false);
            schib.scsw.ctrl.set_fc_start(true);
            schib.scsw.ctrl.set_ac_resume_pending(true);
            self.push_func(sid);
        }

        self.tracer
            .write(RecordType::CssSchResume, &records::sid_byte(sid, cc.as_u8()));
        cc
    }

    /// Retrieves and clears a pending status.
    ///
    /// cc 0: the SCSW was stored and the pending status cleared; 1: the
    /// subchannel was not status-pending (the SCSW is still a valid
    /// snapshot); 3: invalid sid.
    pub fn sch_test(&mut self, sid: Sid) -> (CondCode, Scsw) {
        let Some(schib) = self.schibs.get_mut(sid as usize) else {
            return (CondCode::NotOperational, Scsw::default());
        };

        let scsw = schib.scsw;
        let cc = if schib.is_status_pending() {
            if self.isc.is_on_pending_list(&self.schibs, sid) {
                self.isc.remove_pending(&mut self.schibs, sid);
            }
            self.schibs[sid as usize].clear_pending();
            CondCode::Ok
        } else {
            CondCode::StatusPending // meaning: nothing was pending
        };

        self.tracer.write(
            RecordType::CssSchTest,
            &records::scsw_sid_cc(&scsw, sid, cc.as_u8()),
        );
        (cc, scsw)
    }

    /// Updates the interruption parameter and the modifiable PMCW flag
    /// bits.
    ///
    /// cc 0: modified; 1: blocked by pending status; 2: blocked by a
    /// function in progress; 3: invalid sid.
    pub fn sch_modify(&mut self, sid: Sid, pmcw: &Pmcw) -> CondCode {
        let Some(schib) = self.schibs.get_mut(sid as usize) else {
            return CondCode::NotOperational;
        };

        let cc = if schib.has_function_in_progress() {
            CondCode::Busy
        } else if schib.is_status_pending() {
            CondCode::StatusPending
        } else {
            schib.pmcw.intparm = pmcw.intparm;
            schib.pmcw.flags.0 = pmcw.flags.0 & PMCW_MODIFY_MASK;
            CondCode::Ok
        };

        self.tracer
            .write(RecordType::CssSchModify, &records::sid_byte(sid, cc.as_u8()));
        cc
    }

    /// Snapshots the whole SCHIB. None for an invalid sid.
    pub fn sch_store(&self, sid: Sid) -> Option<Schib> {
        let schib = self.schibs.get(sid as usize).copied();
        self.tracer.write(
            RecordType::CssSchStore,
            &records::sid_byte(sid, u8::from(schib.is_none())),
        );
        schib
    }

    /// Snapshots just the PMCW. None for an invalid sid.
    pub fn sch_store_pmcw(&self, sid: Sid) -> Option<Pmcw> {
        self.sch_store(sid).map(|s| s.pmcw)
    }

    /// Snapshots just the SCSW. None for an invalid sid.
    pub fn sch_store_scsw(&self, sid: Sid) -> Option<Scsw> {
        self.sch_store(sid).map(|s| s.scsw)
    }

    /// Cancels a start function that has not reached the device: valid
    /// only when the function is Start, the subchannel is not active, and
    /// exactly one of Start-Pending, Resume-Pending or Suspended is set.
    ///
    /// cc 0: cancelled, subchannel idle; 1: blocked by pending status;
    /// 2: not in a cancellable state; 3: not enabled or invalid sid.
    pub fn sch_cancel(&mut self, sid: Sid) -> CondCode {
        let Some(schib) = self.schibs.get_mut(sid as usize) else {
            return CondCode::NotOperational;
        };

        let ctrl = schib.scsw.ctrl;
        let cc = if !schib.is_enabled() {
            CondCode::NotOperational
        } else if schib.is_status_pending() {
            CondCode::StatusPending
        } else if ctrl.fc() != 0b100 // Start alone
            || ctrl.ac_subchannel_active()
            || u32::from(ctrl.ac_start_pending())
                + u32::from(ctrl.ac_resume_pending())
                + u32::from(ctrl.ac_suspended())
                != 1
        {
            CondCode::Busy
        } else {
            CondCode::Ok
        };

        if cc == CondCode::Ok {
            if ctrl.ac_suspended() {
                // a suspended subchannel may still sit on its ISC list if
                // the suspension status was never consumed
                if self.isc.is_on_pending_list(&self.schibs, sid) {
                    self.isc.remove_pending(&mut self.schibs, sid);
                }
            } else {
                // start- or resume-pending: queued on the path's
                // function list
                let chpid = self.schibs[sid as usize].pmcw.chpid;
                let ua = self.schibs[sid as usize].pmcw.unit_addr;
                let chp = &mut self.chps[chpid as usize];
                lists::ua_dlist_remove(
                    &mut chp.ua_func_dlist,
                    &mut self.schibs,
                    chp.first_sid,
                    ua,
                );
            }
            self.schibs[sid as usize].reset_to_idle();
        }

        self.tracer
            .write(RecordType::CssSchCancel, &records::sid_byte(sid, cc.as_u8()));
        cc
    }

    //
    // Convenience wrappers
    //

    /// Store-then-modify of the interruption parameter.
    pub fn sch_modify_intparm(&mut self, sid: Sid, intparm: u32) -> CondCode {
        let Some(mut pmcw) = self.sch_store_pmcw(sid) else {
            return CondCode::NotOperational;
        };
        pmcw.intparm = intparm;
        self.sch_modify(sid, &pmcw)
    }

    /// Store-then-modify of the PMCW flags. Bits outside the modifiable
    /// mask are silently ignored.
    pub fn sch_modify_flags(&mut self, sid: Sid, flags: u16) -> CondCode {
        let Some(mut pmcw) = self.sch_store_pmcw(sid) else {
            return CondCode::NotOperational;
        };
        pmcw.flags.0 = flags;
        self.sch_modify(sid, &pmcw)
    }

    /// Store-then-modify of the ISC number (0-7).
    pub fn sch_modify_isc(&mut self, sid: Sid, isc: u8) -> CondCode {
        if isc > 7 {
            return CondCode::NotOperational;
        }
        let Some(mut pmcw) = self.sch_store_pmcw(sid) else {
            return CondCode::NotOperational;
        };
        pmcw.flags.set_isc(isc);
        self.sch_modify(sid, &pmcw)
    }

    /// Store-then-modify of the Enabled bit.
    pub fn sch_modify_enabled(&mut self, sid: Sid, enabled: bool) -> CondCode {
        let Some(mut pmcw) = self.sch_store_pmcw(sid) else {
            return CondCode::NotOperational;
        };
        pmcw.flags.set_enabled(enabled);
        self.sch_modify(sid, &pmcw)
    }

    /// Store-then-modify of the Traced bit.
    pub fn sch_modify_traced(&mut self, sid: Sid, traced: bool) -> CondCode {
        let Some(mut pmcw) = self.sch_store_pmcw(sid) else {
            return CondCode::NotOperational;
        };
        pmcw.flags.set_traced(traced);
        self.sch_modify(sid, &pmcw)
    }

    /// Polls the reactor until the subchannel turns status-pending, then
    /// retrieves the status.
    pub fn sch_wait(&mut self, sid: Sid) -> (CondCode, Scsw) {
        loop {
            let (cc, scsw) = self.sch_test(sid);
            if cc != CondCode::StatusPending {
                return (cc, scsw);
            }
            self.wait();
        }
    }

    /// As [`Css::sch_wait`] with a deadline; cc 2 reports a timeout.
    pub fn sch_wait_timeout(&mut self, sid: Sid, deadline: Instant) -> (CondCode, Scsw) {
        loop {
            let (cc, scsw) = self.sch_test(sid);
            if cc != CondCode::StatusPending {
                return (cc, scsw);
            }
            if Instant::now() >= deadline {
                return (CondCode::Busy, scsw);
            }
            self.wait_deadline(deadline);
        }
    }

    /// Starts a channel program and waits for its final status.
    pub fn sch_run_wait(&mut self, sid: Sid, ccw_addr: Address) -> (CondCode, Scsw) {
        let cc = self.sch_start(sid, ccw_addr);
        if cc != CondCode::Ok {
            return (cc, Scsw::default());
        }
        self.sch_wait(sid)
    }

    /// As [`Css::sch_run_wait`] with a deadline; cc 2 reports a timeout.
    pub fn sch_run_wait_timeout(
        &mut self,
        sid: Sid,
        ccw_addr: Address,
        deadline: Instant,
    ) -> (CondCode, Scsw) {
        let cc = self.sch_start(sid, ccw_addr);
        if cc != CondCode::Ok {
            return (cc, Scsw::default());
        }
        self.sch_wait_timeout(sid, deadline)
    }
}
