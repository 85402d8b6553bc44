//! The Subchannel Information Block (SCHIB).
//!
//! A SCHIB is formed from the Path Management Control Word (PMCW), the
//! Subchannel Status Word (SCSW) and the Model Dependent Area (MDA). The
//! PMCW and SCSW are architected formats; the MDA is internal to the CSS.
//!
//! The MDA carries the intrusive list links: subchannels are chained by
//! small unit-address and subchannel-id indices rather than pointers, with
//! "not on any list" encoded as a link pointing at the node itself.

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::ccw::CcwFlags;
use crate::mem::Address;
use crate::scsw::Scsw;
use crate::types::{Chpid, Sid, UnitAddr};

/// Bits of the PMCW flags settable through `sch_modify`
pub const PMCW_MODIFY_MASK: u16 = 0x001f;

bitfield! {
    /// PMCW flags: the interrupt service class plus Enabled and Traced
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PmcwFlags(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        pub isc: u8 @ 0..=2,
        pub enabled: bool @ 3,
        pub traced: bool @ 4,
    }
}

/// The Path Management Control Word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pmcw {
    /// Opaque tag surfaced to the application on interruption
    pub intparm: u32,
    pub flags: PmcwFlags,
    pub chpid: Chpid,
    pub unit_addr: UnitAddr,
}

/// The Model Dependent Area. Contents are internal to the CSS.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Mda {
    /// Current byte pointer into the CCW's data buffer
    pub(crate) data_addr: Address,
    /// Device-advertised write window, or the device-requested read
    /// count while a RequestRead response is deferred
    pub(crate) devcount: u16,
    /// Flags of the current CCW. Kept out of scsw.devs so the SCSW only
    /// ever carries device status.
    pub(crate) ccw_flags: CcwFlags,
    pub(crate) prev_ua: UnitAddr,
    pub(crate) next_ua: UnitAddr,
    pub(crate) prev_sid: Sid,
    pub(crate) next_sid: Sid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Schib {
    pub pmcw: Pmcw,
    pub scsw: Scsw,
    pub(crate) mda: Mda,
}

impl Schib {
    pub(crate) fn new(sid: Sid) -> Self {
        Self {
            pmcw: Pmcw::default(),
            scsw: Scsw::default(),
            mda: Mda {
                // links point at self: on no list
                prev_sid: sid,
                next_sid: sid,
                ..Mda::default()
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pmcw.flags.enabled()
    }

    pub fn is_traced(&self) -> bool {
        self.pmcw.flags.traced()
    }

    pub fn is_status_pending(&self) -> bool {
        self.scsw.status_pending()
    }

    pub fn has_function_in_progress(&self) -> bool {
        self.scsw.function_in_progress()
    }

    /// Clears function, pending-activity and status-pending state.
    pub(crate) fn reset_to_idle(&mut self) {
        let c = &mut self.scsw.ctrl;
        c.set_fc_start(false);
        c.set_fc_halt(false);
        c.set_fc_clear(false);
        c.set_ac_resume_pending(false);
        c.set_ac_start_pending(false);
        c.set_ac_halt_pending(false);
        c.set_ac_clear_pending(false);
        c.set_ac_suspended(false);
        c.set_sc_pending(false);
    }

    /// Clears a delivered status-pending condition. An intermediate-only
    /// status (PCI progress, suspension) clears just the status-control
    /// bits so the in-progress function survives; anything else resets
    /// the subchannel to idle.
    pub(crate) fn clear_pending(&mut self) {
        debug_assert!(self.is_status_pending());
        let c = self.scsw.ctrl;
        if c.sc_intermediate() && !c.sc_primary() {
            self.scsw.ctrl.set_sc_pending(false);
            self.scsw.ctrl.set_sc_intermediate(false);
        } else {
            self.reset_to_idle();
        }
    }
}
