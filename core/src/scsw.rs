//! The Subchannel Status Word (SCSW).
//!
//! As with CCWs, the `ccw_addr` and `count` fields are native-endian on
//! both peers rather than the architected big-endian. The flag fields are
//! slightly rearranged from their original architected positions.
//!
//! ```text
//! SCSW    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!         |               | CC|P|I|U|Z| |N|W|  FC |     AC      |   SC    |
//!         +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!         |                         CCW Address                           |
//!         +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!         |      DEVS     |     SCHS      |     Residual Count            |
//!         +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::mem::Address;
use crate::status::DevStatus;

bitfield! {
    /// SCSW user flags: the condition code of the terminating start plus
    /// the P/I/U/Z/N indicators
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ScswUserFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub cc: u8 @ 6..=7,
        pub p: bool @ 5,
        pub i: bool @ 4,
        pub u: bool @ 3,
        pub z: bool @ 2,
        pub n: bool @ 0,
    }
}

bitfield! {
    /// SCSW control flags: the CCW-is-Write indicator plus the Function,
    /// Activity and Status control subfields
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ScswCtrl(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Current CCW is a Write-type command
        pub ccw_write: bool @ 15,

        pub fc: u8 @ 12..=14,
        pub fc_start: bool @ 14,
        pub fc_halt: bool @ 13,
        pub fc_clear: bool @ 12,

        pub ac: u8 @ 5..=11,
        pub ac_resume_pending: bool @ 11,
        pub ac_start_pending: bool @ 10,
        pub ac_halt_pending: bool @ 9,
        pub ac_clear_pending: bool @ 8,
        pub ac_subchannel_active: bool @ 7,
        pub ac_device_active: bool @ 6,
        pub ac_suspended: bool @ 5,

        pub sc: u8 @ 0..=4,
        pub sc_alert: bool @ 4,
        pub sc_intermediate: bool @ 3,
        pub sc_primary: bool @ 2,
        pub sc_secondary: bool @ 1,
        pub sc_pending: bool @ 0,
    }
}

/// Function control mask: a non-zero FC means a function is in progress
pub const FC_MASK: u16 = 0x7000;

bitfield! {
    /// Subchannel status byte (SCHS): error indications raised by the CSS
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SubchStatus(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub program_controlled_interruption: bool @ 7,
        pub incorrect_length: bool @ 6,
        pub program_check: bool @ 5,
        pub protection_check: bool @ 4,
        pub channel_data_check: bool @ 3,
        pub channel_control_check: bool @ 2,
        pub interface_control_check: bool @ 1,
        pub chaining_check: bool @ 0,
    }
}

/// The architected 12-byte SCSW
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scsw {
    pub user_flags: ScswUserFlags,
    pub ctrl: ScswCtrl,
    pub ccw_addr: Address,
    pub devs: DevStatus,
    pub schs: SubchStatus,
    pub count: u16,
}

impl Scsw {
    pub const SIZE: usize = 12;

    pub fn status_pending(&self) -> bool {
        self.ctrl.sc_pending()
    }

    pub fn function_in_progress(&self) -> bool {
        self.ctrl.0 & FC_MASK != 0
    }

    /// Marshals into the architected 12-byte layout.
    pub fn to_bytes(self) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[1] = self.user_flags.0;
        b[2..4].copy_from_slice(&self.ctrl.0.to_ne_bytes());
        b[4..8].copy_from_slice(&self.ccw_addr.to_ne_bytes());
        b[8] = self.devs.0;
        b[9] = self.schs.0;
        b[10..12].copy_from_slice(&self.count.to_ne_bytes());
        b
    }

    pub fn from_bytes(b: [u8; 12]) -> Self {
        Self {
            user_flags: ScswUserFlags(b[1]),
            ctrl: ScswCtrl(u16::from_ne_bytes([b[2], b[3]])),
            ccw_addr: Address::from_ne_bytes([b[4], b[5], b[6], b[7]]),
            devs: DevStatus(b[8]),
            schs: SubchStatus(b[9]),
            count: u16::from_ne_bytes([b[10], b[11]]),
        }
    }
}
