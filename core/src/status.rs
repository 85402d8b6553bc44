//! Device status and sense as carried in UpdateStatus packets.

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

bitfield! {
    /// Device status byte (DEVS)
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DevStatus(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub attention: bool @ 7,
        pub status_modifier: bool @ 6,
        pub control_unit_end: bool @ 5,
        pub busy: bool @ 4,
        pub channel_end: bool @ 3,
        pub device_end: bool @ 2,
        pub unit_check: bool @ 1,
        pub unit_exception: bool @ 0,
    }
}

impl DevStatus {
    /// ChannelEnd|DeviceEnd: normal end of a channel program
    pub fn end_ok() -> Self {
        Self(0).with_channel_end(true).with_device_end(true)
    }
}

bitfield! {
    /// Sense flags, the first byte of a sense block
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SenseFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub command_reject: bool @ 7,
        pub intervention_required: bool @ 6,
        pub bus_out_check: bool @ 5,
        pub equipment_check: bool @ 4,
        pub data_check: bool @ 3,
        pub overrun: bool @ 2,
        pub proto_error: bool @ 1,
        pub cancel: bool @ 0,
    }
}

/// Standard sense codes. Codes 128 and above are reserved for
/// device-specific errors.
pub mod sense_code {
    pub const NO_SUCH_ERROR: u8 = 1;
    pub const INVALID_CALLBACK: u8 = 2;
    pub const NOT_STARTED: u8 = 3;
    pub const CMD_NOT_READ: u8 = 4;
    pub const CMD_NOT_WRITE: u8 = 5;
    pub const WRITE_TOO_BIG: u8 = 6;
    pub const INVALID_STATUS: u8 = 7;
    pub const INVALID_DEVICE: u8 = 8;
    pub const INVALID_CMD: u8 = 9;
}

/// Four bytes of device error detail accompanying UNIT_CHECK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sense {
    pub flags: SenseFlags,
    pub code: u8,
    pub asc: u8,
    pub ascq: u8,
}

pub const SENSE_NONE: Sense = Sense {
    flags: SenseFlags(0),
    code: 0,
    asc: 0,
    ascq: 0,
};

impl Sense {
    pub fn new(flags: SenseFlags, code: u8) -> Self {
        Self {
            flags,
            code,
            asc: 0,
            ascq: 0,
        }
    }

    pub fn reject(code: u8) -> Self {
        Self::new(SenseFlags(0).with_command_reject(true), code)
    }

    pub fn is_set(&self) -> bool {
        self.flags.0 != 0
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [self.flags.0, self.code, self.asc, self.ascq]
    }

    pub fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            flags: SenseFlags(b[0]),
            code: b[1],
            asc: b[2],
            ascq: b[3],
        }
    }
}
