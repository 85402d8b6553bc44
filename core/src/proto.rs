//! The wire protocol between CSS and CU.
//!
//! A channel operation ("chop") byte carries a 4-bit command in the low
//! nibble and 4 flag bits in the high nibble; the flag meanings depend on
//! the command and direction. A packet is the chop byte, a unit address
//! and two payload bytes. Counts in packet payloads are big-endian (the
//! only big-endian fields in the whole system, a relic of their 16-bit
//! architected ancestors); everything else is native-endian.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::bsize::Bsize;
use crate::status::DevStatus;
use crate::types::UnitAddr;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum ChopCmd {
    Start = 0,
    Room = 1,
    Data = 2,
    UpdateStatus = 3,
    RequestRead = 4,
}

/// Valid in CSS->CU Start, Room and Data and in CU->CSS Data
pub const CHOP_FLAG_SKIP: u8 = 0x80;

/// Valid in CSS->CU Data: final segment of the channel program
pub const CHOP_FLAG_END: u8 = 0x40;

/// Valid in CSS->CU Data and Room: error terminator
pub const CHOP_FLAG_STOP: u8 = 0x20;

/// Valid in CU->CSS Data: peer must answer with a Room update
pub const CHOP_FLAG_RESPONSE_REQUIRED: u8 = 0x40;

/// Valid in CU->CSS Data: last burst of the program, equivalent to an
/// UpdateStatus of ChannelEnd|DeviceEnd with no sense
pub const CHOP_FLAG_FINAL: u8 = 0x20;

bitfield! {
    /// A channel operation byte: command plus direction-dependent flags.
    /// The flag accessors overlap; which reading applies depends on the
    /// command and the direction of travel.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Chop(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub cmd: u8 [try_get_fn ChopCmd::from_u8 -> Option<ChopCmd>] @ 0..=3,
        pub flags: u8 @ 4..=7,
        pub skip: bool @ 7,
        pub end: bool @ 6,
        pub response_required: bool @ 6,
        pub stop: bool @ 5,
        pub final_burst: bool @ 5,
    }
}

impl Chop {
    pub fn make(cmd: ChopCmd, flags: u8) -> Self {
        debug_assert_eq!(flags & 0x0f, 0);
        Self(cmd as u8 | flags)
    }

    pub fn command(self) -> Option<ChopCmd> {
        self.cmd()
    }
}

/// A 4-byte command packet sent on a channel between CSS and CU or vice
/// versa. Various parts of this implementation rely on the wire size
/// being exactly 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Packet {
    pub chop: Chop,
    pub unit_addr: UnitAddr,
    pub p0: u8,
    pub p1: u8,
}

impl Packet {
    pub const SIZE: usize = 4;

    pub fn new(chop: Chop, unit_addr: UnitAddr, p0: u8, p1: u8) -> Self {
        Self {
            chop,
            unit_addr,
            p0,
            p1,
        }
    }

    /// A packet whose payload is a big-endian 16-bit count
    pub fn with_count(chop: Chop, unit_addr: UnitAddr, count: u16) -> Self {
        let [p0, p1] = count.to_be_bytes();
        Self::new(chop, unit_addr, p0, p1)
    }

    /// A packet whose payload is a leading byte plus a bsize-encoded size
    pub fn with_esize(chop: Chop, unit_addr: UnitAddr, p0: u8, esize: Bsize) -> Self {
        Self::new(chop, unit_addr, p0, esize.raw())
    }

    /// Parses the payload as a big-endian 16-bit count
    pub fn count(&self) -> u16 {
        u16::from_be_bytes([self.p0, self.p1])
    }

    /// Decodes the second payload byte as a bsize-encoded size
    pub fn esize_count(&self) -> u16 {
        Bsize::from_raw(self.p1).decode()
    }

    /// Parses the first payload byte as a device status
    pub fn devs(&self) -> DevStatus {
        DevStatus(self.p0)
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [self.chop.0, self.unit_addr, self.p0, self.p1]
    }

    pub fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            chop: Chop(b[0]),
            unit_addr: b[1],
            p0: b[2],
            p1: b[3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsize;

    #[test]
    fn chop_nibbles() {
        let chop = Chop::make(ChopCmd::Data, CHOP_FLAG_SKIP | CHOP_FLAG_END);
        assert_eq!(chop.command(), Some(ChopCmd::Data));
        assert!(chop.skip());
        assert!(chop.end());
        assert!(!chop.stop());
        assert_eq!(chop.flags(), 0xc);
    }

    #[test]
    fn reserved_command_rejected() {
        let chop = Chop(0x0f);
        assert_eq!(chop.command(), None);
    }

    #[test]
    fn count_is_big_endian() {
        let p = Packet::with_count(Chop::make(ChopCmd::Room, 0), 3, 0x1234);
        assert_eq!(p.to_bytes(), [0x01, 3, 0x12, 0x34]);
        assert_eq!(Packet::from_bytes(p.to_bytes()).count(), 0x1234);
    }

    #[test]
    fn esize_payload() {
        let p = Packet::with_esize(Chop::make(ChopCmd::Start, 0), 0, 0x02, bsize::encode(64));
        assert_eq!(p.esize_count(), 64);
        assert_eq!(p.p0, 0x02);
    }
}
