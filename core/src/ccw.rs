//! Channel Command Words: the 8-byte instructions of a channel program.
//!
//! Unlike the architected Format-1 CCW, which was implicitly big-endian,
//! the count and address fields here are native-endian on both peers of a
//! link.
//!
//! ```text
//! CCW +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |      cmd      |     flags     |           count               |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |                        data address                           |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::mem::{Address, Ram};

/// Transfer In Channel: branch to the CCW at the data address
pub const CMD_TIC: u8 = 0x08;

/// Command bit 0 set means Write-type (CSS to device)
pub fn cmd_is_write(cmd: u8) -> bool {
    cmd & 0x01 == 1
}

bitfield! {
    /// CCW flags. IDA and MIDA are reserved and unused.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CcwFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// CD: chain data
        pub cd: bool @ 7,
        /// CC: chain command
        pub cc: bool @ 6,
        /// SLI: suppress length indication
        pub sli: bool @ 5,
        /// SKP: skip/discard data
        pub skp: bool @ 4,
        /// PCI: program controlled interruption
        pub pci: bool @ 3,
        pub ida: bool @ 2,
        /// S: suspend before executing this CCW
        pub suspend: bool @ 1,
        pub mida: bool @ 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ccw {
    pub cmd: u8,
    pub flags: CcwFlags,
    pub count: u16,
    pub addr: Address,
}

impl Ccw {
    pub const SIZE: Address = 8;

    pub fn new(cmd: u8, flags: CcwFlags, count: u16, addr: Address) -> Self {
        Self {
            cmd,
            flags,
            count,
            addr,
        }
    }

    /// A TIC to `addr`
    pub fn tic(addr: Address) -> Self {
        Self {
            cmd: CMD_TIC,
            flags: CcwFlags(0),
            count: 0,
            addr,
        }
    }

    pub fn is_write(&self) -> bool {
        cmd_is_write(self.cmd)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.cmd;
        b[1] = self.flags.0;
        b[2..4].copy_from_slice(&self.count.to_ne_bytes());
        b[4..8].copy_from_slice(&self.addr.to_ne_bytes());
        b
    }

    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            cmd: b[0],
            flags: CcwFlags(b[1]),
            count: u16::from_ne_bytes([b[2], b[3]]),
            addr: Address::from_ne_bytes([b[4], b[5], b[6], b[7]]),
        }
    }

    /// Fetches the CCW at `addr`, which must be 4-byte aligned.
    pub fn fetch(ram: &Ram, addr: Address) -> Self {
        debug_assert_eq!(addr & 0x3, 0);
        let mut b = [0u8; 8];
        b.copy_from_slice(ram.read_slice(addr, 8));
        Self::from_bytes(b)
    }

    pub fn store(self, ram: &mut Ram, addr: Address) {
        debug_assert_eq!(addr & 0x3, 0);
        ram.write_slice(addr, &self.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let ccw = Ccw::new(0x03, CcwFlags(0).with_cc(true).with_sli(true), 512, 0x1234);
        assert_eq!(Ccw::from_bytes(ccw.to_bytes()), ccw);
    }

    #[test]
    fn write_type() {
        assert!(cmd_is_write(0x01));
        assert!(cmd_is_write(0x0b));
        assert!(!cmd_is_write(0x02));
        assert!(!cmd_is_write(CMD_TIC));
    }

    #[test]
    fn fetch_store() {
        let mut ram = Ram::new(64);
        let ccw = Ccw::tic(0x20);
        ccw.store(&mut ram, 8);
        assert_eq!(Ccw::fetch(&ram, 8), ccw);
    }
}
