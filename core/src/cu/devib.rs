//! The Device Information Block: per-device state on a control unit.
//!
//! ```text
//! DEVIB  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |     next      |    cbindex    |          size                 |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |       op      |     flags     |         payload               |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |                          bufaddr                              |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |                            sense                              |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::bsize;
use crate::mem::Address;
use crate::proto::{Chop, ChopCmd, CHOP_FLAG_SKIP};
use crate::status::{DevStatus, Sense};
use crate::types::{CbIndex, UnitAddr};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DevibFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// A Start has been accepted and the channel program is running
        pub started: bool @ 7,
        /// The running CCW is Write-type (data flows CSS to device)
        pub cmd_write: bool @ 6,
        /// A data burst is expected into `addr`
        pub rx_data_required: bool @ 5,
        /// Callback the device when a command-only send completes
        pub tx_callback: bool @ 4,
        pub traced: bool @ 3,
        /// The CSS asked to stop the in-flight program; observed at every
        /// callback re-entry
        pub stopping: bool @ 2,
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Devib {
    /// Tx-queue link; equal to the own unit address when not queued
    pub(crate) next: UnitAddr,
    /// Callback invoked for this device's events
    pub cbindex: CbIndex,
    /// CSS-announced window for the current CCW segment
    pub size: u16,
    /// The pending (or last received) channel operation
    pub(crate) op: Chop,
    pub(crate) flags: DevibFlags,
    pub(crate) payload: [u8; 2],
    /// Source/destination of the next data transfer
    pub(crate) addr: Address,
    /// Error detail accompanying UNIT_CHECK status
    pub sense: Sense,
}

impl Devib {
    pub(crate) fn new(ua: UnitAddr) -> Self {
        Self {
            next: ua,
            ..Self::default()
        }
    }

    pub fn is_started(&self) -> bool {
        self.flags.started()
    }

    pub fn is_cmd_write(&self) -> bool {
        self.flags.cmd_write()
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.stopping()
    }

    pub fn is_traced(&self) -> bool {
        self.flags.traced()
    }

    /// The pending (or last received) channel operation byte
    pub fn op(&self) -> Chop {
        self.op
    }

    /// The two payload bytes of the last received operation
    pub fn payload(&self) -> (u8, u8) {
        (self.payload[0], self.payload[1])
    }

    /// The CCW command delivered by the Start operation
    pub fn ccw_cmd(&self) -> u8 {
        self.payload[0]
    }

    /// Parses the payload as a big-endian count
    pub fn payload_count(&self) -> u16 {
        u16::from_be_bytes(self.payload)
    }

    //
    // Low-level preparation of outbound operations. Device authors
    // normally use the higher-level Cu::dev_* API instead.
    //

    pub(crate) fn prepare_count(&mut self, count: u16) {
        self.payload = count.to_be_bytes();
    }

    /// Prepares a Data operation sending `n` bytes from `srcaddr`.
    pub(crate) fn prepare_write_data(&mut self, srcaddr: Address, n: u16, flags: u8) {
        debug_assert!(self.is_started());
        self.prepare_count(n);
        self.op = Chop::make(ChopCmd::Data, flags);
        self.addr = srcaddr;
    }

    /// Prepares a Data+Skip operation: the CSS materialises `n` zero
    /// bytes locally and no data travels the link.
    pub(crate) fn prepare_write_zeroes(&mut self, n: u16, flags: u8) {
        debug_assert!(self.is_started());
        self.prepare_count(n);
        self.op = Chop::make(ChopCmd::Data, CHOP_FLAG_SKIP | flags);
    }

    /// Prepares a RequestRead asking the CSS for `size` bytes into
    /// `dstaddr`.
    pub(crate) fn prepare_read_data(&mut self, dstaddr: Address, size: u16) {
        debug_assert!(self.is_started());
        self.prepare_count(size);
        self.op = Chop::make(ChopCmd::RequestRead, 0);
        self.flags.set_rx_data_required(true);
        self.addr = dstaddr;
    }

    /// Prepares an UpdateStatus. For an unsolicited status or an
    /// end-of-program status, `(dstaddr, size)` advertise the window the
    /// next Write-type Start may immediately send into; the window that
    /// reaches the CSS is the bsize encoding of `size`, so the usable
    /// amount may round down.
    pub(crate) fn prepare_update_status(&mut self, devs: DevStatus, dstaddr: Address, size: u16) {
        debug_assert_eq!(self.is_started(), devs.channel_end());

        let mut esize = bsize::BSIZE_ZERO;
        if devs.device_end() || !devs.channel_end() {
            esize = bsize::encode(size);
            self.addr = dstaddr;
            self.size = size;
        }

        self.op = Chop::make(ChopCmd::UpdateStatus, 0);
        self.payload = [devs.0, esize.raw()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_write_data_sets_fields() {
        let mut d = Devib::new(3);
        d.flags.set_started(true);
        d.prepare_write_data(0x100, 300, 0);
        assert_eq!(d.op.command(), Some(ChopCmd::Data));
        assert_eq!(d.payload_count(), 300);
        assert_eq!(d.addr, 0x100);
    }

    #[test]
    fn prepare_update_status_advertises_window() {
        let mut d = Devib::new(0);
        d.flags.set_started(true);
        d.prepare_update_status(DevStatus::end_ok(), 0x200, 64);
        let (devs, esize) = d.payload();
        assert_eq!(devs, 0x0c);
        assert_eq!(crate::bsize::Bsize::from_raw(esize).decode(), 64);
        assert_eq!(d.size, 64);
    }

    #[test]
    fn intermediate_status_has_no_window() {
        let mut d = Devib::new(0);
        d.flags.set_started(true);
        d.prepare_update_status(DevStatus(0).with_channel_end(true), 0x200, 64);
        assert_eq!(d.payload(), (0x08, 0));
    }
}
