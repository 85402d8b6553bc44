use std::sync::Mutex;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Subchannel id, unique within a CSS
pub type Sid = u16;

/// Channel path id on the CSS side
pub type Chpid = u8;

/// Control unit address on the device side
pub type CuAddr = u8;

/// Unit address of a device on a control unit
pub type UnitAddr = u8;

/// Index into a control unit's device callback table
pub type CbIndex = u8;

/// A 2-bit condition code returned by the subchannel API.
///
/// The exact meaning of each value is operation-specific (see the
/// individual methods); 0 is always "performed as requested".
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
#[must_use]
#[repr(u8)]
pub enum CondCode {
    Ok = 0,
    StatusPending = 1,
    Busy = 2,
    NotOperational = 3,
}

impl CondCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A self-clearing latch for events etc.
#[derive(Debug, Default)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }
}

/// Communication channel (sender) used to wake a parked reactor
pub type Waker = crossbeam_channel::Sender<()>;

/// A registration slot for a reactor waker that link peers can ping from
/// another thread. Wakes before registration are dropped; wakes coalesce.
#[derive(Default)]
pub struct WakerCell(Mutex<Option<Waker>>);

impl WakerCell {
    pub fn register(&self, w: Waker) {
        *self.0.lock().unwrap() = Some(w);
    }

    pub fn wake(&self) {
        if let Some(w) = self.0.lock().unwrap().as_ref() {
            // A full channel already holds a pending wake
            let _ = w.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latching_event() {
        let mut e = LatchingEvent::default();
        assert!(!e.get_clear());
        e.set();
        e.set();
        assert!(e.get_clear());
        assert!(!e.get_clear());
    }

    #[test]
    fn waker_cell_coalesces() {
        let cell = WakerCell::default();
        cell.wake(); // no registration yet, dropped

        let (tx, rx) = crossbeam_channel::bounded(1);
        cell.register(tx);
        cell.wake();
        cell.wake();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
