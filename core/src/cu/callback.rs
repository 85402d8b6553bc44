//! The device callback table.
//!
//! Devices are dispatched through an index into a table of callbacks,
//! one byte per devib. Index 0 is the default reject handler and index
//! 255 the no-op sentinel; every slot is write-once.

use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use log::*;

use super::Cu;
use crate::proto::ChopCmd;
use crate::status::{sense_code, Sense, SenseFlags};
use crate::trc::{records, RecordType};
use crate::types::{CbIndex, UnitAddr};

pub const CALLBACK_DEFAULT: CbIndex = 0;
pub const CALLBACK_NOOP: CbIndex = 255;

/// Size of the callback table; indices above it are handled internally.
pub const NUM_DEVIB_CALLBACKS: usize = 16;

/// A device callback. Receives the owning CU so it can drive the device
/// API; runs on the CU reactor and must complete promptly, finishing I/O
/// through further callbacks.
pub type DevCallback = Arc<dyn Fn(&mut Cu, UnitAddr) + Send + Sync>;

pub struct CallbackTable {
    slots: [OnceLock<DevCallback>; NUM_DEVIB_CALLBACKS],
}

impl CallbackTable {
    /// A fresh table with the default reject handler at index 0.
    pub fn new() -> Arc<Self> {
        let table = Self {
            slots: [const { OnceLock::new() }; NUM_DEVIB_CALLBACKS],
        };
        table.slots[CALLBACK_DEFAULT as usize]
            .set(Arc::new(default_devib_callback))
            .ok();
        Arc::new(table)
    }

    /// Registers a callback at a specific index; each index can only be
    /// registered once.
    pub fn register(&self, n: CbIndex, cb: DevCallback) -> Result<()> {
        if n as usize >= NUM_DEVIB_CALLBACKS {
            bail!("callback index {n} out of range");
        }
        if self.slots[n as usize].set(cb).is_err() {
            bail!("callback index {n} already registered");
        }
        Ok(())
    }

    /// Registers a callback at the first unused index.
    pub fn register_unused(&self, cb: DevCallback) -> Result<CbIndex> {
        for (n, slot) in self.slots.iter().enumerate() {
            if slot.set(Arc::clone(&cb)).is_ok() {
                return Ok(n as CbIndex);
            }
        }
        bail!("no more room in the device callback table");
    }

    pub fn is_callable(&self, n: CbIndex) -> bool {
        if n == CALLBACK_NOOP {
            return true;
        }
        (n as usize) < NUM_DEVIB_CALLBACKS && self.slots[n as usize].get().is_some()
    }

    fn get(&self, n: CbIndex) -> Option<DevCallback> {
        self.slots.get(n as usize)?.get().cloned()
    }
}

/// Rejects whatever arrived: a Start gets COMMAND_REJECT for an invalid
/// device, anything else a protocol-error sense carrying the offending
/// chop byte and payload.
pub fn default_devib_callback(cu: &mut Cu, ua: UnitAddr) {
    let devib = cu.devib(ua);
    let op = devib.op();
    let (p0, p1) = devib.payload();
    let started = devib.is_started();

    let sense = match op.command() {
        Some(ChopCmd::Start) => Sense::reject(sense_code::INVALID_DEVICE),
        _ => Sense {
            flags: SenseFlags(0).with_proto_error(true),
            code: op.0,
            asc: p0,
            ascq: p1,
        },
    };

    let r = if started {
        cu.dev_update_status_error(ua, sense)
    } else {
        // never started: only an unsolicited status can carry the check
        cu.devib_mut(ua).sense = sense;
        cu.dev_update_status(ua, crate::status::DevStatus(0).with_unit_check(true))
    };
    if let Err(e) = r {
        error!("default callback could not reject ua {ua}: {e}");
    }
}

/// Dispatches a device event through the callback table.
pub(crate) fn callback_devib(cu: &mut Cu, ua: UnitAddr) {
    let devib = cu.devib(ua);
    let cbindex = devib.cbindex;
    if cbindex == CALLBACK_NOOP {
        return;
    }

    cu.tracer().write_cond(
        cu.is_traced() || devib.is_traced(),
        RecordType::CusDevCallback,
        &records::dev_byte(cu.cuaddr(), ua, cbindex),
    );

    let table = cu.callbacks();
    let cb = table
        .get(cbindex)
        .unwrap_or_else(|| table.get(CALLBACK_DEFAULT).unwrap());
    cb(cu, ua);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn slots_are_write_once() {
        let t = CallbackTable::new();
        assert!(t.register(CALLBACK_DEFAULT, Arc::new(|_: &mut Cu, _| ())).is_err());
        assert!(t.register(1, Arc::new(|_: &mut Cu, _| ())).is_ok());
        assert!(t.register(1, Arc::new(|_: &mut Cu, _| ())).is_err());
        assert!(t.is_callable(1));
        assert!(t.is_callable(CALLBACK_NOOP));
        assert!(!t.is_callable(2));
    }

    #[test]
    fn register_unused_finds_free_slots() {
        let t = CallbackTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let n = t
            .register_unused(Arc::new(move |_: &mut Cu, _| {
                h.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        assert_eq!(n, 1); // 0 holds the default handler
        let m = t.register_unused(Arc::new(|_: &mut Cu, _| ())).unwrap();
        assert_eq!(m, 2);
    }
}
