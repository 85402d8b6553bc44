//! The two-step "send command, then send data" sequencer.
//!
//! Both the CSS and the CU transmit a 4-byte command packet first and
//! optionally stream trailing data. Callers stash the data segment with
//! [`Txsm::set_pending`] before transmitting the command; the
//! tx-completion handler then calls [`Txsm::run`], which either reports
//! `Finished` straight away (command-only send) or launches the data
//! transfer and reports `Finished` on its completion.

use serde::{Deserialize, Serialize};

use crate::dmachan::TxChannel;
use crate::mem::Address;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::IntoStaticStr,
)]
pub enum TxsmState {
    #[default]
    Idle,
    Pending,
    Sending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxsmRun {
    Noop,
    /// Launched the pending data transfer; not finished yet
    Acted,
    /// The whole command (and any trailing data) has been sent
    Finished,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Txsm {
    state: TxsmState,
    addr: Address,
    count: u16,
}

impl Txsm {
    pub fn state(&self) -> TxsmState {
        self.state
    }

    pub fn busy(&self) -> bool {
        self.state != TxsmState::Idle
    }

    /// Resets to Idle without touching the stashed segment.
    pub fn reset(&mut self) {
        self.state = TxsmState::Idle;
    }

    /// Stashes `(addr, count)` and moves Idle -> Pending.
    pub fn set_pending(&mut self, addr: Address, count: u16) {
        debug_assert_eq!(self.state, TxsmState::Idle);
        self.state = TxsmState::Pending;
        self.addr = addr;
        self.count = count;
    }

    /// Advances the sequencer on a tx completion.
    pub fn run(&mut self, tx: &mut TxChannel) -> TxsmRun {
        match self.state {
            TxsmState::Sending => {
                self.state = TxsmState::Idle;
                TxsmRun::Finished
            }
            TxsmState::Pending => {
                self.state = TxsmState::Sending;
                tx.start_src_data(self.addr, u32::from(self.count));
                TxsmRun::Acted
            }
            TxsmState::Idle => TxsmRun::Noop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmachan::memchan_pair;
    use crate::mem::new_handle;

    #[test]
    fn command_only_sequence() {
        let mut sm = Txsm::default();
        let am = new_handle(16);
        let bm = new_handle(16);
        let (mut a, _b) = memchan_pair(&am, &bm);
        assert_eq!(sm.run(&mut a.tx), TxsmRun::Noop);
        assert!(!sm.busy());
    }

    #[test]
    fn command_with_data_sequence() {
        let mut sm = Txsm::default();
        let am = new_handle(16);
        let bm = new_handle(16);
        let (mut a, mut b) = memchan_pair(&am, &bm);
        am.write().unwrap().write_slice(0, b"abc");

        sm.set_pending(0, 3);
        assert!(sm.busy());

        // First completion (the command): launches the data
        b.rx.start_dst_data(4, 3);
        assert_eq!(sm.run(&mut a.tx), TxsmRun::Acted);
        assert!(b.rx.handle_rx_irq().complete);
        assert_eq!(bm.read().unwrap().read_slice(4, 3), b"abc");

        // Second completion (the data): finished
        assert_eq!(sm.run(&mut a.tx), TxsmRun::Finished);
        assert!(!sm.busy());
    }
}
