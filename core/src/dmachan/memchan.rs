//! Memory-to-memory link backend for two reactors on one machine.
//!
//! Both peers of a direction share a state pair protected by one lock per
//! link. A transfer is completed by whichever side arrives second: the
//! first side advances its state and waits; the second performs the copy,
//! flips both states back towards Idle and posts a forced doorbell to the
//! peer so its reactor notices. This mirrors a pair of CPU cores sharing
//! SRAM with a single hardware spinlock.

use std::sync::{Arc, Mutex};

use log::*;

use super::{
    Channel, IrqState, LinkKind, LinkTrace, RxBackend, RxChannel, TxBackend, TxChannel,
    CMDBUF_SIZE,
};
use crate::mem::{self, Address, MemHandle};
use crate::trc::{records, RecordType};
use crate::types::WakerCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
enum SrcState {
    Idle,
    CmdBuf,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
enum DstState {
    Idle,
    CmdBuf,
    Data,
    Discard,
    SrcZeroes,
}

#[derive(Debug, Default, Clone, Copy)]
struct IrqPend {
    complete: bool,
    forced: bool,
}

impl IrqPend {
    fn take(&mut self) -> IrqState {
        let st = IrqState {
            raised: self.complete || self.forced,
            forced: self.forced,
            complete: self.complete,
        };
        *self = Self::default();
        st
    }
}

/// State of one direction (src endpoint -> dst endpoint)
struct MemDir {
    src_state: SrcState,
    dst_state: DstState,
    /// Command staged by a first-arriving src
    src_cmd: [u8; CMDBUF_SIZE],
    /// Command as delivered to the dst side
    rx_cmd: [u8; CMDBUF_SIZE],
    /// Data segment staged by a first-arriving src
    src_data: (Address, u32),
    /// Data destination staged by a first-arriving dst
    dst_data: (Address, u32),
    src_pend: IrqPend,
    dst_pend: IrqPend,
}

impl MemDir {
    fn new() -> Self {
        Self {
            src_state: SrcState::Idle,
            dst_state: DstState::Idle,
            src_cmd: [0; CMDBUF_SIZE],
            rx_cmd: [0; CMDBUF_SIZE],
            src_data: (0, 0),
            dst_data: (0, 0),
            src_pend: IrqPend::default(),
            dst_pend: IrqPend::default(),
        }
    }
}

/// Both directions of a link behind the single peer lock
struct MemShared {
    dirs: Mutex<[MemDir; 2]>,
}

struct MemTx {
    shared: Arc<MemShared>,
    dir: usize,
    mem: MemHandle,
    peer_mem: MemHandle,
    own_wake: Arc<WakerCell>,
    peer_wake: Arc<WakerCell>,
    trace: LinkTrace,
}

struct MemRx {
    shared: Arc<MemShared>,
    dir: usize,
    mem: MemHandle,
    peer_mem: MemHandle,
    own_wake: Arc<WakerCell>,
    peer_wake: Arc<WakerCell>,
    trace: LinkTrace,
}

impl TxBackend for MemTx {
    fn start_src_cmdbuf(&mut self, cmd: [u8; CMDBUF_SIZE]) {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        debug_assert_eq!(d.src_state, SrcState::Idle);
        self.trace.write(
            RecordType::DmachanSrcCmdbufMem,
            &records::id_byte(self.trace.id, d.dst_state as u8),
        );

        match d.dst_state {
            DstState::Idle => {
                d.src_state = SrcState::CmdBuf;
                d.src_cmd = cmd;
            }
            DstState::CmdBuf => {
                d.rx_cmd = cmd;
                d.dst_state = DstState::Idle;
                d.src_pend.complete = true;
                d.dst_pend.complete = true;
                d.dst_pend.forced = true;
                drop(dirs);
                self.own_wake.wake();
                self.peer_wake.wake();
            }
            _ => panic!("memchan src cmdbuf: unexpected dst state {:?}", d.dst_state),
        }
    }

    fn write_src_reset(&mut self) {
        // The memory backend has no byte pipeline to drain
        self.trace
            .write(RecordType::DmachanSrcReset, &records::byte(self.trace.id));
    }

    fn start_src_data(&mut self, addr: Address, count: u32) {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        debug_assert_eq!(d.src_state, SrcState::Idle);
        self.trace.write(
            RecordType::DmachanSrcDataMem,
            &records::link_segment(self.trace.id, addr, count),
        );

        match d.dst_state {
            DstState::Idle | DstState::CmdBuf => {
                // CmdBuf can happen if the peer has armed for a command
                // while our Data chop is still in its rx handling
                d.src_state = SrcState::Data;
                d.src_data = (addr, count);
            }
            DstState::Data => {
                let (dst_addr, dst_count) = d.dst_data;
                assert_eq!(dst_count, count, "memchan data length mismatch");
                mem::copy_between(&self.mem, addr, &self.peer_mem, dst_addr, count as usize);
                d.dst_state = DstState::Idle;
                d.src_pend.complete = true;
                d.dst_pend.complete = true;
                d.dst_pend.forced = true;
                drop(dirs);
                self.own_wake.wake();
                self.peer_wake.wake();
            }
            DstState::Discard => {
                d.dst_state = DstState::Idle;
                d.src_pend.complete = true;
                d.dst_pend.complete = true;
                d.dst_pend.forced = true;
                drop(dirs);
                self.own_wake.wake();
                self.peer_wake.wake();
            }
            DstState::SrcZeroes => {
                panic!("memchan src data: unexpected dst state SrcZeroes")
            }
        }
    }

    fn handle_tx_irq(&mut self) -> IrqState {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        let st = d.src_pend.take();
        if st.complete {
            d.src_state = SrcState::Idle;
        }
        drop(dirs);
        self.trace.write_irq(RecordType::DmachanTxIrq, st);
        st
    }

    fn set_trace(&mut self, trace: LinkTrace) {
        self.trace = trace;
    }
}

impl RxBackend for MemRx {
    fn start_dst_cmdbuf(&mut self) {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        debug_assert_eq!(d.dst_state, DstState::Idle);
        self.trace.write(
            RecordType::DmachanDstCmdbufMem,
            &records::id_byte(self.trace.id, d.src_state as u8),
        );

        match d.src_state {
            SrcState::Idle | SrcState::Data => {
                d.dst_state = DstState::CmdBuf;
            }
            SrcState::CmdBuf => {
                d.rx_cmd = d.src_cmd;
                d.src_state = SrcState::Idle;
                d.dst_pend.complete = true;
                d.src_pend.complete = true;
                d.src_pend.forced = true;
                drop(dirs);
                self.own_wake.wake();
                self.peer_wake.wake();
            }
        }
    }

    fn start_dst_reset(&mut self) {
        // No reset byte ever travels a memory link; go straight to
        // receiving a command
        self.trace
            .write(RecordType::DmachanDstReset, &records::byte(self.trace.id));
        self.start_dst_cmdbuf();
    }

    fn start_dst_data(&mut self, addr: Address, count: u32) {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        debug_assert_eq!(d.dst_state, DstState::Idle);
        self.trace.write(
            RecordType::DmachanDstDataMem,
            &records::link_segment(self.trace.id, addr, count),
        );

        match d.src_state {
            SrcState::Idle | SrcState::CmdBuf => {
                // CmdBuf can happen if the peer has sent its Data command
                // but not yet reached its tx completion handling
                d.dst_state = DstState::Data;
                d.dst_data = (addr, count);
            }
            SrcState::Data => {
                let (src_addr, src_count) = d.src_data;
                assert_eq!(src_count, count, "memchan data length mismatch");
                mem::copy_between(&self.peer_mem, src_addr, &self.mem, addr, count as usize);
                d.src_state = SrcState::Idle;
                d.dst_pend.complete = true;
                d.src_pend.complete = true;
                d.src_pend.forced = true;
                drop(dirs);
                self.own_wake.wake();
                self.peer_wake.wake();
            }
        }
    }

    fn start_dst_discard(&mut self, count: u32) {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        debug_assert_eq!(d.dst_state, DstState::Idle);
        self.trace.write(
            RecordType::DmachanDstDiscardMem,
            &records::link_segment(self.trace.id, 0, count),
        );

        match d.src_state {
            SrcState::Idle => {
                d.dst_state = DstState::Discard;
            }
            SrcState::Data => {
                // Bypass any copy, both sides go idle
                d.src_state = SrcState::Idle;
                d.dst_pend.complete = true;
                d.src_pend.complete = true;
                d.src_pend.forced = true;
                drop(dirs);
                self.own_wake.wake();
                self.peer_wake.wake();
            }
            SrcState::CmdBuf => {
                panic!("memchan dst discard: unexpected src state CmdBuf")
            }
        }
    }

    fn start_dst_data_src_zeroes(&mut self, addr: Address, count: u32) {
        {
            let mut dirs = self.shared.dirs.lock().unwrap();
            let d = &mut dirs[self.dir];
            debug_assert_eq!(d.dst_state, DstState::Idle);
            d.dst_state = DstState::SrcZeroes;
            d.dst_pend.complete = true;
        }
        self.trace.write(
            RecordType::DmachanDstZeroesMem,
            &records::link_segment(self.trace.id, addr, count),
        );
        self.mem.write().unwrap().fill(addr, count as usize, 0);
        self.own_wake.wake();
    }

    fn handle_rx_irq(&mut self) -> IrqState {
        let mut dirs = self.shared.dirs.lock().unwrap();
        let d = &mut dirs[self.dir];
        let st = d.dst_pend.take();
        if st.complete && d.dst_state == DstState::SrcZeroes {
            d.dst_state = DstState::Idle;
        }
        drop(dirs);
        self.trace.write_irq(RecordType::DmachanRxIrq, st);
        st
    }

    fn cmd(&self) -> [u8; CMDBUF_SIZE] {
        self.shared.dirs.lock().unwrap()[self.dir].rx_cmd
    }

    fn set_trace(&mut self, trace: LinkTrace) {
        self.trace = trace;
    }
}

/// Builds a connected pair of memory channels. `a_mem`/`b_mem` are the
/// storages the respective sides resolve addresses against; they may be
/// clones of one handle when both reactors share one address space.
pub fn memchan_pair(a_mem: &MemHandle, b_mem: &MemHandle) -> (Channel, Channel) {
    let shared = Arc::new(MemShared {
        dirs: Mutex::new([MemDir::new(), MemDir::new()]),
    });
    let wake_a = Arc::new(WakerCell::default());
    let wake_b = Arc::new(WakerCell::default());

    debug!("memchan pair created");

    // Direction 0: a -> b, direction 1: b -> a
    let a = Channel::new(
        LinkKind::Mem,
        TxChannel::new(Box::new(MemTx {
            shared: Arc::clone(&shared),
            dir: 0,
            mem: Arc::clone(a_mem),
            peer_mem: Arc::clone(b_mem),
            own_wake: Arc::clone(&wake_a),
            peer_wake: Arc::clone(&wake_b),
            trace: LinkTrace::default(),
        })),
        RxChannel::new(Box::new(MemRx {
            shared: Arc::clone(&shared),
            dir: 1,
            mem: Arc::clone(a_mem),
            peer_mem: Arc::clone(b_mem),
            own_wake: Arc::clone(&wake_a),
            peer_wake: Arc::clone(&wake_b),
            trace: LinkTrace::default(),
        })),
        Arc::clone(&wake_a),
    );
    let b = Channel::new(
        LinkKind::Mem,
        TxChannel::new(Box::new(MemTx {
            shared: Arc::clone(&shared),
            dir: 1,
            mem: Arc::clone(b_mem),
            peer_mem: Arc::clone(a_mem),
            own_wake: Arc::clone(&wake_b),
            peer_wake: Arc::clone(&wake_a),
            trace: LinkTrace::default(),
        })),
        RxChannel::new(Box::new(MemRx {
            shared: Arc::clone(&shared),
            dir: 0,
            mem: Arc::clone(b_mem),
            peer_mem: Arc::clone(a_mem),
            own_wake: Arc::clone(&wake_b),
            peer_wake: Arc::clone(&wake_a),
            trace: LinkTrace::default(),
        })),
        wake_b,
    );

    (a, b)
}
