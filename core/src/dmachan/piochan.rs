//! Clocked 1-bit lane link backend.
//!
//! Each direction is a pair of state machines shifting one data bit per
//! clock: the transmit side serialises bytes MSB-first onto a bounded bit
//! lane, the receive side reassembles them. Send completion is raised by
//! the transmit state machine itself once the programmed bit count has
//! been shifted out; receive completion comes from the destination
//! transfer as on the other backends.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use super::{
    Channel, IrqState, LinkKind, LinkTrace, RxBackend, RxChannel, TxBackend, TxChannel,
    CMDBUF_SIZE, RESET_BYTE,
};
use crate::mem::{Address, MemHandle};
use crate::trc::{records, RecordType};
use crate::types::WakerCell;

#[derive(Debug, Clone)]
pub struct PioConfig {
    /// Lane depth in bits; the shifter pends once this many bits are in
    /// flight
    pub lane_depth_bits: usize,
}

impl Default for PioConfig {
    fn default() -> Self {
        Self {
            lane_depth_bits: 64,
        }
    }
}

enum TxOp {
    Buf {
        bytes: Vec<u8>,
        bit: usize,
    },
    Data {
        addr: Address,
        count: u32,
        bit: usize,
    },
}

struct PioTx {
    lane: Sender<bool>,
    mem: MemHandle,
    op: Option<TxOp>,
    /// The current op is the reset poke; its completion is swallowed
    resetting: bool,
    complete: bool,
    peer_wake: Arc<WakerCell>,
    trace: LinkTrace,
}

impl PioTx {
    fn shift_out(&mut self) {
        let mut pushed = false;

        while let Some(op) = &mut self.op {
            let (bit, total_bits) = match op {
                TxOp::Buf { bytes, bit } => (*bit, bytes.len() * 8),
                TxOp::Data { count, bit, .. } => (*bit, *count as usize * 8),
            };

            if bit == total_bits {
                self.op = None;
                if self.resetting {
                    self.resetting = false;
                } else {
                    self.complete = true;
                }
                continue;
            }

            let byte = match op {
                TxOp::Buf { bytes, .. } => bytes[bit / 8],
                TxOp::Data { addr, .. } => {
                    self.mem.read().unwrap().read(*addr + (bit / 8) as u32)
                }
            };

            // MSB first, one data bit per clock
            let level = byte & (0x80 >> (bit % 8)) != 0;
            match self.lane.try_send(level) {
                Ok(()) => {
                    pushed = true;
                    match op {
                        TxOp::Buf { bit, .. } | TxOp::Data { bit, .. } => *bit += 1,
                    }
                }
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => break,
            }
        }

        if pushed {
            self.peer_wake.wake();
        }
    }
}

impl TxBackend for PioTx {
    fn start_src_cmdbuf(&mut self, cmd: [u8; CMDBUF_SIZE]) {
        debug_assert!(self.op.is_none());
        self.trace
            .write(RecordType::DmachanSrcCmdbuf, &records::byte(self.trace.id));
        self.op = Some(TxOp::Buf {
            bytes: cmd.to_vec(),
            bit: 0,
        });
        self.shift_out();
    }

    fn write_src_reset(&mut self) {
        debug_assert!(self.op.is_none());
        self.trace
            .write(RecordType::DmachanSrcReset, &records::byte(self.trace.id));
        self.resetting = true;
        self.op = Some(TxOp::Buf {
            bytes: vec![RESET_BYTE],
            bit: 0,
        });
        self.shift_out();
    }

    fn start_src_data(&mut self, addr: Address, count: u32) {
        debug_assert!(self.op.is_none());
        self.trace.write(
            RecordType::DmachanSrcData,
            &records::link_segment(self.trace.id, addr, count),
        );
        self.op = Some(TxOp::Data {
            addr,
            count,
            bit: 0,
        });
        self.shift_out();
    }

    fn handle_tx_irq(&mut self) -> IrqState {
        self.shift_out();
        let complete = self.complete;
        self.complete = false;
        let st = IrqState {
            raised: complete,
            forced: false,
            complete,
        };
        self.trace.write_irq(RecordType::DmachanTxIrq, st);
        st
    }

    fn set_trace(&mut self, trace: LinkTrace) {
        self.trace = trace;
    }
}

enum RxOp {
    Cmd { got: u32 },
    Reset,
    Data { addr: Address, count: u32, got: u32 },
    Discard { count: u32, got: u32 },
}

struct PioRx {
    lane: Receiver<bool>,
    mem: MemHandle,
    op: Option<RxOp>,
    cmd: [u8; CMDBUF_SIZE],
    /// Input shift register: partial byte plus bit count
    isr: u8,
    isr_bits: u8,
    complete: bool,
    peer_wake: Arc<WakerCell>,
    trace: LinkTrace,
}

impl PioRx {
    fn shift_in_byte(&mut self) -> Option<u8> {
        let mut drained = false;
        while self.isr_bits < 8 {
            match self.lane.try_recv() {
                Ok(level) => {
                    self.isr = self.isr << 1 | u8::from(level);
                    self.isr_bits += 1;
                    drained = true;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if drained {
            self.peer_wake.wake();
        }
        if self.isr_bits == 8 {
            self.isr_bits = 0;
            Some(std::mem::take(&mut self.isr))
        } else {
            None
        }
    }

    fn pump(&mut self) {
        while let Some(mut op) = self.op.take() {
            let done = match &mut op {
                RxOp::Cmd { got } => loop {
                    if *got == CMDBUF_SIZE as u32 {
                        break true;
                    }
                    match self.shift_in_byte() {
                        Some(b) => {
                            self.cmd[*got as usize] = b;
                            *got += 1;
                        }
                        None => break false,
                    }
                },
                RxOp::Reset => self.shift_in_byte().is_some(),
                RxOp::Data { addr, count, got } => loop {
                    if got == count {
                        break true;
                    }
                    match self.shift_in_byte() {
                        Some(b) => {
                            self.mem.write().unwrap().write(*addr + *got, b);
                            *got += 1;
                        }
                        None => break false,
                    }
                },
                RxOp::Discard { count, got } => loop {
                    if got == count {
                        break true;
                    }
                    match self.shift_in_byte() {
                        Some(_) => *got += 1,
                        None => break false,
                    }
                },
            };

            if !done {
                self.op = Some(op);
                break;
            }

            if matches!(op, RxOp::Reset) {
                self.op = Some(RxOp::Cmd { got: 0 });
            } else {
                self.complete = true;
            }
        }
    }
}

impl RxBackend for PioRx {
    fn start_dst_cmdbuf(&mut self) {
        debug_assert!(self.op.is_none());
        self.trace
            .write(RecordType::DmachanDstCmdbuf, &records::byte(self.trace.id));
        self.op = Some(RxOp::Cmd { got: 0 });
        self.pump();
    }

    fn start_dst_reset(&mut self) {
        debug_assert!(self.op.is_none());
        self.trace
            .write(RecordType::DmachanDstReset, &records::byte(self.trace.id));
        self.op = Some(RxOp::Reset);
        self.pump();
    }

    fn start_dst_data(&mut self, addr: Address, count: u32) {
        debug_assert!(self.op.is_none());
        self.trace.write(
            RecordType::DmachanDstData,
            &records::link_segment(self.trace.id, addr, count),
        );
        self.op = Some(RxOp::Data {
            addr,
            count,
            got: 0,
        });
        self.pump();
    }

    fn start_dst_discard(&mut self, count: u32) {
        debug_assert!(self.op.is_none());
        self.trace.write(
            RecordType::DmachanDstDiscard,
            &records::link_segment(self.trace.id, 0, count),
        );
        self.op = Some(RxOp::Discard { count, got: 0 });
        self.pump();
    }

    fn start_dst_data_src_zeroes(&mut self, addr: Address, count: u32) {
        self.trace.write(
            RecordType::DmachanDstZeroes,
            &records::link_segment(self.trace.id, addr, count),
        );
        self.mem.write().unwrap().fill(addr, count as usize, 0);
        self.complete = true;
    }

    fn handle_rx_irq(&mut self) -> IrqState {
        self.pump();
        let complete = self.complete;
        self.complete = false;
        let st = IrqState {
            raised: complete,
            forced: false,
            complete,
        };
        self.trace.write_irq(RecordType::DmachanRxIrq, st);
        st
    }

    fn cmd(&self) -> [u8; CMDBUF_SIZE] {
        self.cmd
    }

    fn set_trace(&mut self, trace: LinkTrace) {
        self.trace = trace;
    }
}

/// Builds a connected pair of PIO-style channels over two bounded bit
/// lanes.
pub fn piochan_pair(a_mem: &MemHandle, b_mem: &MemHandle, cfg: &PioConfig) -> (Channel, Channel) {
    assert!(cfg.lane_depth_bits >= 8);

    let (a2b_tx, a2b_rx) = crossbeam_channel::bounded(cfg.lane_depth_bits);
    let (b2a_tx, b2a_rx) = crossbeam_channel::bounded(cfg.lane_depth_bits);
    let wake_a = Arc::new(WakerCell::default());
    let wake_b = Arc::new(WakerCell::default());

    let mk_tx = |lane: Sender<bool>, mem: &MemHandle, peer: &Arc<WakerCell>| {
        TxChannel::new(Box::new(PioTx {
            lane,
            mem: Arc::clone(mem),
            op: None,
            resetting: false,
            complete: false,
            peer_wake: Arc::clone(peer),
            trace: LinkTrace::default(),
        }))
    };
    let mk_rx = |lane: Receiver<bool>, mem: &MemHandle, peer: &Arc<WakerCell>| {
        RxChannel::new(Box::new(PioRx {
            lane,
            mem: Arc::clone(mem),
            op: None,
            cmd: [0; CMDBUF_SIZE],
            isr: 0,
            isr_bits: 0,
            complete: false,
            peer_wake: Arc::clone(peer),
            trace: LinkTrace::default(),
        }))
    };

    let a = Channel::new(
        LinkKind::Pio,
        mk_tx(a2b_tx, a_mem, &wake_b),
        mk_rx(b2a_rx, a_mem, &wake_b),
        Arc::clone(&wake_a),
    );
    let b = Channel::new(
        LinkKind::Pio,
        mk_tx(b2a_tx, b_mem, &wake_a),
        mk_rx(a2b_rx, b_mem, &wake_a),
        wake_b,
    );

    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::new_handle;
    use crate::proto::{Chop, ChopCmd, Packet};

    #[test]
    fn cmd_over_bit_lane() {
        let am = new_handle(64);
        let bm = new_handle(64);
        let (mut a, mut b) = piochan_pair(&am, &bm, &PioConfig::default());

        b.rx.start_dst_reset();
        a.tx.write_src_reset();
        // the drain byte is swallowed on both sides
        assert!(!b.rx.handle_rx_irq().complete);
        assert!(!a.tx.handle_tx_irq().complete);

        let p = Packet::with_count(Chop::make(ChopCmd::RequestRead, 0), 7, 513);
        a.tx.set_packet(p);
        a.tx.start_src_cmdbuf();
        assert!(a.tx.handle_tx_irq().complete);
        assert!(b.rx.handle_rx_irq().complete);
        assert_eq!(b.rx.packet(), p);
    }

    #[test]
    fn data_paced_through_narrow_lane() {
        let am = new_handle(64);
        let bm = new_handle(64);
        let cfg = PioConfig {
            lane_depth_bits: 8,
        };
        let (mut a, mut b) = piochan_pair(&am, &bm, &cfg);
        am.write().unwrap().write_slice(0, b"bits");

        b.rx.start_dst_data(32, 4);
        a.tx.start_src_data(0, 4);
        let mut done = false;
        for _ in 0..64 {
            if b.rx.handle_rx_irq().complete {
                done = true;
                break;
            }
            let _ = a.tx.handle_tx_irq();
        }
        assert!(done);
        assert_eq!(bm.read().unwrap().read_slice(32, 4), b"bits");
    }
}
