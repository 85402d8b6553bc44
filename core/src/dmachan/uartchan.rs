//! Byte-lane link backend with FIFO flow control.
//!
//! Each direction is a bounded byte channel standing in for a UART with
//! hardware RTS/CTS flow control: a sender that fills the FIFO simply
//! pends and continues from its completion handler once the receiver has
//! drained room, the way DREQ pacing blocks a hardware DMA engine. Frame
//! format (8N1, parity) is a property of the physical lane and does not
//! appear at this layer.

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
pub struct UartConfig {
    /// Agreed with the peer; recorded for diagnostics only on this
    /// transport
    pub baudrate: u32,
    /// FIFO depth in bytes; the sender pends once this many bytes are in
    /// flight
    pub fifo_depth: usize,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            fifo_depth: 32,
        }
    }
}

enum TxOp {
    Cmd { bytes: [u8; CMDBUF_SIZE], sent: usize },
    Data { addr: Address, count: u32, sent: u32 },
}

struct UartTx {
    pipe: Sender<u8>,
    mem: MemHandle,
    op: Option<TxOp>,
    reset_pending: bool,
    complete: bool,
    peer_wake: Arc<WakerCell>,
    trace: LinkTrace,
}

impl UartTx {
    fn pump(&mut self) {
        let mut pushed = false;

        if self.reset_pending && self.pipe.try_send(RESET_BYTE).is_ok() {
            self.reset_pending = false;
            pushed = true;
        }

        'out: while let Some(op) = &mut self.op {
            match op {
                TxOp::Cmd { bytes, sent } => {
                    while *sent < CMDBUF_SIZE {
                        match self.pipe.try_send(bytes[*sent]) {
                            Ok(()) => {
                                *sent += 1;
                                pushed = true;
                            }
                            Err(TrySendError::Full(_)) => break 'out,
                            Err(TrySendError::Disconnected(_)) => break 'out,
                        }
                    }
                }
                TxOp::Data { addr, count, sent } => {
                    while sent < count {
                        let b = self.mem.read().unwrap().read(*addr + *sent);
                        match self.pipe.try_send(b) {
                            Ok(()) => {
                                *sent += 1;
                                pushed = true;
                            }
                            Err(TrySendError::Full(_)) => break 'out,
                            Err(TrySendError::Disconnected(_)) => break 'out,
                        }
                    }
                }
            }
            self.op = None;
            self.complete = true;
        }

        if pushed {
            self.peer_wake.wake();
        }
    }
}

impl TxBackend for UartTx {
    fn start_src_cmdbuf(&mut self, cmd: [u8; CMDBUF_SIZE]) {
        debug_assert!(self.op.is_none());
        self.trace
            .write(RecordType::DmachanSrcCmdbuf, &records::byte(self.trace.id));
        self.op = Some(TxOp::Cmd {
            bytes: cmd,
            sent: 0,
        });
        self.pump();
    }

    fn write_src_reset(&mut self) {
        self.trace
            .write(RecordType::DmachanSrcReset, &records::byte(self.trace.id));
        self.reset_pending = true;
        self.pump();
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
            sent: 0,
        });
        self.pump();
    }

    fn handle_tx_irq(&mut self) -> IrqState {
        self.pump();
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
    Cmd { got: usize },
    Reset,
    Data { addr: Address, count: u32, got: u32 },
    Discard { count: u32, got: u32 },
}

struct UartRx {
    pipe: Receiver<u8>,
    mem: MemHandle,
    op: Option<RxOp>,
    cmd: [u8; CMDBUF_SIZE],
    complete: bool,
    peer_wake: Arc<WakerCell>,
    trace: LinkTrace,
}

impl UartRx {
    fn pump(&mut self) {
        let mut drained = false;

        while let Some(op) = &mut self.op {
            let done = match op {
                RxOp::Cmd { got } => loop {
                    if *got == CMDBUF_SIZE {
                        break true;
                    }
                    match self.pipe.try_recv() {
                        Ok(b) => {
                            self.cmd[*got] = b;
                            *got += 1;
                            drained = true;
                        }
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => break false,
                    }
                },
                RxOp::Reset => match self.pipe.try_recv() {
                    Ok(_) => {
                        drained = true;
                        true
                    }
                    Err(_) => false,
                },
                RxOp::Data { addr, count, got } => loop {
                    if got == count {
                        break true;
                    }
                    match self.pipe.try_recv() {
                        Ok(b) => {
                            self.mem.write().unwrap().write(*addr + *got, b);
                            *got += 1;
                            drained = true;
                        }
                        Err(_) => break false,
                    }
                },
                RxOp::Discard { count, got } => loop {
                    if got == count {
                        break true;
                    }
                    match self.pipe.try_recv() {
                        Ok(_) => {
                            *got += 1;
                            drained = true;
                        }
                        Err(_) => break false,
                    }
                },
            };

            if !done {
                break;
            }

            if matches!(op, RxOp::Reset) {
                // Startup drain byte: swallow it and fall straight
                // through to receiving a command
                self.op = Some(RxOp::Cmd { got: 0 });
            } else {
                self.op = None;
                self.complete = true;
            }
        }

        if drained {
            // Freed FIFO room unblocks a pending peer send
            self.peer_wake.wake();
        }
    }
}

impl RxBackend for UartRx {
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

/// Builds a connected pair of UART-style channels over two bounded byte
/// lanes.
pub fn uartchan_pair(a_mem: &MemHandle, b_mem: &MemHandle, cfg: &UartConfig) -> (Channel, Channel) {
    assert!(cfg.baudrate > 0);
    assert!(cfg.fifo_depth >= CMDBUF_SIZE);

    let (a2b_tx, a2b_rx) = crossbeam_channel::bounded(cfg.fifo_depth);
    let (b2a_tx, b2a_rx) = crossbeam_channel::bounded(cfg.fifo_depth);
    let wake_a = Arc::new(WakerCell::default());
    let wake_b = Arc::new(WakerCell::default());

    let mk_tx = |pipe: Sender<u8>, mem: &MemHandle, peer: &Arc<WakerCell>| {
        TxChannel::new(Box::new(UartTx {
            pipe,
            mem: Arc::clone(mem),
            op: None,
            reset_pending: false,
            complete: false,
            peer_wake: Arc::clone(peer),
            trace: LinkTrace::default(),
        }))
    };
    let mk_rx = |pipe: Receiver<u8>, mem: &MemHandle, peer: &Arc<WakerCell>| {
        RxChannel::new(Box::new(UartRx {
            pipe,
            mem: Arc::clone(mem),
            op: None,
            cmd: [0; CMDBUF_SIZE],
            complete: false,
            peer_wake: Arc::clone(peer),
            trace: LinkTrace::default(),
        }))
    };

    let a = Channel::new(
        LinkKind::Uart,
        mk_tx(a2b_tx, a_mem, &wake_b),
        mk_rx(b2a_rx, a_mem, &wake_b),
        Arc::clone(&wake_a),
    );
    let b = Channel::new(
        LinkKind::Uart,
        mk_tx(b2a_tx, b_mem, &wake_a),
        mk_rx(a2b_rx, b_mem, &wake_a),
        wake_b,
    );

    (a, b)
}
