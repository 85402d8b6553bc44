//! The link transport between a CSS channel path and a CU.
//!
//! A link moves 4-byte command packets and variable-length data payloads
//! in each direction. Three interchangeable backends present one
//! interface: a shared-memory channel for two reactors on one machine
//! ([`memchan`]), a byte lane with FIFO flow control ([`uartchan`]) and a
//! clocked 1-bit lane ([`piochan`]).
//!
//! Every operation completes asynchronously: the backend latches a
//! completion which the owning reactor consumes via `handle_tx_irq` /
//! `handle_rx_irq`, each returning an [`IrqState`] triplet. The `forced`
//! bit distinguishes the memory backend's software doorbell from an
//! ordinary transfer completion.

pub mod memchan;
pub mod piochan;
pub mod uartchan;

use serde::{Deserialize, Serialize};

use crate::mem::Address;
use crate::proto::Packet;
use crate::trc::{RecordType, Tracer};
use crate::types::WakerCell;
use std::sync::Arc;

pub use memchan::memchan_pair;
pub use piochan::{piochan_pair, PioConfig};
pub use uartchan::{uartchan_pair, UartConfig};

pub const CMDBUF_SIZE: usize = 4;

/// Sent outside any packet framing to drain a peer's rx pipeline.
/// The value is conventional; correctness only needs both peers to agree.
pub const RESET_BYTE: u8 = 0x5a;

/// Result of consuming a link completion interrupt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqState {
    /// An interrupt event was pending
    pub raised: bool,
    /// The event was a software doorbell rather than a transfer completion
    pub forced: bool,
    /// An operation finished
    pub complete: bool,
}

impl IrqState {
    pub(crate) fn as_byte(self) -> u8 {
        u8::from(self.raised) | u8::from(self.forced) << 1 | u8::from(self.complete) << 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum LinkKind {
    Mem,
    Uart,
    Pio,
}

/// Trace context threaded into each backend so link-level trace points can
/// be gated per channel path / CU.
#[derive(Clone, Default)]
pub struct LinkTrace {
    tracer: Option<Tracer>,
    pub id: u8,
}

impl LinkTrace {
    pub fn write(&self, rt: RecordType, data: &[u8]) {
        if let Some(t) = &self.tracer {
            t.write(rt, data);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tracer.as_ref().is_some_and(Tracer::enabled)
    }

    pub(crate) fn write_irq(&self, rt: RecordType, st: IrqState) {
        if st.raised {
            self.write(rt, &crate::trc::records::id_byte(self.id, st.as_byte()));
        }
    }
}

pub trait TxBackend: Send {
    /// Sends a 4-byte command packet.
    fn start_src_cmdbuf(&mut self, cmd: [u8; CMDBUF_SIZE]);

    /// Pokes the reset byte into the tx path outside packet framing.
    fn write_src_reset(&mut self);

    /// Streams `count` bytes from `addr` in this side's storage.
    fn start_src_data(&mut self, addr: Address, count: u32);

    /// Consumes any pending completion; also continues paced transfers.
    fn handle_tx_irq(&mut self) -> IrqState;

    fn set_trace(&mut self, trace: LinkTrace);
}

pub trait RxBackend: Send {
    /// Readies reception of exactly 4 bytes into the command buffer.
    fn start_dst_cmdbuf(&mut self);

    /// Readies reception of a single reset byte, swallowed on arrival
    /// (reception then re-arms for a command).
    fn start_dst_reset(&mut self);

    /// Readies reception of `count` bytes into `addr` of this side's
    /// storage.
    fn start_dst_data(&mut self, addr: Address, count: u32);

    /// Accepts and drops `count` bytes.
    fn start_dst_discard(&mut self, count: u32);

    /// Writes `count` zero bytes at `addr` locally without touching the
    /// link (receiver-side Skip optimisation).
    fn start_dst_data_src_zeroes(&mut self, addr: Address, count: u32);

    /// Consumes any pending completion; also continues paced transfers.
    fn handle_rx_irq(&mut self) -> IrqState;

    /// The last received command packet bytes.
    fn cmd(&self) -> [u8; CMDBUF_SIZE];

    fn set_trace(&mut self, trace: LinkTrace);
}

/// Transmit half of a link as owned by a channel path or CU
pub struct TxChannel {
    /// Command packet staged for the next `start_src_cmdbuf`
    pub cmd: [u8; CMDBUF_SIZE],
    backend: Box<dyn TxBackend>,
}

impl TxChannel {
    pub fn new(backend: Box<dyn TxBackend>) -> Self {
        Self {
            cmd: [0; CMDBUF_SIZE],
            backend,
        }
    }

    pub fn set_packet(&mut self, p: Packet) {
        self.cmd = p.to_bytes();
    }

    pub fn packet(&self) -> Packet {
        Packet::from_bytes(self.cmd)
    }

    pub fn start_src_cmdbuf(&mut self) {
        self.backend.start_src_cmdbuf(self.cmd);
    }

    pub fn write_src_reset(&mut self) {
        self.backend.write_src_reset();
    }

    pub fn start_src_data(&mut self, addr: Address, count: u32) {
        self.backend.start_src_data(addr, count);
    }

    pub fn handle_tx_irq(&mut self) -> IrqState {
        self.backend.handle_tx_irq()
    }

    pub fn set_trace(&mut self, trace: LinkTrace) {
        self.backend.set_trace(trace);
    }
}

/// Receive half of a link as owned by a channel path or CU
pub struct RxChannel {
    backend: Box<dyn RxBackend>,
}

impl RxChannel {
    pub fn new(backend: Box<dyn RxBackend>) -> Self {
        Self { backend }
    }

    pub fn packet(&self) -> Packet {
        Packet::from_bytes(self.backend.cmd())
    }

    pub fn start_dst_cmdbuf(&mut self) {
        self.backend.start_dst_cmdbuf();
    }

    pub fn start_dst_reset(&mut self) {
        self.backend.start_dst_reset();
    }

    pub fn start_dst_data(&mut self, addr: Address, count: u32) {
        self.backend.start_dst_data(addr, count);
    }

    pub fn start_dst_discard(&mut self, count: u32) {
        self.backend.start_dst_discard(count);
    }

    pub fn start_dst_data_src_zeroes(&mut self, addr: Address, count: u32) {
        self.backend.start_dst_data_src_zeroes(addr, count);
    }

    pub fn handle_rx_irq(&mut self) -> IrqState {
        self.backend.handle_rx_irq()
    }

    pub fn set_trace(&mut self, trace: LinkTrace) {
        self.backend.set_trace(trace);
    }
}

/// One side of a configured point-to-point link
pub struct Channel {
    pub kind: LinkKind,
    pub tx: TxChannel,
    pub rx: RxChannel,
    waker_cell: Arc<WakerCell>,
}

impl Channel {
    pub fn new(
        kind: LinkKind,
        tx: TxChannel,
        rx: RxChannel,
        waker_cell: Arc<WakerCell>,
    ) -> Self {
        Self {
            kind,
            tx,
            rx,
            waker_cell,
        }
    }

    /// The cell a reactor registers its waker in so link peers can wake
    /// it cross-thread.
    pub fn waker_cell(&self) -> &Arc<WakerCell> {
        &self.waker_cell
    }

    /// Wires trace output for both halves. `id` distinguishes this link
    /// in the records.
    pub fn set_trace(&mut self, tracer: Option<Tracer>, id: u8) {
        self.tx.set_trace(LinkTrace {
            tracer: tracer.clone(),
            id,
        });
        self.rx.set_trace(LinkTrace { tracer, id });
    }
}
