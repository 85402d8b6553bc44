//! Binary trace ring shared by all components.
//!
//! A bufferset is a ring of fixed-size buffers holding variable-length
//! records. Each record starts with an 8-byte header (48-bit microsecond
//! timestamp, total size, record type) followed by its data bytes, padded
//! to a 4-byte boundary. When a record does not fit the current buffer the
//! set switches to the next buffer in the ring and optionally pings a
//! registered waker so the previous buffer can be drained before the ring
//! wraps back over it.
//!
//! Consumers pass a cloned [`Tracer`] handle through every trace point;
//! the enable flag makes disabled tracing nearly free.

pub mod records;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::types::Waker;

/// Bufferset magic for the CSS side ("pCsS")
pub const CSS_BUFFERSET_MAGIC: u32 = 0x7043_7353;

/// Bufferset magic for the CU side ("pCuS")
pub const CUS_BUFFERSET_MAGIC: u32 = 0x7043_7553;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_NUM_BUFFERS: usize = 2;

/// Record header size: 48-bit timestamp, 8-bit size, 8-bit type
pub const HEADER_SIZE: usize = 8;

/// One enumeration identifies every trace point on both sides of a link;
/// the bufferset magic tells offline tools which side wrote the buffers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum RecordType {
    TrcEnable = 1,

    // CSS engine
    CssSchStart = 0x10,
    CssSchResume = 0x11,
    CssSchTest = 0x12,
    CssSchModify = 0x13,
    CssSchStore = 0x14,
    CssSchCancel = 0x15,
    CssNotify = 0x16,
    CssIoCallback = 0x17,
    CssCcwFetch = 0x18,
    CssSendTxPacket = 0x19,
    CssRxCommandComplete = 0x1a,
    CssRxDataComplete = 0x1b,
    CssTxComplete = 0x1c,
    CssFuncIrq = 0x1d,
    CssChpAlloc = 0x1e,
    CssChpConfigured = 0x1f,
    CssChpStarted = 0x20,
    CssChpTraced = 0x21,
    CssChpIrq = 0x22,
    CssSetIoCallback = 0x23,

    // CU engine
    CusCuInit = 0x40,
    CusCuConfigured = 0x41,
    CusCuStarted = 0x42,
    CusCuTraced = 0x43,
    CusDevTraced = 0x44,
    CusRegisterCallback = 0x45,
    CusRxCommandComplete = 0x46,
    CusRxDataComplete = 0x47,
    CusTxComplete = 0x48,
    CusMakePacket = 0x49,
    CusSendTxPacket = 0x4a,
    CusQueueCommand = 0x4b,
    CusCuIrq = 0x4c,
    CusDevCallback = 0x4d,

    // Link layer, remote (uart/pio) backends
    DmachanSrcCmdbuf = 0x60,
    DmachanSrcReset = 0x61,
    DmachanSrcData = 0x62,
    DmachanDstCmdbuf = 0x63,
    DmachanDstReset = 0x64,
    DmachanDstData = 0x65,
    DmachanDstDiscard = 0x66,
    DmachanDstZeroes = 0x67,

    // Link layer, memory backend. Each carries the peer state observed
    // under the lock, from which "advanced" vs "completed locally" follows.
    DmachanSrcCmdbufMem = 0x70,
    DmachanSrcDataMem = 0x71,
    DmachanDstCmdbufMem = 0x72,
    DmachanDstDataMem = 0x73,
    DmachanDstDiscardMem = 0x74,
    DmachanDstZeroesMem = 0x75,
    DmachanForceIrq = 0x76,
    DmachanTxIrq = 0x77,
    DmachanRxIrq = 0x78,

    // hldev helper
    HldevStart = 0x90,
    HldevReceive = 0x91,
    HldevSend = 0x92,
    HldevSendFinal = 0x93,
    HldevReceiving = 0x94,
    HldevSending = 0x95,
    HldevEnd = 0x96,
    HldevDevibCallback = 0x97,
}

/// A decoded trace record
#[derive(Debug, Clone)]
pub struct Record {
    pub timestamp_us: u64,
    pub rec_type: RecordType,
    pub data: Vec<u8>,
}

/// All buffersets in the process timestamp against one epoch so records
/// from the CSS and CU sides merge by time.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

struct Bufferset {
    current_buffer_num: usize,
    current_buffer_pos: usize,
    buffer_size: usize,
    magic: u32,
    buffers: Vec<Vec<u8>>,
    switch_waker: Option<Waker>,
    switches: u64,
}

impl Bufferset {
    fn new(magic: u32, buffer_size: usize, num_buffers: usize) -> Self {
        assert!(buffer_size >= 256 && num_buffers >= 1);
        Self {
            current_buffer_num: 0,
            current_buffer_pos: 0,
            buffer_size,
            magic,
            buffers: vec![vec![0; buffer_size]; num_buffers],
            switch_waker: None,
            switches: 0,
        }
    }

    fn switch_to_next_buffer(&mut self, pos: usize) {
        self.current_buffer_num = (self.current_buffer_num + 1) % self.buffers.len();
        self.current_buffer_pos = pos;
        self.switches += 1;
        if let Some(w) = &self.switch_waker {
            let _ = w.try_send(());
        }
    }

    fn write(&mut self, rt: RecordType, data: &[u8]) {
        assert!(data.len() + HEADER_SIZE <= 252);
        let size = (HEADER_SIZE + data.len() + 3) & !3;

        let start = if self.current_buffer_pos + size <= self.buffer_size {
            let p = self.current_buffer_pos;
            self.current_buffer_pos += size;
            p
        } else {
            self.switch_to_next_buffer(size);
            0
        };

        let us = epoch().elapsed().as_micros() as u64;
        let buf = &mut self.buffers[self.current_buffer_num];
        buf[start..start + 6].copy_from_slice(&us.to_le_bytes()[..6]);
        buf[start + 6] = (HEADER_SIZE + data.len()) as u8;
        buf[start + 7] = rt as u8;
        buf[start + 8..start + 8 + data.len()].copy_from_slice(data);
    }

    fn decode_buffer(&self, num: usize, limit: usize, out: &mut Vec<Record>) {
        let buf = &self.buffers[num];
        let mut pos = 0;
        while pos + HEADER_SIZE <= limit {
            let size = buf[pos + 6] as usize;
            if size < HEADER_SIZE {
                break; // unwritten tail
            }
            let Some(rec_type) = RecordType::from_u8(buf[pos + 7]) else {
                break;
            };
            let mut ts = [0u8; 8];
            ts[..6].copy_from_slice(&buf[pos..pos + 6]);
            if pos + size > limit {
                break;
            }
            out.push(Record {
                timestamp_us: u64::from_le_bytes(ts),
                rec_type,
                data: buf[pos + HEADER_SIZE..pos + size].to_vec(),
            });
            pos += (size + 3) & !3;
        }
    }
}

/// Cloneable handle to a bufferset, passed through every trace point
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<Mutex<Bufferset>>,
    enabled: Arc<AtomicBool>,
}

impl Tracer {
    pub fn new(magic: u32) -> Self {
        Self::with_geometry(magic, DEFAULT_BUFFER_SIZE, DEFAULT_NUM_BUFFERS)
    }

    pub fn with_geometry(magic: u32, buffer_size: usize, num_buffers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bufferset::new(magic, buffer_size, num_buffers))),
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn magic(&self) -> u32 {
        self.inner.lock().unwrap().magic
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Returns the previous enablement.
    pub fn set_enable(&self, enable: bool) -> bool {
        let old = self.enabled.swap(enable, Ordering::Relaxed);
        if old != enable {
            self.write(RecordType::TrcEnable, &[u8::from(enable)]);
        }
        old
    }

    /// Registers the waker pinged whenever the ring switches buffers, so
    /// the previous buffer can be drained before the ring wraps onto it.
    pub fn set_switch_waker(&self, w: Waker) {
        self.inner.lock().unwrap().switch_waker = Some(w);
    }

    pub fn write(&self, rt: RecordType, data: &[u8]) {
        if !self.enabled() && rt != RecordType::TrcEnable {
            return;
        }
        self.inner.lock().unwrap().write(rt, data);
    }

    pub fn write_cond(&self, cond: bool, rt: RecordType, data: &[u8]) {
        if cond {
            self.write(rt, data);
        }
    }

    pub fn buffer_switches(&self) -> u64 {
        self.inner.lock().unwrap().switches
    }

    /// Marshals the bufferset header in the layout offline tools consume:
    /// current buffer number and position, switch-IRQ number (-1 when only
    /// a waker is registered), enablement, magic, and ring geometry,
    /// padded to 32 bytes.
    pub fn snapshot_header(&self) -> [u8; 32] {
        let bs = self.inner.lock().unwrap();
        let mut h = [0u8; 32];
        h[0..4].copy_from_slice(&(bs.current_buffer_num as u32).to_ne_bytes());
        h[4..8].copy_from_slice(&(bs.current_buffer_pos as u32).to_ne_bytes());
        h[8..10].copy_from_slice(&(-1i16).to_ne_bytes());
        h[10] = u8::from(self.enabled());
        h[12..16].copy_from_slice(&bs.magic.to_ne_bytes());
        h[16..20].copy_from_slice(&(bs.buffer_size as u32).to_ne_bytes());
        h[20..22].copy_from_slice(&(bs.buffers.len() as u16).to_ne_bytes());
        h
    }

    /// Decodes every record still present in the ring, oldest first.
    /// Buffers the ring has wrapped over may contribute partial decodes
    /// up to their first overwritten header.
    pub fn records(&self) -> Vec<Record> {
        let bs = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let n = bs.buffers.len();
        for i in 1..n {
            let num = (bs.current_buffer_num + i) % n;
            bs.decode_buffer(num, bs.buffer_size, &mut out);
        }
        bs.decode_buffer(bs.current_buffer_num, bs.current_buffer_pos, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_writes_nothing() {
        let t = Tracer::new(CSS_BUFFERSET_MAGIC);
        t.write(RecordType::CssNotify, &[1, 2, 3]);
        assert!(t.records().is_empty());
    }

    #[test]
    fn record_roundtrip() {
        let t = Tracer::new(CSS_BUFFERSET_MAGIC);
        t.set_enable(true);
        t.write(RecordType::CssNotify, &[0xaa, 0xbb]);
        t.write(RecordType::CssSchStart, &[]);
        let recs = t.records();
        // set_enable wrote a TrcEnable record first
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[1].rec_type, RecordType::CssNotify);
        assert_eq!(recs[1].data, vec![0xaa, 0xbb]);
        assert_eq!(recs[2].rec_type, RecordType::CssSchStart);
        assert!(recs[2].data.is_empty());
    }

    #[test]
    fn switches_and_wakes_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let t = Tracer::with_geometry(CUS_BUFFERSET_MAGIC, 256, 2);
        t.set_switch_waker(tx);
        t.set_enable(true);
        for i in 0..40 {
            t.write(RecordType::CusMakePacket, &[i as u8; 8]);
        }
        assert!(t.buffer_switches() > 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn records_survive_one_switch() {
        let t = Tracer::with_geometry(CSS_BUFFERSET_MAGIC, 256, 2);
        t.set_enable(true);
        for i in 0..20u8 {
            t.write(RecordType::CssNotify, &[i]);
        }
        let recs = t.records();
        // ring holds the most recent records; the last written must be there
        assert_eq!(recs.last().unwrap().data, vec![19]);
    }
}
