//! Polled line-input device.
//!
//! A [`Source`] (an I2C keyboard, a console, a test script) is polled at
//! whatever cadence the owner calls [`LineReader::tick`]. Bytes
//! accumulate in a line buffer; a read-type channel program arms a
//! readiness predicate over (minimum bytes, deadline, end-of-line byte)
//! and the accumulated line is flushed to the CSS as soon as the
//! predicate holds.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::*;
use picochan_core::cu::Cu;
use picochan_core::hldev::{self, HldevHandle};
use picochan_core::mem::Address;
use picochan_core::types::UnitAddr;

/// Read one line from the device
pub const CMD_READ_LINE: u8 = 0x02;

/// A byte source polled by the device
pub trait Source: Send {
    /// Returns the next available byte, if any.
    fn poll(&mut self) -> Option<u8>;
}

impl<F: FnMut() -> Option<u8> + Send> Source for F {
    fn poll(&mut self) -> Option<u8> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct LineReaderConfig {
    /// Byte completing a line
    pub eol: u8,
    /// Bytes that must have accumulated before a timeout flush
    pub min_bytes: u16,
    /// How long a read waits before flushing what it has
    pub timeout: Duration,
    /// Accumulation limit; reaching it forces a flush
    pub max_line: u16,
}

impl Default for LineReaderConfig {
    fn default() -> Self {
        Self {
            eol: b'\n',
            min_bytes: 1,
            timeout: Duration::from_millis(100),
            max_line: 128,
        }
    }
}

struct Pending {
    ua: UnitAddr,
    deadline: Instant,
}

struct Inner {
    cfg: LineReaderConfig,
    source: Box<dyn Source>,
    /// Accumulated bytes waiting for the next read
    line: Vec<u8>,
    eol_seen: bool,
    pending: Option<Pending>,
    /// Region of CU storage the flush stages through
    staging: Address,
    hldev: Option<HldevHandle>,
}

#[derive(PartialEq, Eq)]
enum Verdict {
    /// Keep accumulating
    NotReady,
    /// The line is ready to go
    Flush,
    /// Deadline passed without enough data
    Timeout,
}

impl Inner {
    fn verdict(&self, now: Instant) -> Verdict {
        let Some(p) = &self.pending else {
            return Verdict::NotReady;
        };
        if self.eol_seen || self.line.len() >= usize::from(self.cfg.max_line) {
            return Verdict::Flush;
        }
        if now >= p.deadline {
            if self.line.len() >= usize::from(self.cfg.min_bytes) {
                return Verdict::Flush;
            }
            return Verdict::Timeout;
        }
        Verdict::NotReady
    }
}

/// A line-input device bound to one unit address
pub struct LineReader {
    inner: Arc<Mutex<Inner>>,
}

impl LineReader {
    /// Installs the device at `ua`, staging flushes through a region
    /// allocated from the CU's storage.
    pub fn install(
        cu: &mut Cu,
        ua: UnitAddr,
        source: Box<dyn Source>,
        cfg: LineReaderConfig,
    ) -> Result<Self> {
        let staging = cu
            .mem()
            .write()
            .unwrap()
            .alloc(usize::from(cfg.max_line) + 1, 4);

        let inner = Arc::new(Mutex::new(Inner {
            cfg,
            source,
            line: Vec::new(),
            eol_seen: false,
            pending: None,
            staging,
            hldev: None,
        }));

        let start_inner = Arc::clone(&inner);
        let hldev = hldev::config_init(
            cu,
            ua,
            1,
            Arc::new(move |cu, ua| start_program(cu, &start_inner, ua)),
            None,
        )?;
        inner.lock().unwrap().hldev = Some(Arc::clone(&hldev));
        Ok(Self { inner })
    }

    /// Polls the source and flushes a pending read whose predicate has
    /// become true. Call at the device's sampling cadence.
    pub fn tick(&self, cu: &mut Cu) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        while inner.line.len() < usize::from(inner.cfg.max_line) {
            let Some(b) = inner.source.poll() else {
                break;
            };
            if b == inner.cfg.eol {
                inner.eol_seen = true;
            }
            inner.line.push(b);
            if inner.eol_seen {
                break;
            }
        }

        match inner.verdict(Instant::now()) {
            Verdict::NotReady => (),
            Verdict::Flush => flush(cu, inner),
            Verdict::Timeout => timeout(cu, inner),
        }
    }
}

fn start_program(cu: &mut Cu, inner: &Arc<Mutex<Inner>>, ua: UnitAddr) {
    let mut guard = inner.lock().unwrap();
    let inner = &mut *guard;
    let h = inner.hldev.clone().unwrap();
    let ccwcmd = hldev::ccw_cmd(&h, ua);

    if ccwcmd != CMD_READ_LINE {
        drop(guard);
        hldev::end_reject(cu, &h, ua, picochan_core::status::sense_code::INVALID_CMD);
        return;
    }

    inner.pending = Some(Pending {
        ua,
        deadline: Instant::now() + inner.cfg.timeout,
    });

    // data may already satisfy the predicate
    if inner.verdict(Instant::now()) == Verdict::Flush {
        flush(cu, inner);
    }
}

fn timeout(cu: &mut Cu, inner: &mut Inner) {
    let Some(p) = inner.pending.take() else {
        return;
    };
    let h = inner.hldev.clone().unwrap();
    hldev::end_exception(cu, &h, p.ua);
}

fn flush(cu: &mut Cu, inner: &mut Inner) {
    let Some(p) = inner.pending.take() else {
        return;
    };
    let h = inner.hldev.clone().unwrap();
    let n = inner.line.len() as u16;
    if n == 0 {
        hldev::end_exception(cu, &h, p.ua);
        return;
    }

    debug!("linereader flushing {n} bytes to ua {}", p.ua);
    cu.mem()
        .write()
        .unwrap()
        .write_slice(inner.staging, &inner.line);
    inner.line.clear();
    inner.eol_seen = false;

    if let Err(e) = hldev::send_final(cu, &h, p.ua, inner.staging, n) {
        error!("linereader flush failed: {e}");
    }
}
