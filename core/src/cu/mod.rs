//! The Control Unit engine: device-side peer of a CSS channel path.
//!
//! A [`Cu`] owns one link, a tx queue of unit addresses with outbound
//! operations, and an array of [`Devib`]s whose callbacks implement the
//! actual devices. Like the CSS it is an event-driven reactor: link
//! completions drive everything, drained by [`Cu::poll`].

mod callback;
mod dev_api;
mod devib;
mod rx;
mod tx;

pub use callback::{
    default_devib_callback, CallbackTable, DevCallback, CALLBACK_DEFAULT, CALLBACK_NOOP,
    NUM_DEVIB_CALLBACKS,
};
pub use dev_api::DevError;
pub use devib::{Devib, DevibFlags};

use std::sync::Arc;

use anyhow::{ensure, Result};
use crossbeam_channel::Receiver;

use crate::dmachan::{Channel, LinkKind};
use crate::mem::MemHandle;
use crate::trc::{records, RecordType, Tracer, CUS_BUFFERSET_MAGIC};
use crate::txsm::Txsm;
use crate::types::{CuAddr, UnitAddr, Waker};

#[derive(Debug, Clone)]
pub struct CuConfig {
    pub cuaddr: CuAddr,
    pub num_devibs: usize,
}

impl Default for CuConfig {
    fn default() -> Self {
        Self {
            cuaddr: 0,
            num_devibs: 32,
        }
    }
}

pub struct Cu {
    cuaddr: CuAddr,
    channel: Option<Channel>,
    tx_pending: Txsm,
    /// Unit address to call back once the in-flight data send completes
    tx_callback_ua: Option<UnitAddr>,
    /// Unit address whose buffer the rx data stream is currently filling
    rx_active: Option<UnitAddr>,
    /// Singly-linked queue of unit addresses with outbound operations
    tx_head: Option<UnitAddr>,
    tx_tail: Option<UnitAddr>,
    traced: bool,
    started: bool,
    devibs: Vec<Devib>,
    callbacks: Arc<CallbackTable>,
    mem: MemHandle,
    tracer: Tracer,
    waker: Waker,
    wake_rx: Receiver<()>,
}

impl Cu {
    pub fn new(mem: &MemHandle, callbacks: &Arc<CallbackTable>, config: &CuConfig) -> Self {
        assert!(config.num_devibs >= 1 && config.num_devibs <= 256);
        let (waker, wake_rx) = crossbeam_channel::bounded(1);

        let cu = Self {
            cuaddr: config.cuaddr,
            channel: None,
            tx_pending: Txsm::default(),
            tx_callback_ua: None,
            rx_active: None,
            tx_head: None,
            tx_tail: None,
            traced: false,
            started: false,
            devibs: (0..config.num_devibs)
                .map(|ua| Devib::new(ua as UnitAddr))
                .collect(),
            callbacks: Arc::clone(callbacks),
            mem: MemHandle::clone(mem),
            tracer: Tracer::new(CUS_BUFFERSET_MAGIC),
            waker,
            wake_rx,
        };
        cu.tracer.write(
            RecordType::CusCuInit,
            &records::id_byte(config.cuaddr, config.num_devibs as u8),
        );
        cu
    }

    pub fn cuaddr(&self) -> CuAddr {
        self.cuaddr
    }

    pub fn mem(&self) -> &MemHandle {
        &self.mem
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn callbacks(&self) -> Arc<CallbackTable> {
        Arc::clone(&self.callbacks)
    }

    pub fn is_traced(&self) -> bool {
        self.traced
    }

    pub fn devib(&self, ua: UnitAddr) -> &Devib {
        &self.devibs[ua as usize]
    }

    pub fn devib_mut(&mut self, ua: UnitAddr) -> &mut Devib {
        &mut self.devibs[ua as usize]
    }

    pub fn num_devibs(&self) -> usize {
        self.devibs.len()
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel {
        self.channel.as_mut().unwrap()
    }

    /// Attaches one side of a link.
    pub fn configure(&mut self, channel: Channel) -> Result<()> {
        ensure!(!self.started, "CU already started");
        ensure!(self.channel.is_none(), "CU already configured");
        channel.waker_cell().register(self.waker.clone());
        let mut channel = channel;
        if self.traced {
            channel.set_trace(Some(self.tracer.clone()), self.cuaddr);
        }
        self.channel = Some(channel);
        self.tracer
            .write(RecordType::CusCuConfigured, &records::byte(self.cuaddr));
        Ok(())
    }

    pub fn configure_memcu(&mut self, channel: Channel) -> Result<()> {
        ensure!(channel.kind == LinkKind::Mem, "not a memory channel");
        self.configure(channel)
    }

    pub fn configure_uartcu(&mut self, channel: Channel) -> Result<()> {
        ensure!(channel.kind == LinkKind::Uart, "not a uart channel");
        self.configure(channel)
    }

    pub fn configure_piocu(&mut self, channel: Channel) -> Result<()> {
        ensure!(channel.kind == LinkKind::Pio, "not a pio channel");
        self.configure(channel)
    }

    /// Starts the CU: arms the one-byte reset drain so the peer's reset
    /// poke is swallowed before command reception begins.
    pub fn start(&mut self) -> Result<()> {
        ensure!(self.channel.is_some(), "CU not configured");
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.tracer
            .write(RecordType::CusCuStarted, &records::byte(self.cuaddr));
        self.channel.as_mut().unwrap().rx.start_dst_reset();
        Ok(())
    }

    /// Enables or disables bufferset tracing; returns the old setting.
    pub fn set_trace(&mut self, trace: bool) -> bool {
        self.tracer.set_enable(trace)
    }

    /// Enables or disables CU-level (and link-level) tracing; returns
    /// the old setting.
    pub fn trace_cu(&mut self, trace: bool) -> bool {
        let old = self.traced;
        self.traced = trace;
        let tracer = self.tracer.clone();
        if let Some(ch) = self.channel.as_mut() {
            ch.set_trace(trace.then_some(tracer), self.cuaddr);
        }
        self.tracer.write_cond(
            trace || old,
            RecordType::CusCuTraced,
            &records::id_byte(self.cuaddr, u8::from(trace)),
        );
        old
    }

    /// Enables or disables per-device tracing; returns the old setting.
    pub fn trace_dev(&mut self, ua: UnitAddr, trace: bool) -> bool {
        let cuaddr = self.cuaddr;
        let devib = &mut self.devibs[ua as usize];
        let old = devib.is_traced();
        devib.flags.set_traced(trace);
        self.tracer.write_cond(
            self.traced || trace || old,
            RecordType::CusDevTraced,
            &records::dev_byte(cuaddr, ua, u8::from(trace)),
        );
        old
    }

    /// Drains all raised link completions. Returns whether anything ran.
    pub fn poll(&mut self) -> bool {
        while self.wake_rx.try_recv().is_ok() {}

        let mut acted = false;
        loop {
            let (rx_st, tx_st) = match self.channel.as_mut() {
                Some(ch) if self.started => (ch.rx.handle_rx_irq(), ch.tx.handle_tx_irq()),
                _ => break,
            };

            if rx_st.raised || tx_st.raised {
                self.tracer.write_cond(
                    self.traced,
                    RecordType::CusCuIrq,
                    &records::dev_byte(self.cuaddr, rx_st.as_byte(), tx_st.as_byte()),
                );
            }

            let mut any = false;
            // tx before rx: a peer response always postdates our own
            // completed send, even when both completions were batched
            if tx_st.complete {
                tx::handle_tx_complete(self);
                any = true;
            }
            if rx_st.complete {
                rx::handle_rx_complete(self);
                any = true;
            }
            if !any {
                break;
            }
            acted = true;
        }
        acted
    }

    /// Parks briefly for a wake from the link peer, then polls. Returns
    /// whether anything ran.
    pub fn wait(&mut self) -> bool {
        if self.poll() {
            return true;
        }
        let _ = self
            .wake_rx
            .recv_timeout(std::time::Duration::from_millis(20));
        self.poll()
    }
}
