//! Store-and-forward message bridge.
//!
//! Stands in for a network bridge (an MQTT client, say): inbound
//! messages arrive from a worker thread over a channel into a ring of
//! fixed-size buffers; Read-type programs drain them one message per
//! program, spanning CCW segments via hldev; Write-type programs enqueue
//! outbound messages to the worker. When a message lands in an empty
//! ring while no program is running, the device raises Attention so the
//! application knows to start a fetch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::*;
use picochan_core::cu::Cu;
use picochan_core::hldev::{self, HldevHandle};
use picochan_core::mem::Address;
use picochan_core::status::DevStatus;
use picochan_core::types::UnitAddr;

/// Publish a message to the bridge (Write-type)
pub const CMD_PUBLISH: u8 = 0x01;

/// Fetch the oldest buffered message (Read-type)
pub const CMD_FETCH: u8 = 0x02;

pub const MAX_MSG: usize = 1024;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Ring capacity in messages
    pub ring_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { ring_size: 8 }
    }
}

struct Inner {
    ua: UnitAddr,
    ring: VecDeque<Vec<u8>>,
    ring_size: usize,
    dropped: u64,
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
    /// Staging regions in CU storage for the in-flight fetch/publish
    fetch_buf: Address,
    publish_buf: Address,
    hldev: Option<HldevHandle>,
    /// A fetchable message exists and Attention has been raised for it
    attention_raised: bool,
}

pub struct Bridge {
    inner: Arc<Mutex<Inner>>,
}

impl Bridge {
    /// Installs the bridge at `ua`. `inbound` delivers messages from the
    /// network worker; `outbound` receives published ones.
    pub fn install(
        cu: &mut Cu,
        ua: UnitAddr,
        inbound: Receiver<Vec<u8>>,
        outbound: Sender<Vec<u8>>,
        cfg: &BridgeConfig,
    ) -> Result<Self> {
        let (fetch_buf, publish_buf) = {
            let mut ram = cu.mem().write().unwrap();
            (ram.alloc(MAX_MSG, 4), ram.alloc(MAX_MSG, 4))
        };

        let inner = Arc::new(Mutex::new(Inner {
            ua,
            ring: VecDeque::new(),
            ring_size: cfg.ring_size,
            dropped: 0,
            inbound,
            outbound,
            fetch_buf,
            publish_buf,
            hldev: None,
            attention_raised: false,
        }));

        let reject_inner = Arc::clone(&inner);
        let h = hldev::config_init(
            cu,
            ua,
            1,
            Arc::new(move |cu, ua| {
                let h = reject_inner.lock().unwrap().hldev.clone().unwrap();
                hldev::end_reject(
                    cu,
                    &h,
                    ua,
                    picochan_core::status::sense_code::INVALID_CMD,
                );
            }),
            None,
        )?;
        inner.lock().unwrap().hldev = Some(Arc::clone(&h));

        let fetch_inner = Arc::clone(&inner);
        hldev::register_command(
            &h,
            CMD_FETCH,
            Arc::new(move |cu, ua| fetch(cu, &fetch_inner, ua)),
        );
        let publish_inner = Arc::clone(&inner);
        hldev::register_command(
            &h,
            CMD_PUBLISH,
            Arc::new(move |cu, ua| publish(cu, &publish_inner, ua)),
        );

        Ok(Self { inner })
    }

    /// Drains the worker channel into the ring and raises Attention when
    /// messages become available. Call from the CU owner's loop.
    pub fn pump(&self, cu: &mut Cu) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        loop {
            match inner.inbound.try_recv() {
                Ok(mut msg) => {
                    msg.truncate(MAX_MSG);
                    if inner.ring.len() == inner.ring_size {
                        inner.ring.pop_front();
                        inner.dropped += 1;
                    }
                    inner.ring.push_back(msg);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if !inner.ring.is_empty()
            && !inner.attention_raised
            && !cu.devib(inner.ua).is_started()
        {
            inner.attention_raised = true;
            let ua = inner.ua;
            if let Err(e) =
                cu.dev_update_status(ua, DevStatus(0).with_attention(true))
            {
                warn!("bridge attention failed: {e}");
            }
        }
    }

    /// Messages dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }
}

/// Read-type: stream the oldest buffered message, however many segments
/// the channel program spreads it over.
fn fetch(cu: &mut Cu, inner: &Arc<Mutex<Inner>>, ua: UnitAddr) {
    let mut guard = inner.lock().unwrap();
    let h = guard.hldev.clone().unwrap();
    let Some(msg) = guard.ring.pop_front() else {
        drop(guard);
        hldev::end_exception(cu, &h, ua);
        return;
    };
    guard.attention_raised = false;
    let staging = guard.fetch_buf;
    let n = msg.len() as u16;
    drop(guard);

    if n == 0 {
        hldev::end_ok(cu, &h, ua);
        return;
    }

    cu.mem().write().unwrap().write_slice(staging, &msg);
    if let Err(e) = hldev::send_final(cu, &h, ua, staging, n) {
        error!("bridge fetch failed: {e}");
    }
}

/// Write-type: receive the whole message then hand it to the worker.
fn publish(cu: &mut Cu, inner: &Arc<Mutex<Inner>>, ua: UnitAddr) {
    let guard = inner.lock().unwrap();
    let h = guard.hldev.clone().unwrap();
    let staging = guard.publish_buf;
    drop(guard);

    let done_inner = Arc::clone(inner);
    let done = Arc::new(move |cu: &mut Cu, ua: UnitAddr| {
        let guard = done_inner.lock().unwrap();
        let h = guard.hldev.clone().unwrap();
        let n = hldev::count(&h, ua);
        let msg = cu
            .mem()
            .read()
            .unwrap()
            .read_slice(guard.publish_buf, usize::from(n))
            .to_vec();
        let _ = guard.outbound.send(msg);
        drop(guard);
        hldev::end_ok(cu, &h, ua);
    });

    if let Err(e) = hldev::receive_then(cu, &h, ua, staging, MAX_MSG as u16, Some(done)) {
        error!("bridge publish receive failed: {e}");
    }
}
