//! Shared test rig: a CSS and a CU joined by one link, with storage on
//! each side and all subchannels enabled at ISC 0.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;

use picochan_core::css::{Css, PmcwFlags};
use picochan_core::cu::{CallbackTable, Cu, CuConfig};
use picochan_core::dmachan::{self, PioConfig, UartConfig};
use picochan_core::mem::{self, MemHandle};
use picochan_core::types::{CondCode, Sid};

#[derive(Clone, Copy)]
pub enum Link {
    Mem,
    Uart,
    Pio,
}

pub struct Rig {
    pub css: Css,
    pub cu: Cu,
    pub css_mem: MemHandle,
    pub cu_mem: MemHandle,
    pub first_sid: Sid,
    pub callbacks: Arc<CallbackTable>,
}

pub fn rig(link: Link, num_devices: u16) -> Rig {
    let css_mem = mem::new_handle(65536);
    let cu_mem = mem::new_handle(65536);

    let mut css = Css::new(&css_mem);
    css.start(None, 0xff);
    css.chp_claim(0).unwrap();
    let first_sid = css.chp_alloc(0, num_devices).unwrap();

    let (a, b) = match link {
        Link::Mem => dmachan::memchan_pair(&css_mem, &cu_mem),
        Link::Uart => dmachan::uartchan_pair(&css_mem, &cu_mem, &UartConfig::default()),
        Link::Pio => dmachan::piochan_pair(&css_mem, &cu_mem, &PioConfig::default()),
    };
    css.chp_configure(0, a).unwrap();

    let callbacks = CallbackTable::new();
    let mut cu = Cu::new(
        &cu_mem,
        &callbacks,
        &CuConfig {
            cuaddr: 0,
            num_devibs: usize::from(num_devices),
        },
    );
    cu.configure(b).unwrap();
    cu.start().unwrap();
    css.chp_start(0).unwrap();

    for i in 0..num_devices {
        let cc = css.sch_modify_flags(first_sid + i, PmcwFlags(0).with_enabled(true).0);
        assert_eq!(cc, CondCode::Ok);
    }

    Rig {
        css,
        cu,
        css_mem,
        cu_mem,
        first_sid,
        callbacks,
    }
}

/// Alternates both reactors until neither makes progress.
pub fn pump(css: &mut Css, cu: &mut Cu) {
    for _ in 0..10_000 {
        let a = css.poll();
        let b = cu.poll();
        if !a && !b {
            return;
        }
    }
    panic!("link did not quiesce");
}

/// Alternates both reactors a bounded number of rounds (for perpetual
/// programs).
pub fn pump_rounds(css: &mut Css, cu: &mut Cu, rounds: usize) {
    for _ in 0..rounds {
        css.poll();
        cu.poll();
    }
}
