//! A channel path: the CSS-side peer of one control unit.
//!
//! Owns one link, the two-step tx sequencer, the list of subchannels with
//! pending API functions and the list of subchannels owing a response
//! packet, plus the rx-data routing state for the unit address currently
//! consuming the link's data stream.

use super::lists::UaSlist;
use crate::dmachan::Channel;
use crate::proto::Packet;
use crate::status::DevStatus;
use crate::trc::{records, RecordType, Tracer};
use crate::txsm::Txsm;
use crate::types::{Sid, UnitAddr};

pub struct ChannelPath {
    pub(crate) channel: Option<Channel>,
    pub(crate) tx_pending: Txsm,
    pub(crate) first_sid: Sid,
    pub(crate) num_devices: u16,

    /// Unit address whose CCW data the rx stream is currently filling
    pub(crate) rx_data_for_ua: Option<UnitAddr>,
    /// Non-zero: on rx data completion, treat as an immediate implicit
    /// device status
    pub(crate) rx_data_end_ds: DevStatus,
    /// The rx data in flight overran the segment and is being discarded
    pub(crate) rx_overrun: bool,
    /// Peer wants a Room update once the rx data completes
    pub(crate) rx_response_required: bool,

    pub(crate) tx_active: bool,
    pub(crate) claimed: bool,
    pub(crate) allocated: bool,
    pub(crate) started: bool,
    pub(crate) traced: bool,

    pub(crate) ua_func_dlist: Option<UnitAddr>,
    pub(crate) ua_response_slist: UaSlist,
}

impl ChannelPath {
    pub(crate) fn new() -> Self {
        Self {
            channel: None,
            tx_pending: Txsm::default(),
            first_sid: 0,
            num_devices: 0,
            rx_data_for_ua: None,
            rx_data_end_ds: DevStatus(0),
            rx_overrun: false,
            rx_response_required: false,
            tx_active: false,
            claimed: false,
            allocated: false,
            started: false,
            traced: false,
            ua_func_dlist: None,
            ua_response_slist: UaSlist::default(),
        }
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.channel.is_some()
    }

    pub(crate) fn contains_ua(&self, ua: UnitAddr) -> bool {
        u16::from(ua) < self.num_devices
    }

    pub(crate) fn sid_of(&self, ua: UnitAddr) -> Sid {
        debug_assert!(self.contains_ua(ua));
        self.first_sid + Sid::from(ua)
    }

    /// Sends a command packet on the path's link. Completion arrives
    /// through the tx completion handler.
    pub(crate) fn send_tx_packet(&mut self, tracer: &Tracer, sid: Sid, p: Packet) {
        debug_assert!(!self.tx_active);
        tracer.write_cond(
            self.traced,
            RecordType::CssSendTxPacket,
            &records::packet_sid(p, sid),
        );
        self.tx_active = true;
        let ch = self.channel.as_mut().unwrap();
        ch.tx.set_packet(p);
        ch.tx.start_src_cmdbuf();
    }
}
