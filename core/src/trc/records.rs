//! Builders for the data parts of trace records.
//!
//! Multi-byte fields are written native-endian, matching the control-block
//! marshalling; the decoding side keys off the bufferset magic.

use arrayvec::ArrayVec;

use crate::ccw::Ccw;
use crate::mem::Address;
use crate::proto::Packet;
use crate::scsw::Scsw;
use crate::types::{Sid, UnitAddr};

pub type RecData = ArrayVec<u8, 32>;

pub fn byte(b: u8) -> RecData {
    let mut d = RecData::new();
    d.push(b);
    d
}

pub fn id_byte(id: u8, b: u8) -> RecData {
    let mut d = RecData::new();
    d.push(id);
    d.push(b);
    d
}

pub fn sid_byte(sid: Sid, b: u8) -> RecData {
    let mut d = RecData::new();
    d.try_extend_from_slice(&sid.to_ne_bytes()).unwrap();
    d.push(b);
    d
}

pub fn word_sid_byte(word: u32, sid: Sid, b: u8) -> RecData {
    let mut d = RecData::new();
    d.try_extend_from_slice(&word.to_ne_bytes()).unwrap();
    d.try_extend_from_slice(&sid.to_ne_bytes()).unwrap();
    d.push(b);
    d
}

pub fn packet_sid(p: Packet, sid: Sid) -> RecData {
    let mut d = RecData::new();
    d.try_extend_from_slice(&p.to_bytes()).unwrap();
    d.try_extend_from_slice(&sid.to_ne_bytes()).unwrap();
    d
}

pub fn dev_byte(cuaddr: u8, ua: UnitAddr, b: u8) -> RecData {
    let mut d = RecData::new();
    d.push(cuaddr);
    d.push(ua);
    d.push(b);
    d
}

pub fn dev_packet(cuaddr: u8, ua: UnitAddr, p: Packet) -> RecData {
    let mut d = RecData::new();
    d.push(cuaddr);
    d.push(ua);
    d.try_extend_from_slice(&p.to_bytes()).unwrap();
    d
}

pub fn ccw_addr_sid(ccw: Ccw, addr: Address, sid: Sid) -> RecData {
    let mut d = RecData::new();
    d.try_extend_from_slice(&ccw.to_bytes()).unwrap();
    d.try_extend_from_slice(&addr.to_ne_bytes()).unwrap();
    d.try_extend_from_slice(&sid.to_ne_bytes()).unwrap();
    d
}

pub fn scsw_sid_cc(scsw: &Scsw, sid: Sid, cc: u8) -> RecData {
    let mut d = RecData::new();
    d.try_extend_from_slice(&scsw.to_bytes()).unwrap();
    d.try_extend_from_slice(&sid.to_ne_bytes()).unwrap();
    d.push(cc);
    d
}

/// Link-layer record: link id plus a state/flags byte
pub fn link_byte(id: u8, b: u8) -> RecData {
    id_byte(id, b)
}

/// Link-layer record for a data segment: id, address, count
pub fn link_segment(id: u8, addr: Address, count: u32) -> RecData {
    let mut d = RecData::new();
    d.push(id);
    d.try_extend_from_slice(&addr.to_ne_bytes()).unwrap();
    d.try_extend_from_slice(&count.to_ne_bytes()).unwrap();
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Chop, ChopCmd};

    #[test]
    fn shapes() {
        assert_eq!(byte(7).as_slice(), &[7]);
        assert_eq!(sid_byte(0x0102, 9).len(), 3);
        let p = Packet::with_count(Chop::make(ChopCmd::Data, 0), 1, 8);
        assert_eq!(packet_sid(p, 3).len(), 6);
        assert_eq!(link_segment(2, 0x10, 5).len(), 9);
    }
}
