//! Intrusive subchannel lists.
//!
//! All lists link SCHIBs by small indices stored in the MDA, resolving to
//! slots of the CSS schib array: ISC lists are circular doubly-linked by
//! subchannel id, a channel path's function list is circular doubly-linked
//! by unit address, and its response list is singly-linked by unit
//! address with explicit head and tail. A node not on a list points at
//! itself.

use serde::{Deserialize, Serialize};

use super::schib::Schib;
use crate::types::{Sid, UnitAddr};

/// Pushes `sid` at the tail of the circular sid-dlist. Returns whether
/// the list was empty.
pub(crate) fn dlist_push(head: &mut Option<Sid>, schibs: &mut [Schib], sid: Sid) -> bool {
    debug_assert_eq!(schibs[sid as usize].mda.next_sid, sid);

    let Some(first) = *head else {
        schibs[sid as usize].mda.next_sid = sid;
        schibs[sid as usize].mda.prev_sid = sid;
        *head = Some(sid);
        return true;
    };

    let last = schibs[first as usize].mda.prev_sid;
    schibs[sid as usize].mda.next_sid = first;
    schibs[sid as usize].mda.prev_sid = last;
    schibs[last as usize].mda.next_sid = sid;
    schibs[first as usize].mda.prev_sid = sid;
    false
}

/// Unlinks `sid` from the sid-dlist and restores its self-link sentinel.
pub(crate) fn dlist_remove(head: &mut Option<Sid>, schibs: &mut [Schib], sid: Sid) {
    assert!(head.is_some(), "remove from empty schib dlist");

    let prev = schibs[sid as usize].mda.prev_sid;
    let next = schibs[sid as usize].mda.next_sid;
    schibs[prev as usize].mda.next_sid = next;
    schibs[next as usize].mda.prev_sid = prev;
    schibs[sid as usize].mda.next_sid = sid;
    schibs[sid as usize].mda.prev_sid = sid;

    if *head == Some(sid) {
        *head = if next == sid { None } else { Some(next) };
    }
}

pub(crate) fn dlist_pop(head: &mut Option<Sid>, schibs: &mut [Schib]) -> Option<Sid> {
    let sid = (*head)?;
    dlist_remove(head, schibs, sid);
    Some(sid)
}

/// Whether `sid` is linked on the sid-dlist rooted at `head`
pub(crate) fn dlist_contains(head: Option<Sid>, schibs: &[Schib], sid: Sid) -> bool {
    schibs[sid as usize].mda.next_sid != sid || head == Some(sid)
}

fn ua_slot(first_sid: Sid, ua: UnitAddr) -> usize {
    first_sid as usize + ua as usize
}

/// Pushes a schib at the tail of a channel path's circular ua-dlist.
pub(crate) fn ua_dlist_push(
    head: &mut Option<UnitAddr>,
    schibs: &mut [Schib],
    first_sid: Sid,
    ua: UnitAddr,
) {
    debug_assert_eq!(schibs[ua_slot(first_sid, ua)].mda.next_ua, ua);

    let Some(first) = *head else {
        schibs[ua_slot(first_sid, ua)].mda.next_ua = ua;
        schibs[ua_slot(first_sid, ua)].mda.prev_ua = ua;
        *head = Some(ua);
        return;
    };

    let last = schibs[ua_slot(first_sid, first)].mda.prev_ua;
    schibs[ua_slot(first_sid, ua)].mda.next_ua = first;
    schibs[ua_slot(first_sid, ua)].mda.prev_ua = last;
    schibs[ua_slot(first_sid, last)].mda.next_ua = ua;
    schibs[ua_slot(first_sid, first)].mda.prev_ua = ua;
}

pub(crate) fn ua_dlist_remove(
    head: &mut Option<UnitAddr>,
    schibs: &mut [Schib],
    first_sid: Sid,
    ua: UnitAddr,
) {
    assert!(head.is_some(), "remove from empty ua dlist");

    let prev = schibs[ua_slot(first_sid, ua)].mda.prev_ua;
    let next = schibs[ua_slot(first_sid, ua)].mda.next_ua;
    schibs[ua_slot(first_sid, prev)].mda.next_ua = next;
    schibs[ua_slot(first_sid, next)].mda.prev_ua = prev;
    schibs[ua_slot(first_sid, ua)].mda.next_ua = ua;
    schibs[ua_slot(first_sid, ua)].mda.prev_ua = ua;

    if *head == Some(ua) {
        *head = if next == ua { None } else { Some(next) };
    }
}

pub(crate) fn ua_dlist_pop(
    head: &mut Option<UnitAddr>,
    schibs: &mut [Schib],
    first_sid: Sid,
) -> Option<UnitAddr> {
    let ua = (*head)?;
    ua_dlist_remove(head, schibs, first_sid, ua);
    Some(ua)
}

/// Head and tail of a singly-linked (by next_ua) list of schibs
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct UaSlist {
    head: Option<UnitAddr>,
    tail: Option<UnitAddr>,
}

impl UaSlist {
    /// Appends at the tail; returns whether the list was empty.
    pub fn push(&mut self, schibs: &mut [Schib], first_sid: Sid, ua: UnitAddr) -> bool {
        match self.tail {
            None => {
                debug_assert!(self.head.is_none());
                self.head = Some(ua);
                self.tail = Some(ua);
                true
            }
            Some(tail_ua) => {
                debug_assert_eq!(schibs[ua_slot(first_sid, tail_ua)].mda.next_ua, tail_ua);
                schibs[ua_slot(first_sid, tail_ua)].mda.next_ua = ua;
                self.tail = Some(ua);
                false
            }
        }
    }

    pub fn pop(&mut self, schibs: &mut [Schib], first_sid: Sid) -> Option<UnitAddr> {
        let ua = self.head?;
        let next = schibs[ua_slot(first_sid, ua)].mda.next_ua;
        if next == ua {
            debug_assert_eq!(self.tail, Some(ua));
            self.head = None;
            self.tail = None;
        } else {
            // mark the popped schib as no longer on a list
            schibs[ua_slot(first_sid, ua)].mda.next_ua = ua;
            self.head = Some(next);
        }
        Some(ua)
    }
}
