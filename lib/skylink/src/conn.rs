//! Connection slot table.
//!
//! The radio multiplexes up to [`crate::config::MAX_CONNS`] connections over
//! one serial link, addressed by slot number. Slots are reused; every
//! idle/active boundary bumps the slot's validation id so that callbacks and
//! handles referring to a previous occupant can be recognized and discarded.

use indexmap::IndexSet;
use std::sync::Arc;

use crate::config::MAX_CONNS;
use crate::pbuf::Pbuf;
use crate::support::EvtReply;
use crate::types::{ConnType, Ip, Port};

/// Non-owning reference to a connection: slot index plus the generation it
/// was captured at. Stale references fail validation instead of touching a
/// reused slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnRef {
    pub(crate) idx: u8,
    pub(crate) val_id: u16,
}

impl ConnRef {
    /// Slot number on the radio.
    #[inline]
    pub fn index(&self) -> u8 {
        self.idx
    }

    /// Generation captured when this reference was created.
    #[inline]
    pub fn generation(&self) -> u16 {
        self.val_id
    }
}

/// Events delivered to a connection's registered callback.
#[derive(Debug)]
pub enum ConnEvent {
    /// The connection became active. `client` is set when the local side
    /// initiated it.
    Active { conn: ConnRef, client: bool },
    /// Payload received. The callback may keep the data by cloning the pbuf.
    Recv { conn: ConnRef, pbuf: Pbuf },
    /// The connection closed. `forced` when the local side requested it.
    Closed { conn: ConnRef, forced: bool },
}

/// Callback bound to a connection slot. Invoked from the processor thread
/// without the core lock held.
pub type ConnEvtFn = Arc<dyn Fn(&ConnEvent) -> EvtReply + Send + Sync>;

pub(crate) struct ConnSlot {
    pub kind: ConnType,
    pub active: bool,
    pub client: bool,
    pub receive_blocked: bool,
    pub in_closing: bool,
    pub closed_by_us: bool,
    pub remote_ip: Option<Ip>,
    pub remote_port: Port,
    pub local_port: Port,
    pub evt_fn: Option<ConnEvtFn>,
    pub val_id: u16,
    pub total_recved: u64,
    pub total_sent: u64,
    /// Bytes the radio holds for us in manual receive mode.
    pub tcp_available: usize,
}

impl ConnSlot {
    fn idle() -> ConnSlot {
        ConnSlot {
            kind: ConnType::Tcp,
            active: false,
            client: false,
            receive_blocked: false,
            in_closing: false,
            closed_by_us: false,
            remote_ip: None,
            remote_port: 0,
            local_port: 0,
            evt_fn: None,
            val_id: 0,
            total_recved: 0,
            total_sent: 0,
            tcp_available: 0,
        }
    }
}

pub(crate) struct ConnTable {
    slots: Vec<ConnSlot>,
    active: IndexSet<u8>,
}

impl ConnTable {
    pub fn new() -> ConnTable {
        ConnTable {
            slots: (0..MAX_CONNS).map(|_| ConnSlot::idle()).collect(),
            active: IndexSet::new(),
        }
    }

    #[inline]
    pub fn slot(&self, idx: u8) -> Option<&ConnSlot> {
        self.slots.get(idx as usize)
    }

    #[inline]
    pub fn slot_mut(&mut self, idx: u8) -> Option<&mut ConnSlot> {
        self.slots.get_mut(idx as usize)
    }

    /// Resolve a reference, failing if the slot has moved on to a newer
    /// generation or is no longer active.
    pub fn get(&self, conn: ConnRef) -> Option<&ConnSlot> {
        self.slots
            .get(conn.idx as usize)
            .filter(|slot| slot.active && slot.val_id == conn.val_id)
    }

    pub fn get_mut(&mut self, conn: ConnRef) -> Option<&mut ConnSlot> {
        self.slots
            .get_mut(conn.idx as usize)
            .filter(|slot| slot.active && slot.val_id == conn.val_id)
    }

    #[inline]
    pub fn is_valid(&self, conn: ConnRef) -> bool {
        self.get(conn).is_some()
    }

    /// Lowest idle slot number, if any.
    pub fn free_slot(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| !slot.active)
            .map(|idx| idx as u8)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_slots(&self) -> impl Iterator<Item = u8> + '_ {
        self.active.iter().copied()
    }

    /// Transition a slot to active, bumping its generation. Returns the new
    /// reference. Re-activating an already active slot only refreshes the
    /// endpoint data and keeps the generation.
    pub fn mark_active(
        &mut self,
        idx: u8,
        kind: ConnType,
        client: bool,
        remote: Option<(Ip, Port)>,
        local_port: Port,
        evt_fn: Option<ConnEvtFn>,
    ) -> Option<ConnRef> {
        let slot = self.slots.get_mut(idx as usize)?;

        if !slot.active {
            slot.val_id = slot.val_id.wrapping_add(1);
            slot.active = true;
            slot.total_recved = 0;
            slot.total_sent = 0;
            slot.tcp_available = 0;
            slot.receive_blocked = false;
            slot.in_closing = false;
            slot.closed_by_us = false;
        }
        slot.kind = kind;
        slot.client = client;
        if let Some((ip, port)) = remote {
            slot.remote_ip = Some(ip);
            slot.remote_port = port;
        }
        slot.local_port = local_port;
        if evt_fn.is_some() {
            slot.evt_fn = evt_fn;
        }

        self.active.insert(idx);
        Some(ConnRef {
            idx,
            val_id: slot.val_id,
        })
    }

    /// Transition a slot to idle, bumping its generation. Returns the
    /// reference the occupant held, its callback and whether the close was
    /// locally forced, for event dispatch after the lock is dropped.
    pub fn mark_closed(&mut self, idx: u8) -> Option<(ConnRef, Option<ConnEvtFn>, bool)> {
        let slot = self.slots.get_mut(idx as usize)?;
        if !slot.active {
            return None;
        }

        let conn = ConnRef {
            idx,
            val_id: slot.val_id,
        };
        let forced = slot.closed_by_us;
        let evt_fn = slot.evt_fn.take();

        slot.val_id = slot.val_id.wrapping_add(1);
        slot.active = false;
        slot.in_closing = false;
        slot.closed_by_us = false;
        slot.receive_blocked = false;
        slot.remote_ip = None;
        slot.tcp_available = 0;

        self.active.swap_remove(&idx);
        Some((conn, evt_fn, forced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_active(idx: u8) -> (ConnTable, ConnRef) {
        let mut table = ConnTable::new();
        let conn = table
            .mark_active(idx, ConnType::Tcp, true, None, 0, None)
            .unwrap();
        (table, conn)
    }

    #[test]
    fn test_free_slot_prefers_lowest() {
        let mut table = ConnTable::new();
        assert_eq!(table.free_slot(), Some(0));

        table.mark_active(0, ConnType::Tcp, true, None, 0, None);
        assert_eq!(table.free_slot(), Some(1));

        table.mark_closed(0);
        assert_eq!(table.free_slot(), Some(0));
    }

    #[test]
    fn test_generation_bumps_on_both_edges() {
        let (mut table, conn) = table_with_active(2);
        let first_gen = conn.generation();

        table.mark_closed(2);
        let reopened = table
            .mark_active(2, ConnType::Tcp, true, None, 0, None)
            .unwrap();

        assert!(reopened.generation() > first_gen);
        assert_eq!(reopened.generation(), first_gen.wrapping_add(2));
    }

    #[test]
    fn test_stale_ref_rejected_after_reuse() {
        let (mut table, old) = table_with_active(1);

        table.mark_closed(1);
        table.mark_active(1, ConnType::Udp, false, None, 0, None);

        assert!(!table.is_valid(old));
        assert!(table.get(old).is_none());
    }

    #[test]
    fn test_mark_closed_reports_forced_flag() {
        let (mut table, conn) = table_with_active(0);
        table.slot_mut(conn.index()).unwrap().closed_by_us = true;

        let (closed, _evt, forced) = table.mark_closed(0).unwrap();
        assert_eq!(closed, conn);
        assert!(forced);

        // Second close of an idle slot is a no-op.
        assert!(table.mark_closed(0).is_none());
    }

    #[test]
    fn test_reactivation_keeps_generation() {
        let (mut table, conn) = table_with_active(3);
        let again = table
            .mark_active(3, ConnType::Tcp, true, Some((Ip::V4([1, 2, 3, 4]), 80)), 0, None)
            .unwrap();
        assert_eq!(conn.generation(), again.generation());
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn test_counters_reset_on_activation() {
        let (mut table, conn) = table_with_active(0);
        {
            let slot = table.slot_mut(conn.index()).unwrap();
            slot.total_recved = 100;
            slot.total_sent = 50;
        }
        table.mark_closed(0);
        table.mark_active(0, ConnType::Tcp, true, None, 0, None);

        let slot = table.slot(0).unwrap();
        assert_eq!(slot.total_recved, 0);
        assert_eq!(slot.total_sent, 0);
    }
}
