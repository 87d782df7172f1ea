//! Transaction correlation table
//!
//! Maps an outstanding transaction id to the single-slot channel its waiter
//! listens on. The transporter registers an entry right before writing a
//! request; the read loop resolves it when the matching response arrives.
//!
//! Each entry carries a ticket so a waiter that gives up can only remove its
//! own entry, never a newer registration that reused the same id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::TransactionId;

/// Receiving half handed to the waiter of a registered transaction
pub type ResponseSlot = oneshot::Receiver<Vec<u8>>;

/// Handle identifying one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub transaction_id: TransactionId,
    seq: u64,
}

struct Entry {
    seq: u64,
    slot: oneshot::Sender<Vec<u8>>,
}

/// Cancels a registration when dropped
///
/// Keeps the table clean when a waiter times out or its future is dropped
/// before the response arrived. Dropping it after the entry was resolved is
/// a no-op.
pub struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    ticket: Ticket,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.ticket);
    }
}

/// Outstanding transactions keyed by transaction id
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<TransactionId, Entry>>,
    next_seq: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionId, Entry>> {
        // a poisoned table still holds consistent entries
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `transaction_id`
    ///
    /// Fails with `TransactionInUse` while another waiter holds the same id.
    pub fn register(&self, transaction_id: TransactionId) -> ModbusResult<(Ticket, ResponseSlot)> {
        let mut entries = self.entries();
        if entries.contains_key(&transaction_id) {
            return Err(ModbusError::transaction_in_use(transaction_id));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        entries.insert(transaction_id, Entry { seq, slot });

        Ok((Ticket { transaction_id, seq }, rx))
    }

    /// Deliver a response frame to the waiter of `transaction_id`
    ///
    /// Returns `false` when nobody is waiting (late or unknown response) or
    /// the waiter already went away; the frame is dropped in both cases.
    pub fn resolve(&self, transaction_id: TransactionId, frame: Vec<u8>) -> bool {
        let entry = self.entries().remove(&transaction_id);
        match entry {
            Some(entry) => entry.slot.send(frame).is_ok(),
            None => false,
        }
    }

    /// Remove the entry created by `ticket`, if it is still registered
    pub fn cancel(&self, ticket: Ticket) {
        let mut entries = self.entries();
        if entries
            .get(&ticket.transaction_id)
            .is_some_and(|entry| entry.seq == ticket.seq)
        {
            entries.remove(&ticket.transaction_id);
        }
    }

    /// Tie the lifetime of a registration to the returned guard
    pub fn guard(&self, ticket: Ticket) -> PendingGuard<'_> {
        PendingGuard { table: self, ticket }
    }

    /// Drop every entry, waking all waiters with a closed slot
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn contains(&self, transaction_id: TransactionId) -> bool {
        self.entries().contains_key(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Sorted list of outstanding transaction ids (for diagnostics)
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.entries().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let table = CorrelationTable::new();
        let (_ticket, rx) = table.register(7).unwrap();
        assert!(table.contains(7));

        assert!(table.resolve(7, vec![0, 7, 0, 0, 0, 2, 1, 3]));
        assert_eq!(rx.await.unwrap(), vec![0, 7, 0, 0, 0, 2, 1, 3]);
        assert!(!table.contains(7));

        // a second response for the same id has nobody to go to
        assert!(!table.resolve(7, vec![0, 7]));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = CorrelationTable::new();
        let (_ticket, _rx) = table.register(3).unwrap();
        assert_eq!(
            table.register(3).unwrap_err(),
            ModbusError::transaction_in_use(3)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cancel_only_removes_own_entry() {
        let table = CorrelationTable::new();
        let (stale, _rx) = table.register(9).unwrap();
        assert!(table.resolve(9, vec![]));

        let (fresh, _rx2) = table.register(9).unwrap();
        table.cancel(stale);
        assert!(table.contains(9));

        table.cancel(fresh);
        assert!(table.is_empty());
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let table = CorrelationTable::new();
        let (ticket, _rx) = table.register(11).unwrap();
        {
            let _guard = table.guard(ticket);
            assert!(table.contains(11));
        }
        assert!(!table.contains(11));
    }

    #[tokio::test]
    async fn test_clear_wakes_waiters() {
        let table = CorrelationTable::new();
        let (_a, rx_a) = table.register(1).unwrap();
        let (_b, rx_b) = table.register(2).unwrap();
        assert_eq!(table.transaction_ids(), vec![1, 2]);

        assert_eq!(table.clear(), 2);
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
    }

    #[test]
    fn test_resolve_after_waiter_dropped() {
        let table = CorrelationTable::new();
        let (_ticket, rx) = table.register(4).unwrap();
        drop(rx);
        assert!(!table.resolve(4, vec![1]));
        assert!(table.is_empty());
    }
}
