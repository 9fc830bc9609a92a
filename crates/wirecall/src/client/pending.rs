//! Outstanding calls keyed by sequence number.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::codec::Payload;
use crate::errors::CallError;

/// Type-erased completion: decodes the reply and signals the caller.
pub(crate) type Completion = Box<dyn FnOnce(u32, Result<Option<Payload>, CallError>) + Send>;

/// Call registered on the table and not yet resolved.
pub(crate) struct PendingCall {
    command: u32,
    complete: Completion,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PendingCall")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    pub(crate) const fn command(&self) -> u32 {
        self.command
    }

    /// Runs the completion. Must be called without holding the table lock.
    pub(crate) fn finish(self, sequence: u32, result: Result<Option<Payload>, CallError>) {
        (self.complete)(sequence, result);
    }
}

#[derive(Debug)]
struct Slot {
    ticket: u64,
    call: PendingCall,
}

#[derive(Debug)]
struct Slots {
    calls: HashMap<u32, Slot>,
    next_sequence: u32,
    next_ticket: u64,
    closed: bool,
}

/// Mutex-guarded map from sequence number to pending call.
///
/// Removal is a single check-and-remove under the lock, so a response and a
/// deadline racing for the same call resolve it exactly once.
#[derive(Debug)]
pub(crate) struct PendingTable {
    slots: Mutex<Slots>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                calls: HashMap::new(),
                next_sequence: 1,
                next_ticket: 1,
                closed: false,
            }),
        }
    }

    /// Registers a call under a sequence number not currently in flight.
    ///
    /// Returns the sequence number and the call's ticket, or hands the call
    /// back when the table has been closed.
    pub(crate) fn insert(
        &self,
        command: u32,
        complete: Completion,
    ) -> Result<(u32, u64), PendingCall> {
        let call = PendingCall { command, complete };
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if slots.closed {
            return Err(call);
        }

        let sequence = loop {
            let candidate = slots.next_sequence;
            slots.next_sequence = candidate.checked_add(1).unwrap_or(1);
            if candidate != 0 && !slots.calls.contains_key(&candidate) {
                break candidate;
            }
        };
        let ticket = slots.next_ticket;
        slots.next_ticket += 1;
        slots.calls.insert(sequence, Slot { ticket, call });
        Ok((sequence, ticket))
    }

    /// Removes the call registered under `sequence`.
    pub(crate) fn remove(&self, sequence: u32) -> Option<PendingCall> {
        self.slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .calls
            .remove(&sequence)
            .map(|slot| slot.call)
    }

    /// Removes the call under `sequence` only if it still carries `ticket`.
    pub(crate) fn remove_if(&self, sequence: u32, ticket: u64) -> Option<PendingCall> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        match slots.calls.get(&sequence) {
            Some(slot) if slot.ticket == ticket => {
                slots.calls.remove(&sequence).map(|slot| slot.call)
            }
            _ => None,
        }
    }

    /// Refuses further inserts and returns every outstanding call.
    pub(crate) fn close(&self) -> Vec<(u32, PendingCall)> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        slots.closed = true;
        slots
            .calls
            .drain()
            .map(|(sequence, slot)| (sequence, slot.call))
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .closed
    }

    pub(crate) fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .calls
            .len()
    }

    #[cfg(test)]
    fn start_at(&self, sequence: u32) {
        self.slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .next_sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::{fixture, rstest};

    use super::*;

    fn ignore() -> Completion {
        Box::new(|_, _| {})
    }

    #[fixture]
    fn table() -> PendingTable {
        PendingTable::new()
    }

    #[rstest]
    fn sequences_are_distinct_while_in_flight(table: PendingTable) {
        let (first, _) = table.insert(1, ignore()).expect("open");
        let (second, _) = table.insert(1, ignore()).expect("open");
        assert_ne!(first, second);
        assert_eq!(table.len(), 2);
    }

    #[rstest]
    fn wrapping_skips_zero_and_busy_sequences(table: PendingTable) {
        let (busy, _) = table.insert(1, ignore()).expect("open");
        assert_eq!(busy, 1);
        table.start_at(u32::MAX);

        let (last, _) = table.insert(1, ignore()).expect("open");
        let (wrapped, _) = table.insert(1, ignore()).expect("open");
        assert_eq!(last, u32::MAX);
        assert_eq!(wrapped, 2, "zero is reserved and one is still in flight");
    }

    #[rstest]
    fn stale_tickets_do_not_reap_reused_sequences(table: PendingTable) {
        let (sequence, stale) = table.insert(1, ignore()).expect("open");
        table.remove(sequence).expect("first call");
        table.start_at(sequence);
        let (reused, fresh) = table.insert(2, ignore()).expect("open");
        assert_eq!(reused, sequence);

        assert!(table.remove_if(sequence, stale).is_none());
        let call = table.remove_if(sequence, fresh).expect("current call");
        assert_eq!(call.command(), 2);
    }

    #[rstest]
    fn calls_resolve_exactly_once(table: PendingTable) {
        let (sequence, ticket) = table.insert(1, ignore()).expect("open");
        assert!(table.remove(sequence).is_some());
        assert!(table.remove(sequence).is_none());
        assert!(table.remove_if(sequence, ticket).is_none());
    }

    #[rstest]
    fn close_drains_and_refuses_new_calls(table: PendingTable) {
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&completed);
            table
                .insert(
                    1,
                    Box::new(move |_, result| {
                        assert!(matches!(result, Err(CallError::Shutdown)));
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .expect("open");
        }

        for (sequence, call) in table.close() {
            call.finish(sequence, Err(CallError::Shutdown));
        }
        assert_eq!(completed.load(Ordering::SeqCst), 3);
        assert_eq!(table.len(), 0);
        assert!(table.insert(1, ignore()).is_err());
    }
}
