//! Correlation table: matches asynchronous replies to the call waiting for them.
//!
//! Ids are handed out from a cycling counter in `1..capacity`. Id 0 is the
//! new-request sentinel and is never allocated. An id is only reused after
//! the entry holding it has been released, which happens when the
//! [`Entry`] is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Error, Result};
use crate::packet::{Delivery, Header};

/// Deliveries an entry can hold before the listener starts dropping
const HANDOFF_DEPTH: usize = 4;

/// Where an exchange is in its ACK-then-response sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingAck,
    AwaitingResponse,
}

/// Result of handing a delivery to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// No outstanding entry has that id: late, duplicate or foreign
    Unknown,
    /// The entry exists but is not expecting this kind of delivery
    OutOfPhase,
    /// An ACK or reject is already queued; the entry only needs one
    Duplicate,
    /// The entry's handoff channel is full
    Full,
}

struct Slot {
    generation: u64,
    phase: Phase,
    expects_response: bool,
    /// An ACK or reject has been queued. Later ones are dropped so they
    /// cannot crowd the response out of the handoff channel.
    control_queued: bool,
    tx: mpsc::Sender<Delivery>,
}

struct Inner {
    next: u32,
    generation: u64,
    slots: HashMap<u32, Slot>,
}

/// Shared table of outstanding exchanges
#[derive(Clone)]
pub struct CorrelationTable {
    capacity: u32,
    inner: Arc<Mutex<Inner>>,
}

impl CorrelationTable {
    /// Create a table whose ids cycle through `1..capacity`
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity.max(2),
            inner: Arc::new(Mutex::new(Inner {
                next: 1,
                generation: 0,
                slots: HashMap::new(),
            })),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Allocate an entry for an exchange that only waits for an ACK
    ///
    /// Returns the entry and the header to put on the wire: the new id as
    /// sender, `target_hint` as target (0 for a fresh call, the remote's id
    /// when answering one of its requests).
    pub fn allocate(&self, target_hint: u32) -> Result<(Entry, Header)> {
        self.insert(target_hint, false)
    }

    /// Allocate an entry that waits for an ACK and then a response payload
    pub fn allocate_exchange(&self, target_hint: u32) -> Result<(Entry, Header)> {
        self.insert(target_hint, true)
    }

    fn insert(&self, target_hint: u32, expects_response: bool) -> Result<(Entry, Header)> {
        let mut inner = self.lock();

        let mut id = None;
        for _ in 1..self.capacity {
            let candidate = inner.next;
            inner.next += 1;
            if inner.next == self.capacity {
                inner.next = 1;
            }
            if !inner.slots.contains_key(&candidate) {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or(Error::TableExhausted {
            capacity: self.capacity,
        })?;

        inner.generation += 1;
        let generation = inner.generation;
        let (tx, rx) = mpsc::channel(HANDOFF_DEPTH);
        inner.slots.insert(
            id,
            Slot {
                generation,
                phase: Phase::AwaitingAck,
                expects_response,
                control_queued: false,
                tx,
            },
        );

        let entry = Entry {
            id,
            generation,
            rx,
            held: None,
            table: self.clone(),
        };
        Ok((entry, Header::new(target_hint, id)))
    }

    /// Hand a delivery to the entry with the given id without blocking
    pub fn dispatch(&self, id: u32, delivery: Delivery) -> DispatchOutcome {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(&id) else {
            tracing::trace!(id, kind = delivery.kind(), "dispatch to unknown id");
            return DispatchOutcome::Unknown;
        };

        let accepted = match (&delivery, slot.phase) {
            (Delivery::Payload(_), _) => slot.expects_response,
            (Delivery::Ack | Delivery::Reject, phase) => phase == Phase::AwaitingAck,
        };
        if !accepted {
            tracing::debug!(id, kind = delivery.kind(), phase = ?slot.phase, "out of phase delivery dropped");
            return DispatchOutcome::OutOfPhase;
        }

        let control = !matches!(delivery, Delivery::Payload(_));
        if control && slot.control_queued {
            tracing::trace!(id, kind = delivery.kind(), "duplicate control delivery dropped");
            return DispatchOutcome::Duplicate;
        }

        match slot.tx.try_send(delivery) {
            Ok(()) => {
                slot.control_queued |= control;
                DispatchOutcome::Delivered
            }
            Err(TrySendError::Full(delivery)) => {
                tracing::debug!(id, kind = delivery.kind(), "handoff full, delivery dropped");
                DispatchOutcome::Full
            }
            Err(TrySendError::Closed(_)) => DispatchOutcome::Unknown,
        }
    }

    /// Retire an entry, making its id eligible for reuse
    pub fn release(&self, entry: Entry) {
        drop(entry);
    }

    /// Number of outstanding entries
    pub fn outstanding(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().slots.contains_key(&id)
    }

    fn set_phase(&self, id: u32, generation: u64, phase: Phase) {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.get_mut(&id) {
            if slot.generation == generation {
                slot.phase = phase;
            }
        }
    }

    fn retire(&self, id: u32, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.slots.get(&id) {
            Some(slot) if slot.generation == generation => {
                inner.slots.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock is still safe to use.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One outstanding exchange; released from the table on drop
pub struct Entry {
    id: u32,
    generation: u64,
    rx: mpsc::Receiver<Delivery>,
    held: Option<Vec<u8>>,
    table: CorrelationTable,
}

impl Entry {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the next delivery; `None` only if the table dropped the slot
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Move from the ACK phase to the response phase
    pub fn advance(&self) {
        self.table
            .set_phase(self.id, self.generation, Phase::AwaitingResponse);
    }

    /// Keep a response payload that arrived before the ACK
    pub(crate) fn hold(&mut self, payload: Vec<u8>) {
        self.held = Some(payload);
    }

    pub(crate) fn take_held(&mut self) -> Option<Vec<u8>> {
        self.held.take()
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.table.retire(self.id, self.generation);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
