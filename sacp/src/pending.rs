//! Fixed-capacity table of in-flight requests, indexed by sequence id.
//!
//! Slot `i` holds the request whose sequence id is congruent to `i` modulo
//! the capacity. Sequence ids are handed out in order and skip any id whose
//! slot is still busy, so two in-flight requests never share an id.

use tokio::sync::oneshot;

use crate::{CommandPair, Error, Packet, Result};

/// Slots in the table. Divides 2^16 so sequence wrap-around keeps the
/// id-to-slot mapping stable.
pub(crate) const CAPACITY: usize = 256;

pub(crate) struct Pending {
    pub(crate) sequence: u16,
    pub(crate) command: CommandPair,
    pub(crate) created_at: tokio::time::Instant,
    pub(crate) reply: oneshot::Sender<Result<Packet>>,
}

pub(crate) struct PendingTable {
    slots: Vec<Option<Pending>>,
    next_sequence: u16,
    in_flight: usize,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..CAPACITY).map(|_| None).collect(),
            next_sequence: 0,
            in_flight: 0,
        }
    }

    fn slot(sequence: u16) -> usize {
        sequence as usize % CAPACITY
    }

    /// Register a request and return its freshly allocated sequence id.
    pub(crate) fn insert(&mut self, command: CommandPair, reply: oneshot::Sender<Result<Packet>>) -> Result<u16> {
        if self.in_flight >= CAPACITY {
            return Err(Error::TooManyInFlight);
        }

        loop {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);

            let slot = &mut self.slots[Self::slot(sequence)];
            if slot.is_none() {
                *slot = Some(Pending {
                    sequence,
                    command,
                    created_at: tokio::time::Instant::now(),
                    reply,
                });
                self.in_flight += 1;
                return Ok(sequence);
            }
        }
    }

    /// Remove and return the request with this exact sequence id.
    pub(crate) fn take(&mut self, sequence: u16) -> Option<Pending> {
        let slot = &mut self.slots[Self::slot(sequence)];
        match slot {
            Some(pending) if pending.sequence == sequence => {
                self.in_flight -= 1;
                slot.take()
            }
            _ => None,
        }
    }

    /// Put back a request that was taken by mistake.
    pub(crate) fn restore(&mut self, pending: Pending) {
        let slot = &mut self.slots[Self::slot(pending.sequence)];
        if slot.is_none() {
            *slot = Some(pending);
            self.in_flight += 1;
        }
    }

    /// Remove every request.
    pub(crate) fn drain(&mut self) -> Vec<Pending> {
        self.in_flight = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.in_flight
    }
}
