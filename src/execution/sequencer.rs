//! Reordering of records after a parallel stage
//!
//! Records are buffered sorted by `sequence_start` and released only when
//! the head is the next expected sequence number. A permanently missing
//! sequence number holds everything behind it; the stall surfaces upstream
//! as backpressure.

use crate::core::record::Record;
use crate::execution::stage::{forward, next_record, Inbound, Outbound, StageContext};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Pure sequencing state
#[derive(Debug, Default)]
pub struct Sequencer {
    pending: VecDeque<Record>,
    next_expected: u64,
}

impl Sequencer {
    /// Sequencer expecting `first` as the first sequence number
    pub fn new(first: u64) -> Self {
        Self {
            pending: VecDeque::new(),
            next_expected: first,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of records waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept one record; returns the records now ready, in order
    ///
    /// A record starting below `next_expected` can never reach the head of
    /// the queue. It is returned at once with a warning instead of being
    /// held until shutdown (see "Stale record in the sequencer" in
    /// DESIGN.md).
    pub fn push(&mut self, record: Record) -> Vec<Record> {
        if record.sequence_start < self.next_expected {
            warn!(
                id = %record.id(),
                next_expected = self.next_expected,
                "record arrived after its sequence range was released"
            );
            return vec![record];
        }

        let at = self
            .pending
            .partition_point(|r| r.sequence_start <= record.sequence_start);
        self.pending.insert(at, record);

        let mut ready = Vec::new();
        while self
            .pending
            .front()
            .is_some_and(|head| head.sequence_start == self.next_expected)
        {
            if let Some(head) = self.pending.pop_front() {
                self.next_expected = head.sequence_end + 1;
                ready.push(head);
            }
        }
        ready
    }
}

/// Stage loop around [`Sequencer`]
pub async fn run_sequence_stage(ctx: &StageContext, inbound: &Inbound, outbound: &Outbound) {
    let mut sequencer = Sequencer::new(0);

    while let Some(record) = next_record(inbound, &ctx.cancel).await {
        for ready in sequencer.push(record) {
            debug!(
                id = %ready.id(),
                sequence_start = ready.sequence_start,
                sequence_end = ready.sequence_end,
                "record sequenced"
            );
            if !forward(ctx, outbound, ready).await {
                return;
            }
        }
    }

    if sequencer.pending() > 0 {
        warn!(
            pending = sequencer.pending(),
            next_expected = sequencer.next_expected(),
            "inbound closed with records still waiting for a missing sequence number"
        );
    }
}
