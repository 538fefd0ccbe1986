//! Escalation timers.
//!
//! Each active case has at most one timer. A timer never touches case state:
//! on expiry it posts [`Event::TimerFired`] into the dispatch queue, tagged
//! with a generation so fires belonging to a replaced or cancelled deadline
//! can be recognised and dropped.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::case::CaseId;
use crate::dispatch::Event;

/// One armed deadline.
#[derive(Debug)]
struct EscalationTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Timers for every active case, keyed by case.
#[derive(Debug)]
pub struct TimerSet {
    timers: HashMap<CaseId, EscalationTimer>,
    events: mpsc::Sender<Event>,
    timeout: Duration,
    next_generation: u64,
}

impl TimerSet {
    #[must_use]
    pub fn new(events: mpsc::Sender<Event>, timeout: Duration) -> Self {
        Self {
            timers: HashMap::new(),
            events,
            timeout,
            next_generation: 0,
        }
    }

    /// Start a fresh deadline for `case`, replacing any existing one.
    pub fn arm(&mut self, case: CaseId) -> u64 {
        self.cancel(case);

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if events
                .send(Event::TimerFired { case, generation })
                .await
                .is_err()
            {
                debug!(case = %case, "Dispatch queue closed, dropping timer fire");
            }
        });

        self.timers.insert(case, EscalationTimer { generation, handle });
        generation
    }

    /// Cancel the timer for `case`. Returns whether one was armed.
    pub fn cancel(&mut self, case: CaseId) -> bool {
        match self.timers.remove(&case) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fire. Returns `true` only for the current deadline of `case`;
    /// each deadline is accepted at most once.
    pub fn take_fire(&mut self, case: CaseId, generation: u64) -> bool {
        if self
            .timers
            .get(&case)
            .is_some_and(|t| t.generation == generation)
        {
            self.timers.remove(&case);
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    #[must_use]
    pub fn is_armed(&self, case: CaseId) -> bool {
        self.timers.contains_key(&case)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
