//! # Keyed Debouncer
//!
//! Holds back values for a short window and coalesces repeats that share a
//! key, so only the last value per key is emitted.
//!
//! ```text
//!   t=0    schedule("nodes:n1:update", A)   ── timer 300ms
//!   t=100  schedule("nodes:n1:update", B)   ── A dropped, timer restarted
//!   t=150  schedule("nodes:n2:update", C)   ── independent key, own timer
//!   t=400  C emitted
//!   t=450  B emitted
//! ```
//!
//! Emitted values are sent on an mpsc channel owned by the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

struct Slot<T> {
    value: T,
    generation: u64,
    timer: AbortHandle,
}

struct Slots<T> {
    next_generation: u64,
    by_key: HashMap<String, Slot<T>>,
}

/// Per-key trailing-edge debouncer.
pub struct Debouncer<T> {
    delay: Duration,
    slots: Arc<Mutex<Slots<T>>>,
    output: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(delay: Duration, output: mpsc::UnboundedSender<T>) -> Self {
        Debouncer {
            delay,
            slots: Arc::new(Mutex::new(Slots {
                next_generation: 0,
                by_key: HashMap::new(),
            })),
            output,
        }
    }

    /// Schedules `value` under `key`, replacing any value still waiting
    /// there. Returns true if an earlier value was coalesced away.
    pub fn schedule(&self, key: String, value: T) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = slots.next_generation;
        slots.next_generation += 1;

        let timer_slots = self.slots.clone();
        let timer_key = key.clone();
        let output = self.output.clone();
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = {
                let mut slots = timer_slots.lock().unwrap_or_else(PoisonError::into_inner);
                match slots.by_key.get(&timer_key) {
                    Some(slot) if slot.generation == generation => slots.by_key.remove(&timer_key),
                    _ => None,
                }
            };
            if let Some(slot) = fired {
                trace!(key = %timer_key, "Debounce window elapsed");
                // Receiver gone means the owner shut down; the value is
                // recovered through `flush` in that case.
                let _ = output.send(slot.value);
            }
        });

        let previous = slots.by_key.insert(
            key,
            Slot {
                value,
                generation,
                timer: timer.abort_handle(),
            },
        );

        match previous {
            Some(previous) => {
                previous.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels and returns every waiting value whose value matches `pred`.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<String> = slots
            .by_key
            .iter()
            .filter(|(_, slot)| pred(&slot.value))
            .map(|(key, _)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| slots.by_key.remove(&key))
            .map(|slot| {
                slot.timer.abort();
                slot.value
            })
            .collect()
    }

    /// Cancels every timer and returns the waiting values.
    pub fn flush(&self) -> Vec<T> {
        self.remove_where(|_| true)
    }

    /// Values currently waiting.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_key
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
