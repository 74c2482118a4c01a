//! In-memory message queue.
//!
//! Test substrate with the same at-least-once contract as the Redis queue:
//! received messages move to an in-flight set and are redelivered if never
//! deleted.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use super::{MessageQueue, MessagingResult, ReceivedMessage};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, String)>,
    in_flight: HashMap<u64, String>,
    next_id: u64,
}

/// Process-local queue.
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Messages received but never deleted, for tests.
    pub fn in_flight(&self) -> usize {
        self.state.lock().expect("queue state poisoned").in_flight.len()
    }

    /// Put every in-flight message back on the queue, simulating a consumer
    /// crash and visibility timeout.
    pub fn redeliver_in_flight(&self) {
        let mut state = self.state.lock().expect("queue state poisoned");
        let in_flight: Vec<(u64, String)> = state.in_flight.drain().collect();
        for entry in in_flight {
            state.ready.push_back(entry);
        }
        drop(state);
        self.notify.notify_one();
    }

    fn drain(&self, max: usize) -> Vec<ReceivedMessage> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let mut received = Vec::new();
        while received.len() < max {
            let (id, body) = match state.ready.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            state.in_flight.insert(id, body.clone());
            received.push(ReceivedMessage {
                body,
                handle: id.to_string(),
            });
        }
        received
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> MessagingResult<()> {
        {
            let mut state = self.state.lock().expect("queue state poisoned");
            let id = state.next_id;
            state.next_id += 1;
            state.ready.push_back((id, body.to_string()));
        }
        // notify_one stores a permit, so a send racing ahead of the
        // receiver's registration is not lost.
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration, max: usize) -> MessagingResult<Vec<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let received = self.drain(max);
            if !received.is_empty() {
                return Ok(received);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete(&self, handle: &str) -> MessagingResult<()> {
        if let Ok(id) = handle.parse::<u64>() {
            self.state
                .lock()
                .expect("queue state poisoned")
                .in_flight
                .remove(&id);
        }
        Ok(())
    }
}
