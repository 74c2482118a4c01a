//! Agent-side messaging.
//!
//! Sends `Reschedule` and `ServiceFailure` to the region's scheduler queue
//! and `DeployLockReleased` to the per-service queue; consumes the
//! per-service queue so a waiting agent retries as soon as a peer finishes
//! deploying.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::messaging::{parse_message, Message, MessageQueue, MessagingResult, ParsedMessage};

const RECEIVE_WAIT: Duration = Duration::from_secs(20);
const RECEIVE_BATCH: usize = 10;

/// Messaging client for one agent.
pub struct AgentMessaging {
    service: String,
    instance_id: String,
    scheduler_queue: Arc<dyn MessageQueue>,
    service_queue: Arc<dyn MessageQueue>,
}

impl AgentMessaging {
    pub fn new(
        service: impl Into<String>,
        instance_id: impl Into<String>,
        scheduler_queue: Arc<dyn MessageQueue>,
        service_queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            service: service.into(),
            instance_id: instance_id.into(),
            scheduler_queue,
            service_queue,
        }
    }

    /// Ask the scheduler to consider this service now.
    pub async fn reschedule(&self) -> MessagingResult<()> {
        let message = Message::Reschedule {
            service: self.service.clone(),
        };
        self.scheduler_queue.send(&message.to_body()).await
    }

    /// Report a revision this instance could not deploy.
    pub async fn service_failure(&self, rev_hash: &str) -> MessagingResult<()> {
        let message = Message::ServiceFailure {
            service: self.service.clone(),
            revision: rev_hash.to_string(),
            instance: self.instance_id.clone(),
        };
        self.scheduler_queue.send(&message.to_body()).await
    }

    /// Tell peers the deploy lock is free.
    pub async fn deploy_lock_released(&self) -> MessagingResult<()> {
        self.service_queue
            .send(&Message::DeployLockReleased.to_body())
            .await
    }

    /// One receive pass on the service queue. Returns whether a
    /// `DeployLockReleased` arrived; everything received is deleted.
    pub async fn receive_lock_released(&self) -> bool {
        let messages = match self.service_queue.receive(RECEIVE_WAIT, RECEIVE_BATCH).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(queue = %self.service_queue.name(), error = %e, "Receive failed");
                return false;
            }
        };

        let mut lock_released = false;
        for message in messages {
            match parse_message(&message.body) {
                ParsedMessage::Known(Message::DeployLockReleased) => {
                    debug!(service = %self.service, "Deploy lock released");
                    lock_released = true;
                }
                ParsedMessage::Known(other) => {
                    warn!(message = ?other, "Unexpected message on service queue");
                }
                ParsedMessage::Unknown(msg_type) => {
                    warn!(msg_type = %msg_type, "Unknown message");
                }
                ParsedMessage::Malformed => {
                    warn!("Invalid message");
                }
            }
            if let Err(e) = self.service_queue.delete(&message.handle).await {
                warn!(queue = %self.service_queue.name(), error = %e, "Delete failed");
            }
        }
        lock_released
    }
}
