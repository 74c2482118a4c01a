//! Scheduler-side queue consumer.
//!
//! Long-polls the region queue and dispatches `Reschedule` to the balance
//! loop and `ServiceFailure` to the doctor. Every message is deleted after
//! its handler returns; the handlers are idempotent, so redelivery is
//! harmless.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::messaging::{parse_message, Message, MessageQueue, ParsedMessage};

use super::balance::Scheduler;
use super::doctor::ServiceDoctor;

const RECEIVE_WAIT: Duration = Duration::from_secs(20);
const RECEIVE_BATCH: usize = 10;

/// Consumes the region-global scheduler queue.
pub struct SchedulerMessaging {
    queue: Arc<dyn MessageQueue>,
    scheduler: Arc<Scheduler>,
    doctor: Arc<ServiceDoctor>,
}

impl SchedulerMessaging {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        scheduler: Arc<Scheduler>,
        doctor: Arc<ServiceDoctor>,
    ) -> Self {
        Self {
            queue,
            scheduler,
            doctor,
        }
    }

    /// One receive pass: long-poll, handle, delete.
    pub async fn receive(&self) {
        let messages = match self.queue.receive(RECEIVE_WAIT, RECEIVE_BATCH).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(queue = %self.queue.name(), error = %e, "Receive failed");
                return;
            }
        };

        for message in messages {
            match parse_message(&message.body) {
                ParsedMessage::Known(Message::Reschedule { service }) => {
                    debug!(service = %service, "Service reschedule");
                    if let Err(e) = self.scheduler.schedule_service(&service).await {
                        warn!(service = %service, error = %e, "Reschedule failed");
                    }
                }
                ParsedMessage::Known(Message::ServiceFailure {
                    service,
                    revision,
                    instance,
                }) => {
                    if let Err(e) = self
                        .doctor
                        .failed_revision(&service, &revision, &instance)
                        .await
                    {
                        warn!(service = %service, revision = %revision, error = %e, "Diagnosis failed");
                    }
                }
                ParsedMessage::Known(Message::DeployLockReleased) => {
                    debug!("DeployLockReleased on the scheduler queue, ignoring");
                }
                ParsedMessage::Unknown(msg_type) => {
                    warn!(msg_type = %msg_type, "Unknown message");
                }
                ParsedMessage::Malformed => {
                    warn!("Invalid message");
                }
            }

            if let Err(e) = self.queue.delete(&message.handle).await {
                warn!(queue = %self.queue.name(), error = %e, "Delete failed");
            }
        }
    }
}
