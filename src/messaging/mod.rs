//! Asynchronous messaging between agents and schedulers.
//!
//! Two queue families carry three message types:
//!
//! - the region-global scheduler queue (`flotilla-<environment>-scheduler`)
//!   receives [`Message::Reschedule`] and [`Message::ServiceFailure`] from
//!   agents;
//! - one queue per service (`flotilla-<environment>-<service>`) receives
//!   [`Message::DeployLockReleased`] so a waiting agent can retry its
//!   assignment without waiting a full tick.
//!
//! Queues are best effort and at-least-once. A message is deleted after its
//! handler returns regardless of outcome; correctness comes from handler
//! idempotence, not from the queue. Malformed bodies are deleted without
//! processing, unknown types are logged and deleted.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Messaging errors
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl MessagingError {
    pub fn backend(reason: impl std::fmt::Display) -> Self {
        Self::Backend(reason.to_string())
    }
}

/// Typed message bodies. JSON on the wire with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Agent asks the scheduler to re-balance a service now
    Reschedule { service: String },

    /// Agent reports a revision it could not deploy
    ServiceFailure {
        service: String,
        revision: String,
        instance: String,
    },

    /// A deploy lock was released; waiting agents may retry
    DeployLockReleased,
}

impl Message {
    /// Serialize for the wire.
    pub fn to_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outcome of parsing a received body.
#[derive(Debug)]
pub enum ParsedMessage {
    Known(Message),
    /// Valid JSON with an unrecognized `type`
    Unknown(String),
    /// Not valid JSON, or no `type` field
    Malformed,
}

/// Parse a wire body, distinguishing unknown types from garbage.
pub fn parse_message(body: &str) -> ParsedMessage {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return ParsedMessage::Malformed,
    };
    let msg_type = match value.get("type").and_then(|t| t.as_str()) {
        Some(msg_type) => msg_type.to_string(),
        None => return ParsedMessage::Malformed,
    };
    match serde_json::from_value(value) {
        Ok(message) => ParsedMessage::Known(message),
        // A known type with bad fields is garbage, not a newer protocol.
        Err(_) if KNOWN_TYPES.contains(&msg_type.as_str()) => ParsedMessage::Malformed,
        Err(_) => ParsedMessage::Unknown(msg_type),
    }
}

const KNOWN_TYPES: [&str; 3] = ["Reschedule", "ServiceFailure", "DeployLockReleased"];

/// A message pulled off a queue, with the handle needed to delete it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub handle: String,
}

/// Best-effort queue contract: long-poll receive, explicit delete.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name, for logs.
    fn name(&self) -> &str;

    /// Enqueue a body.
    async fn send(&self, body: &str) -> MessagingResult<()>;

    /// Receive up to `max` messages, waiting up to `wait` for the first.
    async fn receive(&self, wait: Duration, max: usize) -> MessagingResult<Vec<ReceivedMessage>>;

    /// Delete a received message so it is not redelivered.
    async fn delete(&self, handle: &str) -> MessagingResult<()>;
}

/// Region-global scheduler queue name.
pub fn scheduler_queue_name(environment: Option<&str>) -> String {
    match environment {
        Some(env) => format!("flotilla-{env}-scheduler"),
        None => "flotilla-scheduler".to_string(),
    }
}

/// Per-service queue name.
pub fn service_queue_name(environment: Option<&str>, service: &str) -> String {
    match environment {
        Some(env) => format!("flotilla-{env}-{service}"),
        None => format!("flotilla-{service}"),
    }
}
