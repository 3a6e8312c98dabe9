//! Capability interface to the message broker.
//!
//! The worker only needs to check that topics exist, publish a payload and wait
//! for its confirmation, and receive deliveries that it later acknowledges.
//! Anything that implements these traits can back the worker; [`memory`]
//! provides an in-process implementation.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Topic '{0}' does not exist")]
    TopicNotFound(String),
    #[error("Subscription '{0}' does not exist")]
    SubscriptionNotFound(String),
    #[error("Subscription '{0}' was closed")]
    SubscriptionClosed(String),
    #[error("Broker rejected the request: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Whether retrying the same request can never succeed without operator action.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BrokerError::TopicNotFound(_)
                | BrokerError::SubscriptionNotFound(_)
                | BrokerError::SubscriptionClosed(_)
        )
    }
}

/// A message as it sits in a subscription backlog.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub id: String,
    pub data: Vec<u8>,
    /// Number of times this message has been handed to a subscriber, starting at 1.
    pub delivery_attempt: u32,
}

/// Acknowledgment transport for a received message.
#[async_trait]
pub trait AckReply: Send + Sync {
    async fn ack(&self, message: BrokerMessage);

    async fn nack(&self, message: BrokerMessage);
}

/// A received message awaiting exactly one acknowledgment decision.
///
/// `ack` and `nack` consume the delivery, so a message cannot be settled twice.
pub struct Delivery {
    pub message: BrokerMessage,
    reply: Box<dyn AckReply>,
}

impl Delivery {
    pub fn new(message: BrokerMessage, reply: Box<dyn AckReply>) -> Self {
        Delivery { message, reply }
    }

    /// Removes the message from the subscription backlog.
    pub async fn ack(self) {
        self.reply.ack(self.message).await
    }

    /// Makes the message eligible for redelivery.
    pub async fn nack(self) {
        self.reply.nack(self.message).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.message.id)
            .field("bytes", &self.message.data.len())
            .field("delivery_attempt", &self.message.delivery_attempt)
            .finish()
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `data` and waits for the broker's confirmation, returning the message id.
    async fn publish(&self, data: Vec<u8>) -> Result<String, BrokerError>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Waits for the next delivery. Errors mean the subscription is unusable.
    async fn receive(&self) -> Result<Delivery, BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError>;

    fn publisher(&self, topic: &str) -> Arc<dyn Publisher>;

    fn subscriber(&self, subscription: &str) -> Arc<dyn Subscriber>;
}
