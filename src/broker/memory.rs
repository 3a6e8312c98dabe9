//! In-process broker with pub/sub semantics.
//!
//! Topics fan out every published message to each attached subscription.
//! Subscriptions hold their own backlog; a nack puts the message back on the
//! backlog until it has been delivered `max_delivery_attempts` times, after which
//! it is moved to the subscription's dead letters. Deleting a subscription
//! closes its backlog, which wakes any waiting receiver with an error.

use super::{AckReply, Broker, BrokerError, BrokerMessage, Delivery, Publisher, Subscriber};
use async_std::{
    channel::{unbounded, Receiver, Sender},
    sync::{Arc, Mutex, RwLock},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    topology: RwLock<Topology>,
    next_id: AtomicU64,
    /// Zero disables dead-lettering.
    max_delivery_attempts: u32,
}

#[derive(Debug, Default)]
struct Topology {
    /// Topic name -> names of attached subscriptions.
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, Arc<SubscriptionQueue>>,
}

#[derive(Debug)]
struct SubscriptionQueue {
    name: String,
    sender: Sender<BrokerMessage>,
    receiver: Receiver<BrokerMessage>,
    dead_letters: Mutex<Vec<BrokerMessage>>,
    max_delivery_attempts: u32,
}

impl InMemoryBroker {
    pub fn new(max_delivery_attempts: u32) -> Self {
        InMemoryBroker {
            shared: Arc::new(Shared {
                topology: RwLock::new(Topology::default()),
                next_id: AtomicU64::new(1),
                max_delivery_attempts,
            }),
        }
    }

    pub async fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topology = self.shared.topology.write().await;
        if topology.topics.contains_key(topic) {
            return Err(BrokerError::Rejected(format!(
                "topic '{}' already exists",
                topic
            )));
        }
        topology.topics.insert(topic.to_string(), Vec::new());
        info!("Created topic: {}", topic);
        Ok(())
    }

    /// Removes a topic. Attached subscriptions keep their backlog but receive nothing new.
    pub async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topology = self.shared.topology.write().await;
        topology
            .topics
            .remove(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        info!("Deleted topic: {}", topic);
        Ok(())
    }

    pub async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
    ) -> Result<(), BrokerError> {
        let mut topology = self.shared.topology.write().await;
        if topology.subscriptions.contains_key(subscription) {
            return Err(BrokerError::Rejected(format!(
                "subscription '{}' already exists",
                subscription
            )));
        }

        let attached = topology
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        attached.push(subscription.to_string());

        let (sender, receiver) = unbounded();
        topology.subscriptions.insert(
            subscription.to_string(),
            Arc::new(SubscriptionQueue {
                name: subscription.to_string(),
                sender,
                receiver,
                dead_letters: Mutex::new(Vec::new()),
                max_delivery_attempts: self.shared.max_delivery_attempts,
            }),
        );
        info!("Created subscription {} on topic {}", subscription, topic);
        Ok(())
    }

    /// Removes a subscription and closes its backlog.
    pub async fn delete_subscription(&self, subscription: &str) -> Result<(), BrokerError> {
        let mut topology = self.shared.topology.write().await;
        let queue = topology
            .subscriptions
            .remove(subscription)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(subscription.to_string()))?;
        for attached in topology.topics.values_mut() {
            attached.retain(|name| name != subscription);
        }
        queue.sender.close();
        info!("Deleted subscription: {}", subscription);
        Ok(())
    }

    /// Number of messages waiting to be delivered on a subscription.
    pub async fn backlog(&self, subscription: &str) -> Option<usize> {
        let topology = self.shared.topology.read().await;
        topology
            .subscriptions
            .get(subscription)
            .map(|queue| queue.receiver.len())
    }

    /// Messages that exhausted their delivery attempts on a subscription.
    pub async fn dead_letters(&self, subscription: &str) -> Vec<BrokerMessage> {
        let queue = {
            let topology = self.shared.topology.read().await;
            topology.subscriptions.get(subscription).cloned()
        };
        match queue {
            Some(queue) => queue.dead_letters.lock().await.clone(),
            None => Vec::new(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        Ok(self.shared.topology.read().await.topics.contains_key(topic))
    }

    fn publisher(&self, topic: &str) -> Arc<dyn Publisher> {
        Arc::new(MemoryPublisher {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
        })
    }

    fn subscriber(&self, subscription: &str) -> Arc<dyn Subscriber> {
        Arc::new(MemorySubscriber {
            shared: Arc::clone(&self.shared),
            subscription: subscription.to_string(),
        })
    }
}

struct MemoryPublisher {
    shared: Arc<Shared>,
    topic: String,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, data: Vec<u8>) -> Result<String, BrokerError> {
        let topology = self.shared.topology.read().await;
        let attached = topology
            .topics
            .get(&self.topic)
            .ok_or_else(|| BrokerError::TopicNotFound(self.topic.clone()))?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        for name in attached {
            if let Some(queue) = topology.subscriptions.get(name) {
                let message = BrokerMessage {
                    id: id.clone(),
                    data: data.clone(),
                    delivery_attempt: 0,
                };
                if queue.sender.try_send(message).is_err() {
                    debug!("Subscription {} closed, dropping message {}", name, id);
                }
            }
        }

        debug!(
            "Published message {} ({} bytes) on {} to {} subscription(s)",
            id,
            data.len(),
            self.topic,
            attached.len()
        );
        Ok(id)
    }
}

struct MemorySubscriber {
    shared: Arc<Shared>,
    subscription: String,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn receive(&self) -> Result<Delivery, BrokerError> {
        let queue = {
            let topology = self.shared.topology.read().await;
            topology.subscriptions.get(&self.subscription).cloned()
        }
        .ok_or_else(|| BrokerError::SubscriptionNotFound(self.subscription.clone()))?;

        let mut message = queue
            .receiver
            .recv()
            .await
            .map_err(|_| BrokerError::SubscriptionClosed(self.subscription.clone()))?;
        message.delivery_attempt += 1;

        debug!(
            "Delivering message {} from {} (attempt {})",
            message.id, queue.name, message.delivery_attempt
        );
        Ok(Delivery::new(message, Box::new(MemoryReply { queue })))
    }
}

struct MemoryReply {
    queue: Arc<SubscriptionQueue>,
}

#[async_trait]
impl AckReply for MemoryReply {
    async fn ack(&self, message: BrokerMessage) {
        debug!("Message {} acknowledged on {}", message.id, self.queue.name);
    }

    async fn nack(&self, message: BrokerMessage) {
        let max = self.queue.max_delivery_attempts;
        if max > 0 && message.delivery_attempt >= max {
            warn!(
                "Message {} on {} exhausted {} delivery attempts, dead-lettering",
                message.id, self.queue.name, max
            );
            self.queue.dead_letters.lock().await.push(message);
            return;
        }

        debug!(
            "Message {} negatively acknowledged on {}, requeueing",
            message.id, self.queue.name
        );
        if self.queue.sender.try_send(message).is_err() {
            debug!("Subscription {} closed, dropping nacked message", self.queue.name);
        }
    }
}
