//! Receive loop that fans deliveries out to concurrently running handlers.
//!
//! Each delivery gets its own task, so handlers overlap with each other and with
//! the loop, and acknowledgments can happen in any order. The number of running
//! handlers is capped by `max_in_flight`; at the cap the loop stops receiving
//! until one finishes. Stopping the worker ends the receive loop and waits for
//! every running handler before `run` returns.

use crate::broker::{Broker, BrokerError, Delivery, Subscriber};
use crate::handler::{
    config::WorkerConfig,
    indicator_handler::{HandlerOutcome, IndicatorHandler},
};
use async_std::{
    channel::{bounded, Receiver, Sender},
    sync::Arc,
    task,
};
use futures::{select, stream::FuturesUnordered, FutureExt, StreamExt};
use pin_utils::pin_mut;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{role} topic '{topic}' does not exist")]
    MissingTopic { role: &'static str, topic: String },
    #[error("Error checking topic existence: {0}")]
    Broker(#[from] BrokerError),
    #[error("Error receiving messages: {0}")]
    FatalSubscription(#[source] BrokerError),
    #[error("Worker was already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Receiving = 1,
    Draining = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Receiving,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

/// Point-in-time copy of the worker's message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
}

pub struct Worker {
    subscriber: Arc<dyn Subscriber>,
    handler: Arc<IndicatorHandler>,
    config: WorkerConfig,
    state: AtomicU8,
    stats: Arc<WorkerStats>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl Worker {
    /// Binds a worker to the configured subscription and result topic.
    ///
    /// Both topics must already exist; nothing is created on the broker.
    #[instrument(skip(broker, config), fields(subscription = %config.subscription))]
    pub async fn connect<B>(broker: &B, config: WorkerConfig) -> Result<Self, WorkerError>
    where
        B: Broker + ?Sized,
    {
        for (role, topic) in [("Task", &config.task_topic), ("Result", &config.result_topic)] {
            if !broker.topic_exists(topic).await? {
                return Err(WorkerError::MissingTopic {
                    role,
                    topic: topic.clone(),
                });
            }
            debug!("{} topic '{}' exists", role, topic);
        }

        let handler = IndicatorHandler::new(broker.publisher(&config.result_topic));
        let subscriber = broker.subscriber(&config.subscription);
        let (stop_tx, stop_rx) = bounded(1);

        Ok(Worker {
            subscriber,
            handler: Arc::new(handler),
            config,
            state: AtomicU8::new(WorkerState::Idle as u8),
            stats: Arc::new(WorkerStats::default()),
            stop_tx,
            stop_rx,
        })
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.stats.received.load(Ordering::SeqCst),
            acked: self.stats.acked.load(Ordering::SeqCst),
            nacked: self.stats.nacked.load(Ordering::SeqCst),
        }
    }

    /// Asks the receive loop to stop accepting deliveries. Safe to call more than once.
    pub fn stop(&self) {
        if self.stop_tx.close() {
            info!("Stop requested for subscription {}", self.config.subscription);
        }
    }

    /// Receives and dispatches deliveries until stopped or the subscription fails.
    ///
    /// Returns the final counters after all in-flight handlers have settled. A
    /// receive error returns immediately without draining.
    pub async fn run(&self) -> Result<StatsSnapshot, WorkerError> {
        if self
            .state
            .compare_exchange(
                WorkerState::Idle as u8,
                WorkerState::Receiving as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(WorkerError::AlreadyStarted);
        }

        info!(
            "Receiving from subscription {} (max in flight: {})",
            self.config.subscription,
            match self.config.max_in_flight {
                0 => "unbounded".to_string(),
                n => n.to_string(),
            }
        );

        let mut in_flight: FuturesUnordered<task::JoinHandle<()>> = FuturesUnordered::new();

        loop {
            while let Some(Some(())) = in_flight.next().now_or_never() {}

            if self.at_capacity(in_flight.len()) {
                debug!(
                    "{} handlers in flight, waiting for one to finish",
                    in_flight.len()
                );
                let stop = self.stop_rx.recv().fuse();
                pin_mut!(stop);
                select! {
                    _ = in_flight.next() => continue,
                    _ = stop => break,
                }
            }

            let received = {
                let receive = self.subscriber.receive().fuse();
                let stop = self.stop_rx.recv().fuse();
                pin_mut!(receive, stop);
                select! {
                    received = receive => received,
                    _ = stop => break,
                }
            };

            let delivery = match received {
                Ok(delivery) => delivery,
                Err(e) => {
                    self.set_state(WorkerState::Stopped);
                    error!("Error receiving messages: {}", e);
                    return Err(WorkerError::FatalSubscription(e));
                }
            };

            let count = self.stats.received.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Dispatching {:?}, received so far: {}", delivery, count);

            in_flight.push(task::spawn(dispatch(
                Arc::clone(&self.handler),
                delivery,
                Arc::clone(&self.stats),
            )));
        }

        self.set_state(WorkerState::Draining);
        info!("Draining {} in-flight handler(s)", in_flight.len());
        while in_flight.next().await.is_some() {}
        self.set_state(WorkerState::Stopped);

        let stats = self.stats();
        info!(
            "Worker stopped: received {}, acked {}, nacked {}",
            stats.received, stats.acked, stats.nacked
        );

        Ok(stats)
    }

    fn at_capacity(&self, in_flight: usize) -> bool {
        self.config.max_in_flight > 0 && in_flight >= self.config.max_in_flight
    }

    fn set_state(&self, state: WorkerState) {
        debug!("Worker state -> {:?}", state);
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("subscription", &self.config.subscription)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Runs the handler for one delivery and settles it with exactly one ack or nack.
#[instrument(skip_all, fields(message_id = %delivery.message.id, attempt = delivery.message.delivery_attempt))]
async fn dispatch(
    handler: Arc<IndicatorHandler>,
    delivery: Delivery,
    stats: Arc<WorkerStats>,
) {
    match handler.handle(&delivery.message.data).await {
        HandlerOutcome::Success { .. } => {
            delivery.ack().await;
            stats.acked.fetch_add(1, Ordering::SeqCst);
        }
        // the handler has already logged the cause
        HandlerOutcome::Retryable(e) | HandlerOutcome::Fatal(e) => {
            debug!("Nacking: {}", e);
            delivery.nack().await;
            stats.nacked.fetch_add(1, Ordering::SeqCst);
        }
    }
}
