use async_std::{
    future::timeout,
    sync::Arc,
    task::{self, JoinHandle},
};
use async_trait::async_trait;
use pubsub_indicator_worker::{
    broker::{memory::InMemoryBroker, Broker, BrokerError, Publisher, Subscriber},
    handler::{
        codec::{decode_result, encode_task, IndicatorResult, Task},
        config::WorkerConfig,
        indicators::{compute_rsi, compute_sma},
        worker::{StatsSnapshot, Worker, WorkerError, WorkerState},
    },
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

const SETTLE: Duration = Duration::from_secs(5);

fn config(max_in_flight: usize, max_delivery_attempts: u32) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.max_in_flight = max_in_flight;
    config.emulator.max_delivery_attempts = max_delivery_attempts;
    config
}

async fn provisioned(config: &WorkerConfig) -> InMemoryBroker {
    let broker = InMemoryBroker::new(config.emulator.max_delivery_attempts);
    broker.create_topic(&config.task_topic).await.unwrap();
    broker.create_topic(&config.result_topic).await.unwrap();
    broker
        .create_subscription(&config.subscription, &config.task_topic)
        .await
        .unwrap();
    broker
        .create_subscription(&config.emulator.result_subscription, &config.result_topic)
        .await
        .unwrap();
    broker
}

async fn start<B: Broker>(
    broker: &B,
    config: WorkerConfig,
) -> (Arc<Worker>, JoinHandle<Result<StatsSnapshot, WorkerError>>) {
    let worker = Arc::new(Worker::connect(broker, config).await.unwrap());
    let handle = task::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });
    (worker, handle)
}

async fn wait_until<F>(worker: &Worker, done: F)
where
    F: Fn(StatsSnapshot) -> bool,
{
    timeout(SETTLE, async {
        while !done(worker.stats()) {
            task::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker did not settle in time");
}

async fn next_result(broker: &InMemoryBroker, config: &WorkerConfig) -> IndicatorResult {
    let delivery = timeout(
        SETTLE,
        broker
            .subscriber(&config.emulator.result_subscription)
            .receive(),
    )
    .await
    .expect("no result published")
    .unwrap();
    let result = decode_result(&delivery.message.data).unwrap();
    delivery.ack().await;
    result
}

fn task_payload(ticker: &str, prices: Vec<f64>, period: i64) -> Vec<u8> {
    encode_task(&Task {
        ticker: ticker.to_string(),
        prices,
        period,
    })
    .unwrap()
}

#[async_std::test]
async fn publishes_indicators_for_a_task() {
    let config = config(8, 5);
    let broker = provisioned(&config).await;
    let (worker, handle) = start(&broker, config.clone()).await;

    broker
        .publisher(&config.task_topic)
        .publish(br#"{"ticker":"IBM","prices":[10,11,12,13],"period":2}"#.to_vec())
        .await
        .unwrap();

    let result = next_result(&broker, &config).await;
    assert_eq!(
        result,
        IndicatorResult {
            ticker: "IBM".to_string(),
            sma: vec![10.5, 11.5, 12.5],
            rsi: vec![100.0, 100.0],
        }
    );

    wait_until(&worker, |stats| stats.acked == 1).await;
    worker.stop();
    let stats = handle.await.unwrap();
    assert_eq!(
        stats,
        StatsSnapshot {
            received: 1,
            acked: 1,
            nacked: 0
        }
    );
    assert_eq!(broker.backlog(&config.subscription).await, Some(0));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[async_std::test]
async fn malformed_task_is_nacked_and_not_published() {
    let config = config(8, 3);
    let broker = provisioned(&config).await;
    let (worker, handle) = start(&broker, config.clone()).await;

    broker
        .publisher(&config.task_topic)
        .publish(br#"{"ticker":"IBM","prices":[10,"eleven",12],"period":2}"#.to_vec())
        .await
        .unwrap();

    // redelivered until the broker gives up on it
    wait_until(&worker, |stats| stats.nacked == 3).await;
    worker.stop();
    let stats = handle.await.unwrap();

    assert_eq!(stats.acked, 0);
    assert_eq!(stats.received, 3);
    let dead = broker.dead_letters(&config.subscription).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery_attempt, 3);
    assert_eq!(
        broker.backlog(&config.emulator.result_subscription).await,
        Some(0)
    );
}

#[async_std::test]
async fn concurrent_tasks_keep_their_own_results() {
    let config = config(0, 5);
    let broker = provisioned(&config).await;
    let (worker, handle) = start(&broker, config.clone()).await;

    let publisher = broker.publisher(&config.task_topic);
    let mut expected = HashMap::new();
    for i in 0..40 {
        let ticker = format!("T{:02}", i);
        let prices: Vec<f64> = (0..20)
            .map(|j| 100.0 + i as f64 + ((i * 7 + j) % 5) as f64 - 2.0)
            .collect();
        let period = (i % 5 + 1) as i64;
        expected.insert(
            ticker.clone(),
            IndicatorResult {
                ticker: ticker.clone(),
                sma: compute_sma(&prices, period as usize),
                rsi: compute_rsi(&prices, period as usize),
            },
        );
        publisher
            .publish(task_payload(&ticker, prices, period))
            .await
            .unwrap();
    }

    let mut seen = HashMap::new();
    for _ in 0..40 {
        let result = next_result(&broker, &config).await;
        seen.insert(result.ticker.clone(), result);
    }
    assert_eq!(seen, expected);

    wait_until(&worker, |stats| stats.acked == 40).await;
    worker.stop();
    handle.await.unwrap();
}

/// Delays every publish and records the peak number of overlapping calls.
struct SlowBroker {
    inner: InMemoryBroker,
    delay: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct SlowPublisher {
    inner: Arc<dyn Publisher>,
    delay: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowBroker {
    fn new(inner: InMemoryBroker, delay: Duration) -> Self {
        SlowBroker {
            inner,
            delay,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Broker for SlowBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        self.inner.topic_exists(topic).await
    }

    fn publisher(&self, topic: &str) -> Arc<dyn Publisher> {
        Arc::new(SlowPublisher {
            inner: self.inner.publisher(topic),
            delay: self.delay,
            current: Arc::clone(&self.current),
            peak: Arc::clone(&self.peak),
        })
    }

    fn subscriber(&self, subscription: &str) -> Arc<dyn Subscriber> {
        self.inner.subscriber(subscription)
    }
}

#[async_trait]
impl Publisher for SlowPublisher {
    async fn publish(&self, data: Vec<u8>) -> Result<String, BrokerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        task::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.inner.publish(data).await
    }
}

async fn publish_tasks(broker: &InMemoryBroker, config: &WorkerConfig, count: usize) {
    let publisher = broker.publisher(&config.task_topic);
    for i in 0..count {
        publisher
            .publish(task_payload(&format!("S{}", i), vec![1.0, 2.0, 3.0], 2))
            .await
            .unwrap();
    }
}

#[async_std::test]
async fn bounded_dispatch_caps_running_handlers() {
    let config = config(2, 5);
    let inner = provisioned(&config).await;
    let broker = SlowBroker::new(inner.clone(), Duration::from_millis(30));
    let (worker, handle) = start(&broker, config.clone()).await;

    publish_tasks(&inner, &config, 10).await;

    wait_until(&worker, |stats| stats.acked == 10).await;
    worker.stop();
    handle.await.unwrap();

    let peak = broker.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency was {}", peak);
}

#[async_std::test]
async fn unbounded_dispatch_overlaps_handlers() {
    let config = config(0, 5);
    let inner = provisioned(&config).await;
    let broker = SlowBroker::new(inner.clone(), Duration::from_millis(200));
    let (worker, handle) = start(&broker, config.clone()).await;

    publish_tasks(&inner, &config, 10).await;

    wait_until(&worker, |stats| stats.acked == 10).await;
    worker.stop();
    handle.await.unwrap();

    assert!(broker.peak.load(Ordering::SeqCst) > 2);
}

#[async_std::test]
async fn stop_drains_in_flight_handlers() {
    let config = config(0, 5);
    let inner = provisioned(&config).await;
    let broker = SlowBroker::new(inner.clone(), Duration::from_millis(150));
    let (worker, handle) = start(&broker, config.clone()).await;

    publish_tasks(&inner, &config, 3).await;
    wait_until(&worker, |stats| stats.received == 3).await;

    worker.stop();
    let stats = handle.await.unwrap();

    // every handler ran to completion after the stop request
    assert_eq!(stats.acked, 3);
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(
        inner.backlog(&config.emulator.result_subscription).await,
        Some(3)
    );
}

#[async_std::test]
async fn startup_fails_without_task_topic() {
    let config = WorkerConfig::default();
    let broker = InMemoryBroker::default();
    broker.create_topic(&config.result_topic).await.unwrap();

    let err = Worker::connect(&broker, config).await.unwrap_err();
    assert!(matches!(err, WorkerError::MissingTopic { role: "Task", .. }));
}

#[async_std::test]
async fn losing_the_subscription_is_fatal() {
    let config = config(8, 5);
    let broker = provisioned(&config).await;
    let (_worker, handle) = start(&broker, config.clone()).await;

    task::sleep(Duration::from_millis(20)).await;
    broker.delete_subscription(&config.subscription).await.unwrap();

    let result = timeout(SETTLE, handle).await.expect("worker did not exit");
    assert!(matches!(result, Err(WorkerError::FatalSubscription(_))));
}

#[async_std::test]
async fn losing_the_result_topic_nacks_and_keeps_receiving() {
    let config = config(8, 2);
    let broker = provisioned(&config).await;
    let (worker, handle) = start(&broker, config.clone()).await;

    broker.delete_topic(&config.result_topic).await.unwrap();
    publish_tasks(&broker, &config, 1).await;

    wait_until(&worker, |stats| stats.nacked == 2).await;
    assert_eq!(worker.state(), WorkerState::Receiving);
    assert_eq!(worker.stats().acked, 0);
    assert_eq!(broker.dead_letters(&config.subscription).await.len(), 1);

    // once the topic is back, later tasks go through on the same worker
    broker.create_topic(&config.result_topic).await.unwrap();
    publish_tasks(&broker, &config, 1).await;
    wait_until(&worker, |stats| stats.acked == 1).await;

    worker.stop();
    let stats = timeout(SETTLE, handle)
        .await
        .expect("worker did not exit")
        .unwrap();
    assert_eq!(
        stats,
        StatsSnapshot {
            received: 3,
            acked: 1,
            nacked: 2
        }
    );
}

/// Rejects the first `failures` publishes, then forwards to the inner broker.
struct FlakyBroker {
    inner: InMemoryBroker,
    failures: Arc<AtomicUsize>,
}

struct FlakyPublisher {
    inner: Arc<dyn Publisher>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        self.inner.topic_exists(topic).await
    }

    fn publisher(&self, topic: &str) -> Arc<dyn Publisher> {
        Arc::new(FlakyPublisher {
            inner: self.inner.publisher(topic),
            failures: Arc::clone(&self.failures),
        })
    }

    fn subscriber(&self, subscription: &str) -> Arc<dyn Subscriber> {
        self.inner.subscriber(subscription)
    }
}

#[async_trait]
impl Publisher for FlakyPublisher {
    async fn publish(&self, data: Vec<u8>) -> Result<String, BrokerError> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(BrokerError::Rejected("service unavailable".to_string()));
        }
        self.inner.publish(data).await
    }
}

#[async_std::test]
async fn transient_publish_failure_is_redelivered() {
    let config = config(8, 5);
    let inner = provisioned(&config).await;
    let broker = FlakyBroker {
        inner: inner.clone(),
        failures: Arc::new(AtomicUsize::new(1)),
    };
    let (worker, handle) = start(&broker, config.clone()).await;

    inner
        .publisher(&config.task_topic)
        .publish(task_payload("IBM", vec![10.0, 11.0, 12.0, 13.0], 2))
        .await
        .unwrap();

    let result = next_result(&inner, &config).await;
    assert_eq!(result.ticker, "IBM");
    assert_eq!(result.sma, vec![10.5, 11.5, 12.5]);

    wait_until(&worker, |stats| stats.acked == 1).await;
    worker.stop();
    let stats = handle.await.unwrap();
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.received, 2);
    assert!(inner.dead_letters(&config.subscription).await.is_empty());
}
