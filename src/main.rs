//! Main executable for the indicator worker.
//!
//! Runs the worker against an in-process broker. Each non-empty line read from
//! stdin is checked as a task and published to the task topic, and every result
//! the worker publishes is printed to stdout. Logs go to stderr. SIGINT and SIGTERM stop the worker
//! once in-flight messages have settled.

use anyhow::Context;
use async_std::{
    io::{self, prelude::BufReadExt, BufReader},
    main,
    stream::StreamExt,
    sync::Arc,
    task,
};
use clap::Parser;
use libc::{SIGINT, SIGTERM};
use pin_utils::pin_mut;
use pubsub_indicator_worker::{
    broker::{memory::InMemoryBroker, Broker, BrokerError},
    handler::{
        codec::{decode_result, decode_task, encode_task},
        config::WorkerConfig,
        worker::Worker,
    },
};
use signal_hook::low_level::signal_name;
use signal_hook_async_std::Signals;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Command-line arguments for the indicator worker.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of concurrently running handlers (0 = unbounded).
    #[clap(long)]
    max_in_flight: Option<usize>,
}

#[main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(max_in_flight) = args.max_in_flight {
        config.max_in_flight = max_in_flight;
    }

    // stdout carries results, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level()?)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    info!("Main() started");

    let broker = InMemoryBroker::new(config.emulator.max_delivery_attempts);
    provision(&broker, &config)
        .await
        .context("Failed to provision broker")?;

    let worker = match Worker::connect(&broker, config.clone()).await {
        Ok(worker) => Arc::new(worker),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    task::spawn(forward_stdin(broker.clone(), config.task_topic.clone()));
    task::spawn(print_results(
        broker.clone(),
        config.emulator.result_subscription.clone(),
    ));

    // Task for the receive loop
    let serve_handle = task::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });

    // Setup signal handler to stop the worker on termination signals
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    task::spawn({
        let worker = Arc::clone(&worker);
        async move {
            while let Some(signal) = signals.next().await {
                match signal {
                    SIGINT | SIGTERM => {
                        info!(
                            "Received termination signal: {}",
                            signal_name(signal).unwrap_or("unknown")
                        );
                        worker.stop();
                        break;
                    }
                    _ => debug!("Received unhandled signal: {}", signal),
                }
            }
        }
    });

    info!(
        "Indicator worker consuming {} and publishing to {}",
        config.subscription, config.result_topic
    );

    match serve_handle.await {
        Ok(stats) => info!(
            "Worker stopped after {} message(s): {} acked, {} nacked",
            stats.received, stats.acked, stats.nacked
        ),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Creates the topics and subscriptions the worker expects to find.
async fn provision(broker: &InMemoryBroker, config: &WorkerConfig) -> Result<(), BrokerError> {
    broker.create_topic(&config.task_topic).await?;
    broker.create_topic(&config.result_topic).await?;
    broker
        .create_subscription(&config.subscription, &config.task_topic)
        .await?;
    broker
        .create_subscription(&config.emulator.result_subscription, &config.result_topic)
        .await?;
    Ok(())
}

async fn forward_stdin(broker: InMemoryBroker, topic: String) {
    let publisher = broker.publisher(&topic);
    let lines = BufReader::new(io::stdin()).lines();
    pin_mut!(lines);

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => {
                let payload = match decode_task(line.as_bytes())
                    .map_err(anyhow::Error::from)
                    .and_then(|task| encode_task(&task).map_err(anyhow::Error::from))
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Skipping unreadable task line: {}", e);
                        continue;
                    }
                };
                match publisher.publish(payload).await {
                    Ok(id) => debug!("Published task message {}", id),
                    Err(e) => warn!("Failed to publish task: {}", e),
                }
            }
            Err(e) => {
                error!("Error reading stdin: {}", e);
                break;
            }
        }
    }

    debug!("Stdin closed, no more tasks will be published");
}

async fn print_results(broker: InMemoryBroker, subscription: String) {
    let subscriber = broker.subscriber(&subscription);

    loop {
        let delivery = match subscriber.receive().await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Result subscription stopped: {}", e);
                break;
            }
        };

        match decode_result(&delivery.message.data) {
            Ok(result) => {
                println!("{}", String::from_utf8_lossy(&delivery.message.data));
                debug!("Printed result for ticker: {}", result.ticker);
            }
            Err(e) => warn!("Unreadable result message {}: {}", delivery.message.id, e),
        }

        delivery.ack().await;
    }
}
