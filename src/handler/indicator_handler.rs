use super::{
    codec::{decode_task, encode_result, DecodeError, EncodeError, IndicatorResult, Task},
    indicators::{Indicator, Rsi, Sma},
};
use crate::broker::{BrokerError, Publisher};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("Failed to publish result for {ticker}: {source}")]
    Publish {
        ticker: String,
        #[source]
        source: BrokerError,
    },
}

/// How a single message ended up, and therefore how it must be acknowledged.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The result was published; the message can be acknowledged.
    Success { message_id: String },
    /// The message should be redelivered.
    Retryable(HandlerError),
    /// The message should be redelivered, but will keep failing until the
    /// broker is fixed. The worker still keeps receiving.
    Fatal(HandlerError),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success { .. })
    }
}

/// Runs decode, compute, encode and publish for one message.
///
/// The handler keeps no state between messages, so one instance is shared by
/// every concurrently running delivery.
pub struct IndicatorHandler {
    publisher: Arc<dyn Publisher>,
}

impl IndicatorHandler {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        IndicatorHandler { publisher }
    }

    pub fn compute(task: &Task) -> IndicatorResult {
        let period = task.window();
        let sma = Sma.calculate(&task.prices, period);
        let rsi = Rsi.calculate(&task.prices, period);

        debug!(
            "Computed {} {} and {} {} values for ticker: {}",
            sma.len(),
            Sma.name(),
            rsi.len(),
            Rsi.name(),
            task.ticker
        );

        IndicatorResult {
            ticker: task.ticker.clone(),
            sma,
            rsi,
        }
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn handle(&self, payload: &[u8]) -> HandlerOutcome {
        let task = match decode_task(payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("Error decoding task: {}", e);
                return HandlerOutcome::Retryable(e.into());
            }
        };

        info!("Received task for ticker: {}", task.ticker);

        let result = Self::compute(&task);

        let encoded = match encode_result(&result) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Error encoding result: {}", e);
                return HandlerOutcome::Retryable(e.into());
            }
        };

        match self.publisher.publish(encoded).await {
            Ok(message_id) => {
                info!(
                    "Published result for ticker: {} as message {}",
                    task.ticker, message_id
                );
                HandlerOutcome::Success { message_id }
            }
            Err(source) => {
                let permanent = source.is_permanent();
                let e = HandlerError::Publish {
                    ticker: task.ticker,
                    source,
                };
                if permanent {
                    error!("{}", e);
                    HandlerOutcome::Fatal(e)
                } else {
                    warn!("{}", e);
                    HandlerOutcome::Retryable(e)
                }
            }
        }
    }
}

impl std::fmt::Debug for IndicatorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorHandler").finish_non_exhaustive()
    }
}
