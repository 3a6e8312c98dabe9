//! Wire format for inbound tasks and outbound indicator results.
//!
//! Both directions are JSON. Unknown inbound fields are ignored so producers can
//! add fields without breaking older workers. Outbound series must be finite:
//! JSON has no representation for NaN or infinity, so such values are rejected
//! instead of being written as `null`. Floats are parsed with serde_json's
//! `float_roundtrip` feature, so a decoded result equals the encoded one bit
//! for bit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Task has an empty ticker")]
    EmptyTicker,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Non-finite value {value} at {field}[{index}] for ticker {ticker}")]
    NonFinite {
        ticker: String,
        field: &'static str,
        index: usize,
        value: f64,
    },
    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A calculation request for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub ticker: String,
    pub prices: Vec<f64>,
    /// Window length. Kept signed so that non-positive periods decode and
    /// produce empty series instead of failing the message.
    pub period: i64,
}

impl Task {
    /// The period as a window length; non-positive periods map to zero.
    pub fn window(&self) -> usize {
        usize::try_from(self.period).unwrap_or(0)
    }
}

/// The indicator series computed for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorResult {
    pub ticker: String,
    pub sma: Vec<f64>,
    pub rsi: Vec<f64>,
}

pub fn decode_task(payload: &[u8]) -> Result<Task, DecodeError> {
    let task: Task = serde_json::from_slice(payload)?;
    if task.ticker.is_empty() {
        return Err(DecodeError::EmptyTicker);
    }
    Ok(task)
}

pub fn encode_task(task: &Task) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(task)?)
}

pub fn decode_result(payload: &[u8]) -> Result<IndicatorResult, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode_result(result: &IndicatorResult) -> Result<Vec<u8>, EncodeError> {
    for (field, series) in [("sma", &result.sma), ("rsi", &result.rsi)] {
        if let Some((index, value)) = series.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(EncodeError::NonFinite {
                ticker: result.ticker.clone(),
                field,
                index,
                value: *value,
            });
        }
    }

    Ok(serde_json::to_vec(result)?)
}
