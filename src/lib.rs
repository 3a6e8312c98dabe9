//! Pub/sub worker that computes moving-average and relative-strength series.
//!
//! Task messages name a ticker, a price series and a window period. For each
//! one the worker publishes the simple moving average and relative strength
//! index series, acknowledging the task only once the result is confirmed.
//!
//! - [`handler::indicators`]: the SMA and RSI algorithms
//! - [`handler::codec`]: JSON payloads for tasks and results
//! - [`handler::indicator_handler`]: the per-message pipeline
//! - [`handler::worker`]: the receive loop, fan-out and drain
//! - [`broker`]: the broker capability traits and an in-process broker

pub mod broker;
pub mod handler;
