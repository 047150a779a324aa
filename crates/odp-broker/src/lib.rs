//! Queue dispatch framework
//!
//! Named durable work queues bound to a topic-routed exchange, consumed
//! one message at a time per consumer (prefetch 1), with
//! acknowledge-on-success / dead-letter-on-failure semantics and optional
//! per-queue message TTL.
//!
//! The exchange is process-local but keeps the broker delivery contract
//! exactly: at-least-once delivery, no ordering across queues, FIFO per
//! consumer only while prefetch is 1. Pipeline stages never talk to each
//! other directly; every handoff crosses this exchange.

pub mod dispatch;
pub mod exchange;
pub mod topic;

pub use dispatch::{Dispatcher, Publisher, QueueHandler};
pub use exchange::{Consumer, Delivery, Envelope, QueueDepth, QueueOptions, TopicExchange};
pub use topic::TopicPattern;

use thiserror::Error;

/// Errors surfaced by the exchange and dispatcher
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("queue {0} already declared with a different binding")]
    BindingConflict(String),

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("message body is not valid JSON: {0}")]
    BadPayload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
