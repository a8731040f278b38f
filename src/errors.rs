// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Consumer
//!
//! Transport failures never show up here: the consumer absorbs them and turns
//! them into a reconnect signal. What is left are handler outcomes and
//! configuration problems. Only a missing handler leaves `run` as an error.

use thiserror::Error;

/// Represents errors that can occur while running an AMQP consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// A delivery reached a consumer without a concrete message handler
    #[error("on_message must be implemented by a handler")]
    HandlerNotImplemented,

    /// A handler failed to process a message; the consumer keeps running
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Missing or invalid configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
