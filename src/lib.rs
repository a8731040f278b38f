// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod mock;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod observer;
pub mod queue;
pub mod transport;

pub use channel::LapinTransport;
pub use client::AmqpClient;
pub use consumer::Consumer;
pub use handler::MessageHandler;
