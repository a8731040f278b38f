// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The consumer never talks to the AMQP codec directly. It issues commands
//! through [`Transport`], which return immediately, and reacts to the
//! [`TransportEvent`]s the transport reports once the broker answers or the
//! connection fails. Every continuation of the handshake is therefore an
//! event, and the whole lifecycle can be driven by a single dispatch function.

use crate::{
    config::ConnectionParams,
    exchange::ExchangeDefinition,
    message::Delivery,
    queue::{BindRequestId, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;

/// Notifications a transport delivers to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionOpened,
    ConnectionOpenFailed(String),
    /// The connection is gone, whether we asked for it or not.
    ConnectionClosed(String),
    ChannelOpened,
    /// The channel is gone: closed by us, or by the broker on a protocol violation.
    ChannelClosed(String),
    ExchangeDeclared,
    /// Carries the queue name the broker settled on.
    QueueDeclared { queue: String },
    QueueBound(BindRequestId),
    QosSet,
    /// The broker revoked the consumer, e.g. because the queue was deleted.
    ConsumerCancelled,
    CancelOk,
    Delivery(Delivery),
}

/// Asynchronous AMQP command/notification transport owning one connection and
/// at most one channel.
#[async_trait]
pub trait Transport: Send {
    fn open_connection(&mut self, params: &ConnectionParams);

    fn open_channel(&mut self);

    fn declare_exchange(&mut self, exchange: &ExchangeDefinition);

    fn declare_queue(&mut self, queue: &QueueDefinition);

    /// Answered by [`TransportEvent::QueueBound`] carrying the same `request`.
    fn bind_queue(&mut self, request: BindRequestId, binding: &QueueBinding);

    fn set_qos(&mut self, prefetch_count: u16);

    fn consume(&mut self, queue: &str, consumer_tag: &str);

    fn cancel(&mut self, consumer_tag: &str);

    fn ack(&mut self, delivery_tag: u64);

    fn nack(&mut self, delivery_tag: u64, requeue: bool);

    fn close_channel(&mut self);

    fn close_connection(&mut self);

    /// True once the connection is closing, closed, or was never opened.
    fn is_connection_closed(&self) -> bool;

    /// Waits for the next notification. `None` means the transport is gone.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}
