// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The business logic plugged into a consumer. A handler decides which kind
//! of exchange the consumer declares, which routing keys its queue is bound
//! with, and what happens to every delivery.
//!
//! The default `on_message` rejects the delivery without requeue and fails
//! with [`AmqpError::HandlerNotImplemented`], which stops the consumer. A
//! deployment that forgets to install a real handler therefore fails loudly
//! instead of silently draining its queue.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, DeliveryChannel},
};
use async_trait::async_trait;
use opentelemetry::Context;
use tracing::error;

#[async_trait]
pub trait MessageHandler: Send {
    /// The type of the exchange declared by consumers running this handler.
    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Direct
    }

    /// Routing keys to bind the declared queue with.
    ///
    /// An empty list binds the queue to the exchange without a routing key.
    fn routing_keys(&self, _queue: &str) -> Vec<String> {
        vec![]
    }

    /// Processes one delivery.
    ///
    /// Implementations must acknowledge or reject the delivery through
    /// `channel` before returning; with a prefetch of one an unsettled
    /// delivery stalls the consumer.
    async fn on_message(
        &mut self,
        _ctx: &Context,
        channel: &mut DeliveryChannel<'_>,
        delivery: &Delivery,
    ) -> Result<(), AmqpError> {
        error!(
            delivery_tag = delivery.delivery_tag,
            app_id = delivery.app_id.as_deref().unwrap_or_default(),
            "received message without a message handler"
        );
        channel.reject(delivery.delivery_tag, false);
        Err(AmqpError::HandlerNotImplemented)
    }
}

/// Handler with no business logic: declares a direct exchange and rejects
/// every delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unhandled;

impl MessageHandler for Unhandled {}
