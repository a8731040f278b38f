// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! An inbound message with the metadata handlers need, and the channel
//! capability they use to settle it.

use crate::transport::Transport;
use lapin::types::{AMQPValue, ShortString};
use std::collections::BTreeMap;
use tracing::info;

/// A message pushed by the broker to this consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub app_id: Option<String>,
    pub kind: Option<String>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub body: Vec<u8>,
}

impl Delivery {
    /// A delivery without metadata, carrying `body`.
    pub fn new(delivery_tag: u64, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag,
            body: body.to_vec(),
            ..Delivery::default()
        }
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let props = &delivery.properties;

        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            app_id: props.app_id().as_ref().map(|v| v.as_str().to_owned()),
            kind: props.kind().as_ref().map(|v| v.as_str().to_owned()),
            headers: props
                .headers()
                .as_ref()
                .map(|h| h.inner().clone())
                .unwrap_or_default(),
            body: delivery.data.clone(),
        }
    }
}

/// Lets a message handler acknowledge or reject the delivery it is processing.
///
/// With the default prefetch of one, the broker pushes nothing else until the
/// current delivery is settled.
pub struct DeliveryChannel<'a> {
    transport: &'a mut dyn Transport,
    settled: Vec<u64>,
}

impl<'a> DeliveryChannel<'a> {
    pub(crate) fn new(transport: &'a mut dyn Transport) -> DeliveryChannel<'a> {
        DeliveryChannel {
            transport,
            settled: vec![],
        }
    }

    /// Positively acknowledges the delivery.
    pub fn acknowledge(&mut self, delivery_tag: u64) {
        info!("acknowledging message {}", delivery_tag);
        self.transport.ack(delivery_tag);
        self.settled.push(delivery_tag);
    }

    /// Negatively acknowledges the delivery, optionally asking the broker to requeue it.
    pub fn reject(&mut self, delivery_tag: u64, requeue: bool) {
        info!("rejecting message {}", delivery_tag);
        self.transport.nack(delivery_tag, requeue);
        self.settled.push(delivery_tag);
    }

    pub(crate) fn is_settled(&self, delivery_tag: u64) -> bool {
        self.settled.contains(&delivery_tag)
    }
}
