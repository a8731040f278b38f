// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Scripted in-memory transport answering like a broker.

use crate::{
    config::ConnectionParams,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::MessageHandler,
    message::{Delivery, DeliveryChannel},
    queue::{BindRequestId, QueueBinding, QueueDefinition},
    transport::{Transport, TransportEvent},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// Every command the consumer issued, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    OpenConnection { host: String, port: u16, vhost: String },
    OpenChannel,
    DeclareExchange { name: String, kind: ExchangeKind },
    DeclareQueue(String),
    Bind {
        request: BindRequestId,
        queue: String,
        exchange: String,
        routing_key: Option<String>,
    },
    SetQos(u16),
    Consume { queue: String, consumer_tag: String },
    Cancel(String),
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
    CloseChannel,
    CloseConnection,
}

/// A handshake step the scripted broker never answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    OpenChannel,
    DeclareQueue,
    Cancel,
}

/// How the scripted broker behaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct Broker {
    pub(crate) refuse_connection: bool,
    pub(crate) silent_on: Option<Step>,
    pub(crate) reject_exchange: bool,
    pub(crate) deliveries: Vec<Delivery>,
    pub(crate) drop_after_consume: bool,
    pub(crate) cancel_after_consume: bool,
}

pub(crate) type Calls = Arc<Mutex<Vec<Call>>>;

pub(crate) struct FakeTransport {
    broker: Option<Broker>,
    calls: Calls,
    events: VecDeque<TransportEvent>,
    connected: bool,
}

impl FakeTransport {
    /// A transport answering every command the way `broker` describes.
    pub(crate) fn new(broker: Broker) -> FakeTransport {
        Self::with_calls(broker, Calls::default())
    }

    pub(crate) fn with_calls(broker: Broker, calls: Calls) -> FakeTransport {
        FakeTransport {
            broker: Some(broker),
            calls,
            events: VecDeque::new(),
            connected: false,
        }
    }

    /// A transport that records commands and never answers on its own.
    pub(crate) fn manual() -> FakeTransport {
        FakeTransport {
            broker: None,
            calls: Calls::default(),
            events: VecDeque::new(),
            connected: false,
        }
    }

    pub(crate) fn calls(&self) -> Calls {
        self.calls.clone()
    }

    /// The connection dies without the broker telling anyone.
    pub(crate) fn lose_connection(&mut self) {
        self.connected = false;
    }

    fn record(&mut self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn answer(&mut self, event: TransportEvent) {
        if self.broker.is_some() {
            self.events.push_back(event);
        }
    }

    fn silent_on(&self, step: Step) -> bool {
        self.broker
            .as_ref()
            .map(|b| b.silent_on == Some(step))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn open_connection(&mut self, params: &ConnectionParams) {
        self.record(Call::OpenConnection {
            host: params.host.clone(),
            port: params.port,
            vhost: params.vhost.clone(),
        });

        let refuse = self.broker.as_ref().map(|b| b.refuse_connection);
        match refuse {
            Some(true) => self.answer(TransportEvent::ConnectionOpenFailed(
                "connection refused".to_owned(),
            )),
            Some(false) => {
                self.connected = true;
                self.answer(TransportEvent::ConnectionOpened);
            }
            None => self.connected = true,
        }
    }

    fn open_channel(&mut self) {
        self.record(Call::OpenChannel);
        if !self.silent_on(Step::OpenChannel) {
            self.answer(TransportEvent::ChannelOpened);
        }
    }

    fn declare_exchange(&mut self, exchange: &ExchangeDefinition) {
        self.record(Call::DeclareExchange {
            name: exchange.name().to_owned(),
            kind: exchange.exchange_kind(),
        });

        let reject = self.broker.as_ref().map(|b| b.reject_exchange).unwrap_or(false);
        if reject {
            self.answer(TransportEvent::ChannelClosed(
                "PRECONDITION_FAILED - inequivalent arg 'type'".to_owned(),
            ));
        } else {
            self.answer(TransportEvent::ExchangeDeclared);
        }
    }

    fn declare_queue(&mut self, queue: &QueueDefinition) {
        self.record(Call::DeclareQueue(queue.name().to_owned()));
        if !self.silent_on(Step::DeclareQueue) {
            self.answer(TransportEvent::QueueDeclared {
                queue: queue.name().to_owned(),
            });
        }
    }

    fn bind_queue(&mut self, request: BindRequestId, binding: &QueueBinding) {
        self.record(Call::Bind {
            request,
            queue: binding.queue_name().to_owned(),
            exchange: binding.exchange_name().to_owned(),
            routing_key: binding.key().map(str::to_owned),
        });
        self.answer(TransportEvent::QueueBound(request));
    }

    fn set_qos(&mut self, prefetch_count: u16) {
        self.record(Call::SetQos(prefetch_count));
        self.answer(TransportEvent::QosSet);
    }

    fn consume(&mut self, queue: &str, consumer_tag: &str) {
        self.record(Call::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
        });

        let Some(broker) = self.broker.clone() else {
            return;
        };
        for delivery in broker.deliveries {
            self.events.push_back(TransportEvent::Delivery(delivery));
        }
        if broker.cancel_after_consume {
            self.events.push_back(TransportEvent::ConsumerCancelled);
        }
        if broker.drop_after_consume {
            self.connected = false;
            self.events
                .push_back(TransportEvent::ConnectionClosed("Transport indicated EOF".to_owned()));
        }
    }

    fn cancel(&mut self, consumer_tag: &str) {
        self.record(Call::Cancel(consumer_tag.to_owned()));
        if !self.silent_on(Step::Cancel) {
            self.answer(TransportEvent::CancelOk);
        }
    }

    fn ack(&mut self, delivery_tag: u64) {
        self.record(Call::Ack(delivery_tag));
    }

    fn nack(&mut self, delivery_tag: u64, requeue: bool) {
        self.record(Call::Nack {
            delivery_tag,
            requeue,
        });
    }

    fn close_channel(&mut self) {
        self.record(Call::CloseChannel);
        self.answer(TransportEvent::ChannelClosed("closed by client".to_owned()));
    }

    fn close_connection(&mut self) {
        self.record(Call::CloseConnection);
        self.connected = false;
        self.answer(TransportEvent::ConnectionClosed("closed by client".to_owned()));
    }

    fn is_connection_closed(&self) -> bool {
        !self.connected
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.events.pop_front() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }
}

/// Acknowledges every delivery and keeps its body.
#[derive(Debug, Clone, Default)]
pub(crate) struct AckingHandler {
    pub(crate) kind: ExchangeKind,
    pub(crate) keys: Vec<String>,
    pub(crate) bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl MessageHandler for AckingHandler {
    fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    fn routing_keys(&self, _queue: &str) -> Vec<String> {
        self.keys.clone()
    }

    async fn on_message(
        &mut self,
        _ctx: &Context,
        channel: &mut DeliveryChannel<'_>,
        delivery: &Delivery,
    ) -> Result<(), AmqpError> {
        self.bodies.lock().unwrap().push(delivery.body.clone());
        channel.acknowledge(delivery.delivery_tag);
        Ok(())
    }
}
