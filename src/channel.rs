// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! [`LapinTransport`] drives one lapin connection and its channel on behalf of
//! a consumer. Every command spawns a task performing the lapin RPC; the task
//! reports its outcome on an internal queue that [`Transport::next_event`]
//! drains, so callers never wait on the broker.

use crate::{
    config::{ConnectionParams, ConsumerConfig, DEFAULT_CONNECTION_NAME},
    exchange::ExchangeDefinition,
    message::Delivery,
    queue::{BindRequestId, QueueBinding, QueueDefinition},
    transport::{Transport, TransportEvent},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    uri::{AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Builds the broker URI from connection parameters.
///
/// Without credentials the broker's default guest account is used.
pub fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = params.host.clone();
    uri.authority.port = params.port;
    uri.vhost = params.vhost.clone();

    if let Some(credentials) = &params.credentials {
        uri.authority.userinfo = AMQPUserInfo {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
    }

    uri
}

/// What a spawned RPC task hands back to the transport.
enum Completion {
    Connected(Arc<Connection>),
    ChannelOpened(Channel),
    Event(TransportEvent),
}

type CompletionSender = mpsc::UnboundedSender<Completion>;

fn report(tx: &CompletionSender, event: TransportEvent) {
    if tx.send(Completion::Event(event)).is_err() {
        debug!("transport dropped, discarding event");
    }
}

/// [`Transport`] over a lapin connection.
pub struct LapinTransport {
    connection_name: String,
    tx: CompletionSender,
    rx: mpsc::UnboundedReceiver<Completion>,
    connection: Option<Arc<Connection>>,
    channel: Option<Channel>,
    close_requested: bool,
    cancel_requested: Arc<AtomicBool>,
    deliveries: Option<JoinHandle<()>>,
}

impl Default for LapinTransport {
    fn default() -> Self {
        LapinTransport::new(DEFAULT_CONNECTION_NAME)
    }
}

impl LapinTransport {
    /// Creates a transport announcing itself to the broker as `connection_name`.
    pub fn new(connection_name: &str) -> LapinTransport {
        let (tx, rx) = mpsc::unbounded_channel();

        LapinTransport {
            connection_name: connection_name.to_owned(),
            tx,
            rx,
            connection: None,
            channel: None,
            close_requested: false,
            cancel_requested: Arc::new(AtomicBool::new(false)),
            deliveries: None,
        }
    }

    /// Transport factory for [`AmqpClient`](crate::client::AmqpClient).
    pub fn for_config(config: &ConsumerConfig) -> LapinTransport {
        LapinTransport::new(config.client_name())
    }

    /// Runs a channel RPC in the background, reporting `ok` on success and a
    /// channel closure on failure.
    fn channel_rpc<F, Fut>(&self, ok: TransportEvent, rpc: F)
    where
        F: FnOnce(Channel) -> Fut,
        Fut: std::future::Future<Output = Result<(), lapin::Error>> + Send + 'static,
    {
        let Some(channel) = self.channel.clone() else {
            report(&self.tx, TransportEvent::ChannelClosed("no open channel".to_owned()));
            return;
        };

        let tx = self.tx.clone();
        let fut = rpc(channel);
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => report(&tx, ok),
                Err(err) => {
                    error!(error = err.to_string(), "channel rpc failed");
                    report(&tx, TransportEvent::ChannelClosed(err.to_string()));
                }
            }
        });
    }
}

#[async_trait]
impl Transport for LapinTransport {
    fn open_connection(&mut self, params: &ConnectionParams) {
        debug!("creating amqp connection...");
        let uri = amqp_uri(params);
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));
        let tx = self.tx.clone();

        tokio::spawn(async move {
            match Connection::connect_uri(uri, options).await {
                Ok(conn) => {
                    debug!("amqp connected");
                    let on_error = tx.clone();
                    conn.on_error(move |err| {
                        report(&on_error, TransportEvent::ConnectionClosed(err.to_string()));
                    });
                    if tx.send(Completion::Connected(Arc::new(conn))).is_err() {
                        debug!("transport dropped before the connection opened");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to connect");
                    report(&tx, TransportEvent::ConnectionOpenFailed(err.to_string()));
                }
            }
        });
    }

    fn open_channel(&mut self) {
        debug!("creating amqp channel...");
        let Some(conn) = self.connection.clone() else {
            report(&self.tx, TransportEvent::ConnectionClosed("no open connection".to_owned()));
            return;
        };
        let tx = self.tx.clone();

        tokio::spawn(async move {
            match conn.create_channel().await {
                Ok(channel) => {
                    debug!("channel created");
                    if tx.send(Completion::ChannelOpened(channel)).is_err() {
                        debug!("transport dropped before the channel opened");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "error to create the channel");
                    report(&tx, TransportEvent::ChannelClosed(err.to_string()));
                }
            }
        });
    }

    fn declare_exchange(&mut self, exchange: &ExchangeDefinition) {
        let exchange = exchange.clone();

        self.channel_rpc(TransportEvent::ExchangeDeclared, move |channel| async move {
            channel
                .exchange_declare(
                    &exchange.name,
                    exchange.kind.into(),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
        });
    }

    fn declare_queue(&mut self, queue: &QueueDefinition) {
        let Some(channel) = self.channel.clone() else {
            report(&self.tx, TransportEvent::ChannelClosed("no open channel".to_owned()));
            return;
        };
        let queue = queue.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            match channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(declared) => report(
                    &tx,
                    TransportEvent::QueueDeclared {
                        queue: declared.name().as_str().to_owned(),
                    },
                ),
                Err(err) => {
                    error!(error = err.to_string(), name = %queue.name, "error to declare the queue");
                    report(&tx, TransportEvent::ChannelClosed(err.to_string()));
                }
            }
        });
    }

    /// A binding without routing key is sent with the queue name as key.
    fn bind_queue(&mut self, request: BindRequestId, binding: &QueueBinding) {
        let binding = binding.clone();

        self.channel_rpc(TransportEvent::QueueBound(request), move |channel| async move {
            let routing_key = binding
                .routing_key
                .clone()
                .unwrap_or_else(|| binding.queue_name.clone());

            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
        });
    }

    fn set_qos(&mut self, prefetch_count: u16) {
        self.channel_rpc(TransportEvent::QosSet, move |channel| async move {
            channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false })
                .await
        });
    }

    fn consume(&mut self, queue: &str, consumer_tag: &str) {
        let Some(channel) = self.channel.clone() else {
            report(&self.tx, TransportEvent::ChannelClosed("no open channel".to_owned()));
            return;
        };
        let queue = queue.to_owned();
        let consumer_tag = consumer_tag.to_owned();
        let cancel_requested = self.cancel_requested.clone();
        let tx = self.tx.clone();

        self.deliveries = Some(tokio::spawn(async move {
            let mut consumer = match channel
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(c) => c,
                Err(err) => {
                    error!(error = err.to_string(), "error to create the consumer");
                    report(&tx, TransportEvent::ChannelClosed(err.to_string()));
                    return;
                }
            };

            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => report(&tx, TransportEvent::Delivery(Delivery::from(delivery))),
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        report(&tx, TransportEvent::ChannelClosed(err.to_string()));
                        return;
                    }
                }
            }

            if !cancel_requested.load(Ordering::SeqCst) {
                report(&tx, TransportEvent::ConsumerCancelled);
            }
        }));
    }

    fn cancel(&mut self, consumer_tag: &str) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let consumer_tag = consumer_tag.to_owned();

        self.channel_rpc(TransportEvent::CancelOk, move |channel| async move {
            channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await
        });
    }

    fn ack(&mut self, delivery_tag: u64) {
        self.channel_rpc_settle(delivery_tag, move |channel| async move {
            channel
                .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
                .await
        });
    }

    fn nack(&mut self, delivery_tag: u64, requeue: bool) {
        self.channel_rpc_settle(delivery_tag, move |channel| async move {
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue,
                    },
                )
                .await
        });
    }

    fn close_channel(&mut self) {
        let Some(channel) = self.channel.take() else {
            report(&self.tx, TransportEvent::ChannelClosed("channel already closed".to_owned()));
            return;
        };
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let reason = match channel.close(REPLY_SUCCESS, "Normal shutdown").await {
                Ok(()) => "closed by client".to_owned(),
                Err(err) => err.to_string(),
            };
            report(&tx, TransportEvent::ChannelClosed(reason));
        });
    }

    fn close_connection(&mut self) {
        let Some(conn) = self.connection.clone() else {
            return;
        };
        self.close_requested = true;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let reason = match conn.close(REPLY_SUCCESS, "Normal shutdown").await {
                Ok(()) => "closed by client".to_owned(),
                Err(err) => err.to_string(),
            };
            report(&tx, TransportEvent::ConnectionClosed(reason));
        });
    }

    fn is_connection_closed(&self) -> bool {
        match &self.connection {
            Some(conn) => self.close_requested || !conn.status().connected(),
            None => true,
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.rx.recv().await? {
                Completion::Connected(conn) => {
                    self.connection = Some(conn);
                    return Some(TransportEvent::ConnectionOpened);
                }
                Completion::ChannelOpened(channel) => {
                    self.channel = Some(channel);
                    return Some(TransportEvent::ChannelOpened);
                }
                Completion::Event(event) => {
                    match &event {
                        TransportEvent::ChannelClosed(_) => self.channel = None,
                        TransportEvent::ConnectionClosed(_) => {
                            self.channel = None;
                            self.connection = None;
                        }
                        _ => {}
                    }
                    return Some(event);
                }
            }
        }
    }
}

impl LapinTransport {
    /// Settles a delivery in the background; failures only get logged since
    /// the broker redelivers unsettled messages once the channel closes.
    fn channel_rpc_settle<F, Fut>(&self, delivery_tag: u64, rpc: F)
    where
        F: FnOnce(Channel) -> Fut,
        Fut: std::future::Future<Output = Result<(), lapin::Error>> + Send + 'static,
    {
        let Some(channel) = self.channel.clone() else {
            error!(delivery_tag, "cannot settle message without an open channel");
            return;
        };

        let fut = rpc(channel);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                error!(error = err.to_string(), delivery_tag, "error while settling msg");
            }
        });
    }
}

impl Drop for LapinTransport {
    fn drop(&mut self) {
        if let Some(deliveries) = self.deliveries.take() {
            deliveries.abort();
        }
    }
}
