// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Consumer Lifecycle
//!
//! A [`Consumer`] owns one connection and, while it is open, one channel. It
//! walks the broker through a strictly ordered handshake:
//!
//! 1. open the connection
//! 2. open a channel
//! 3. declare the exchange (its type comes from the message handler)
//! 4. declare the queue
//! 5. bind the queue, once per routing key or once without a key
//! 6. set the prefetch count once every bind is acknowledged
//! 7. start consuming
//!
//! Each step is a command issued through the [`Transport`]; the next step only
//! starts when the matching [`TransportEvent`] arrives. All events go through
//! one `(state, event)` dispatch, so no two continuations ever run at once.
//!
//! Any unintended closure (connection refused, connection dropped, channel
//! closed by the broker, consumer cancelled by the broker, broker silent for
//! longer than the step timeout) ends the run with `should_reconnect` set. An
//! explicit [`Consumer::stop`] cancels the consumer, closes the channel and
//! then the connection, and ends the run without it. A consumer never repairs
//! itself: the supervisor replaces it wholesale.

use crate::{
    config::ConsumerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::MessageHandler,
    message::{Delivery, DeliveryChannel},
    observer::{ConsumerObserver, LifecycleEvent},
    otel,
    queue::{BindRequestId, QueueBinding, QueueDefinition},
    transport::{Transport, TransportEvent},
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a consumer stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created, not running yet.
    Idle,
    /// Waiting for the broker to accept the connection.
    Connecting,
    /// Waiting for the channel.
    ChannelOpening,
    /// Waiting for Exchange.DeclareOk.
    ExchangeDeclaring,
    /// Waiting for Queue.DeclareOk.
    QueueDeclaring,
    /// Waiting for every Queue.BindOk.
    Binding,
    /// Waiting for Basic.QosOk.
    SettingQos,
    /// Deliveries flow to the handler.
    Consuming,
    /// Basic.Cancel sent, waiting for CancelOk.
    Cancelling,
    /// Waiting for the channel to close.
    ChannelClosing,
    /// Waiting for the connection to close.
    ConnectionClosing,
    /// Terminal; a consumer never leaves it.
    Closed,
}

/// Why [`Consumer::run_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The consumer stopped on its own; check [`Consumer::should_reconnect`].
    Finished,
    /// The shutdown future resolved and the consumer stopped.
    Interrupted,
}

enum Polled {
    Event(Option<TransportEvent>),
    Stalled(Duration),
}

/// One attempt at consuming a queue: a single connection, a single channel
/// and a single broker-side consumer.
///
/// Run it once; when it finishes, read [`should_reconnect`](Self::should_reconnect)
/// and [`was_consuming`](Self::was_consuming) and build a new one if needed.
pub struct Consumer<T, H> {
    config: ConsumerConfig,
    transport: T,
    handler: H,
    observer: Option<Arc<dyn ConsumerObserver>>,
    state: ConsumerState,
    queue_name: String,
    consumer_tag: Option<String>,
    pending_binds: BTreeMap<BindRequestId, Option<String>>,
    next_bind_id: u64,
    should_reconnect: bool,
    was_consuming: bool,
    closing: bool,
    consuming: bool,
    running: bool,
    connection_open: bool,
    channel_open: bool,
    failure: Option<AmqpError>,
}

impl<T, H> Consumer<T, H>
where
    T: Transport,
    H: MessageHandler,
{
    /// Creates an idle consumer.
    ///
    /// # Parameters
    /// * `config` - Queue, exchange, connection and flow control settings
    /// * `transport` - The transport this consumer owns for its whole life
    /// * `handler` - Decides the exchange type, the routing keys and what
    ///   happens to each delivery
    ///
    /// # Returns
    /// A consumer in [`ConsumerState::Idle`]
    pub fn new(config: ConsumerConfig, transport: T, handler: H) -> Consumer<T, H> {
        let queue_name = config.queue.clone();

        Consumer {
            config,
            transport,
            handler,
            observer: None,
            state: ConsumerState::Idle,
            queue_name,
            consumer_tag: None,
            pending_binds: BTreeMap::new(),
            next_bind_id: 0,
            should_reconnect: false,
            was_consuming: false,
            closing: false,
            consuming: false,
            running: false,
            connection_open: false,
            channel_open: false,
            failure: None,
        }
    }

    /// Reports lifecycle events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Set when the consumer ended because of an unintended closure.
    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    /// Set once consumption started, and never cleared for this instance.
    pub fn was_consuming(&self) -> bool {
        self.was_consuming
    }

    /// True while the broker may push deliveries to this consumer.
    pub fn is_consuming(&self) -> bool {
        self.consuming
    }

    /// True once a stop was requested, by the caller or by a failure.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// The `<queue>.<uuid>` tag, once consumption started.
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Unacknowledged deliveries the broker may push at once.
    pub fn prefetch_count(&self) -> u16 {
        self.config.prefetch_count
    }

    /// Binds still waiting for the broker's acknowledgement, by request.
    pub fn pending_binds(&self) -> &BTreeMap<BindRequestId, Option<String>> {
        &self.pending_binds
    }

    /// Runs the consumer until it stops.
    pub async fn run(&mut self) -> Result<(), AmqpError> {
        self.run_until(std::future::pending()).await.map(|_| ())
    }

    /// Runs the consumer until it stops or `shutdown` resolves.
    ///
    /// When `shutdown` resolves the consumer is stopped and keeps running
    /// until the cancel and close sequence completes.
    ///
    /// Transport failures never surface here; they set
    /// [`should_reconnect`](Self::should_reconnect) instead. The only error is
    /// a delivery hitting a handler without `on_message`.
    pub async fn run_until<S>(&mut self, shutdown: S) -> Result<RunOutcome, AmqpError>
    where
        S: Future<Output = ()>,
    {
        if self.state != ConsumerState::Idle || self.closing {
            warn!(state = ?self.state, "consumer already ran, create a new one");
            return Ok(RunOutcome::Finished);
        }

        tokio::pin!(shutdown);
        let mut interrupted = false;

        self.running = true;
        self.connect();

        while self.running {
            let deadline = self.step_deadline();

            tokio::select! {
                _ = &mut shutdown, if !interrupted => {
                    info!("interrupt received, stopping consumer");
                    interrupted = true;
                    self.stop();
                }
                polled = poll_transport(&mut self.transport, deadline) => match polled {
                    Polled::Event(Some(event)) => self.dispatch(event).await,
                    Polled::Event(None) => self.on_connection_closed("transport terminated"),
                    Polled::Stalled(after) => self.on_step_stalled(after),
                },
            }
        }

        self.release();

        match self.failure.take() {
            Some(err) => Err(err),
            None if interrupted => Ok(RunOutcome::Interrupted),
            None => Ok(RunOutcome::Finished),
        }
    }

    /// Cleanly shuts the consumer down.
    ///
    /// While consuming, the consumer is cancelled first and the run ends once
    /// the connection is closed. Otherwise the run ends right away. Calling
    /// it again while stopping does nothing.
    pub fn stop(&mut self) {
        if self.closing {
            debug!("consumer already stopping");
            return;
        }

        self.closing = true;
        info!("stopping");

        if self.consuming {
            self.stop_consuming();
        } else {
            self.running = false;
        }
    }

    fn connect(&mut self) {
        let params = &self.config.connection;
        info!("connecting to {}:{}{}", params.host, params.port, params.vhost);

        self.state = ConsumerState::Connecting;
        self.transport.open_connection(&self.config.connection);
    }

    async fn dispatch(&mut self, event: TransportEvent) {
        use ConsumerState as S;
        use TransportEvent as E;

        match (self.state, event) {
            (_, E::Delivery(delivery)) => self.on_delivery(delivery).await,
            (_, E::ConnectionClosed(reason)) => self.on_connection_closed(&reason),
            (S::Connecting, E::ConnectionOpened) => self.on_connection_open(),
            (S::Connecting, E::ConnectionOpenFailed(reason)) => {
                self.on_connection_open_error(&reason)
            }
            (_, E::ChannelClosed(reason)) => self.on_channel_closed(&reason),
            (S::ChannelOpening, E::ChannelOpened) => self.on_channel_open(),
            (S::ExchangeDeclaring, E::ExchangeDeclared) => self.on_exchange_declared(),
            (S::QueueDeclaring, E::QueueDeclared { queue }) => self.on_queue_declared(queue),
            (S::Binding, E::QueueBound(request)) => self.on_bind_ok(request),
            (S::SettingQos, E::QosSet) => self.on_qos_set(),
            (S::Consuming, E::ConsumerCancelled) => self.on_consumer_cancelled(),
            (S::Cancelling, E::CancelOk) => self.on_cancel_ok(),
            (state, event) => warn!(?state, ?event, "ignoring unexpected transport event"),
        }
    }

    fn on_connection_open(&mut self) {
        info!("connection opened");
        self.connection_open = true;
        self.notify(LifecycleEvent::Connected);
        self.open_channel();
    }

    fn on_connection_open_error(&mut self, reason: &str) {
        error!(error = reason, "connection open failed");
        self.state = ConsumerState::Closed;
        self.reconnect();
    }

    fn on_connection_closed(&mut self, reason: &str) {
        self.connection_open = false;
        self.channel_open = false;
        self.consuming = false;
        self.state = ConsumerState::Closed;

        if self.closing {
            info!("connection closed");
            self.running = false;
        } else {
            warn!("connection closed, reconnect necessary: {}", reason);
            self.reconnect();
        }
    }

    fn reconnect(&mut self) {
        self.should_reconnect = true;
        self.stop();
    }

    fn open_channel(&mut self) {
        info!("creating a new channel");
        self.state = ConsumerState::ChannelOpening;
        self.transport.open_channel();
    }

    fn on_channel_open(&mut self) {
        info!("channel opened");
        self.channel_open = true;
        self.setup_exchange();
    }

    /// Closes the connection; channels die with protocol violations, and the
    /// consumer never tries to repair one.
    fn on_channel_closed(&mut self, reason: &str) {
        if matches!(
            self.state,
            ConsumerState::ConnectionClosing | ConsumerState::Closed
        ) {
            debug!("channel closed while closing the connection: {}", reason);
            return;
        }

        if self.closing {
            info!("channel was closed: {}", reason);
        } else {
            warn!("channel was closed: {}", reason);
        }

        self.channel_open = false;
        self.close_connection();
    }

    fn close_connection(&mut self) {
        self.consuming = false;
        self.state = ConsumerState::ConnectionClosing;

        if self.transport.is_connection_closed() {
            info!("connection is closing or already closed");
            self.on_connection_closed("connection already closed");
        } else {
            info!("closing connection");
            self.transport.close_connection();
        }
    }

    fn setup_exchange(&mut self) {
        let mut exchange =
            ExchangeDefinition::new(&self.config.exchange).kind(self.handler.exchange_kind());
        if self.config.durable {
            exchange = exchange.durable();
        }

        info!(
            kind = exchange.exchange_kind().as_str(),
            "declaring exchange: {}",
            exchange.name()
        );
        self.state = ConsumerState::ExchangeDeclaring;
        self.transport.declare_exchange(&exchange);
    }

    fn on_exchange_declared(&mut self) {
        info!("exchange declared: {}", self.config.exchange);
        self.setup_queue();
    }

    fn setup_queue(&mut self) {
        let mut queue = QueueDefinition::new(&self.config.queue);
        if self.config.durable {
            queue = queue.durable();
        }

        info!("declaring queue {}", queue.name());
        self.state = ConsumerState::QueueDeclaring;
        self.transport.declare_queue(&queue);
    }

    fn on_queue_declared(&mut self, queue: String) {
        info!("binding to {}", queue);
        self.queue_name = queue;

        let keys = self.handler.routing_keys(&self.queue_name);
        let bindings =
            QueueBinding::for_routing_keys(&self.queue_name, &self.config.exchange, &keys);

        self.state = ConsumerState::Binding;
        for binding in bindings {
            let request = BindRequestId(self.next_bind_id);
            self.next_bind_id += 1;

            debug!(%request, routing_key = binding.key(), "binding queue");
            self.pending_binds.insert(request, binding.routing_key.clone());
            self.transport.bind_queue(request, &binding);
        }
    }

    fn on_bind_ok(&mut self, request: BindRequestId) {
        match self.pending_binds.remove(&request) {
            Some(Some(key)) => info!("queue bound: {} with routing key {}", self.queue_name, key),
            Some(None) => info!("queue bound: {}", self.queue_name),
            None => {
                warn!(%request, "acknowledgement for an unknown bind request");
                return;
            }
        }

        if self.pending_binds.is_empty() {
            self.set_qos();
        }
    }

    fn set_qos(&mut self) {
        self.state = ConsumerState::SettingQos;
        self.transport.set_qos(self.config.prefetch_count);
    }

    fn on_qos_set(&mut self) {
        info!("qos set to: {}", self.config.prefetch_count);
        self.start_consuming();
    }

    fn start_consuming(&mut self) {
        info!("issuing consumer");
        let tag = format!("{}.{}", self.queue_name, Uuid::new_v4());

        self.state = ConsumerState::Consuming;
        self.transport.consume(&self.queue_name, &tag);

        self.consumer_tag = Some(tag.clone());
        self.consuming = true;
        self.was_consuming = true;
        self.notify(LifecycleEvent::Consuming { consumer_tag: tag });
    }

    fn on_consumer_cancelled(&mut self) {
        info!("consumer was cancelled remotely, shutting down");
        self.consuming = false;

        if self.channel_open {
            self.close_channel();
        }
    }

    fn stop_consuming(&mut self) {
        match (self.channel_open, self.consumer_tag.clone()) {
            (true, Some(tag)) => {
                info!("sending a Basic.Cancel command to the broker");
                self.state = ConsumerState::Cancelling;
                self.transport.cancel(&tag);
            }
            _ => self.running = false,
        }
    }

    fn on_cancel_ok(&mut self) {
        self.consuming = false;
        info!(
            "the broker acknowledged the cancellation of the consumer: {}",
            self.consumer_tag.as_deref().unwrap_or_default()
        );
        self.close_channel();
    }

    fn close_channel(&mut self) {
        info!("closing the channel");
        self.state = ConsumerState::ChannelClosing;
        self.transport.close_channel();
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        if !self.channel_open {
            warn!(
                delivery_tag = delivery.delivery_tag,
                "dropping delivery received without an open channel"
            );
            return;
        }

        if self.failure.is_some() {
            warn!(
                delivery_tag = delivery.delivery_tag,
                "consumer is stopping after a fatal handler error, requeueing message"
            );
            self.transport.nack(delivery.delivery_tag, true);
            return;
        }

        debug!(
            "received: {} - exchange: {}",
            delivery.delivery_tag, delivery.exchange
        );

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &self.queue_name);

        let mut channel = DeliveryChannel::new(&mut self.transport);
        let result = self.handler.on_message(&ctx, &mut channel, &delivery).await;
        let settled = channel.is_settled(delivery.delivery_tag);

        match result {
            Ok(()) => {
                if !settled {
                    warn!(
                        delivery_tag = delivery.delivery_tag,
                        "handler returned without acknowledging or rejecting the message"
                    );
                }
                span.set_status(Status::Ok);
            }
            Err(err @ AmqpError::HandlerNotImplemented) => {
                error!(error = err.to_string(), "no message handler installed, stopping");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("no message handler"),
                });
                self.failure = Some(err);
                self.stop();
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to handle message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to handle message"),
                });
            }
        }

        span.end();
    }

    fn on_step_stalled(&mut self, after: Duration) {
        warn!(
            state = ?self.state,
            "no answer from the broker after {} seconds",
            after.as_secs()
        );

        if !self.closing {
            self.should_reconnect = true;
            self.closing = true;
        }
        self.running = false;
    }

    /// Only waits on the broker with a deadline while a reply is expected.
    fn step_deadline(&self) -> Option<Duration> {
        match self.state {
            ConsumerState::Idle | ConsumerState::Consuming | ConsumerState::Closed => None,
            _ => self.config.step_timeout_duration(),
        }
    }

    fn release(&mut self) {
        if self.connection_open && !self.transport.is_connection_closed() {
            debug!("closing connection left open");
            self.transport.close_connection();
        }

        self.connection_open = false;
        self.channel_open = false;
        self.consuming = false;
        self.state = ConsumerState::Closed;

        self.notify(LifecycleEvent::Disconnected {
            should_reconnect: self.should_reconnect,
            was_consuming: self.was_consuming,
        });
    }

    fn notify(&self, event: LifecycleEvent) {
        if let Some(observer) = &self.observer {
            observer.notify(event);
        }
    }
}

async fn poll_transport<T: Transport>(transport: &mut T, deadline: Option<Duration>) -> Polled {
    match deadline {
        Some(limit) => match time::timeout(limit, transport.next_event()).await {
            Ok(event) => Polled::Event(event),
            Err(_) => Polled::Stalled(limit),
        },
        None => Polled::Event(transport.next_event().await),
    }
}
