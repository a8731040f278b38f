// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting Supervisor
//!
//! [`AmqpClient`] builds a fresh [`Consumer`] for every attempt, runs it, and
//! when it ends because of an unintended closure waits before trying again.
//! The wait grows by one second per consecutive failed attempt up to
//! [`MAX_RECONNECT_DELAY_SECS`], and drops back to zero whenever the previous
//! consumer got as far as consuming.

use crate::{
    config::ConsumerConfig,
    consumer::{Consumer, RunOutcome},
    errors::AmqpError,
    handler::MessageHandler,
    observer::{ConsumerObserver, LifecycleEvent},
    transport::Transport,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time;
use tracing::{info, warn};

/// Upper bound of the wait between two reconnect attempts.
pub const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// Linear reconnect backoff.
///
/// Starts at zero, grows by one second per consecutive attempt that never
/// reached consumption and stays at `max` once it gets there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    delay: u64,
    max: u64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::new(MAX_RECONNECT_DELAY_SECS)
    }
}

impl ReconnectBackoff {
    /// Creates a backoff capped at `max_secs` seconds.
    pub fn new(max_secs: u64) -> ReconnectBackoff {
        ReconnectBackoff {
            delay: 0,
            max: max_secs,
        }
    }

    /// Delay before the next attempt, given whether the consumer that just
    /// ended ever reached consumption.
    pub fn next_delay(&mut self, was_consuming: bool) -> Duration {
        if was_consuming {
            self.delay = 0;
        } else {
            self.delay = (self.delay + 1).min(self.max);
        }

        Duration::from_secs(self.delay)
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = err.to_string(), "failure to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Keeps a consumer subscribed across broker failures.
///
/// Every attempt gets a new transport from `transport_factory` and a new
/// handler from `handler_factory`; nothing from a failed attempt is reused
/// except the backoff state.
pub struct AmqpClient<TF, HF> {
    config: ConsumerConfig,
    transport_factory: TF,
    handler_factory: HF,
    observer: Option<Arc<dyn ConsumerObserver>>,
    backoff: ReconnectBackoff,
}

impl<T, H, TF, HF> AmqpClient<TF, HF>
where
    T: Transport,
    H: MessageHandler,
    TF: FnMut(&ConsumerConfig) -> T,
    HF: FnMut() -> H,
{
    /// Creates a supervisor.
    ///
    /// # Parameters
    /// * `config` - Configuration handed to every consumer
    /// * `transport_factory` - Builds the transport for one attempt, e.g.
    ///   [`LapinTransport::for_config`](crate::channel::LapinTransport::for_config)
    /// * `handler_factory` - Builds the message handler for one attempt
    ///
    /// # Returns
    /// A client with the default backoff and no observer
    pub fn new(config: ConsumerConfig, transport_factory: TF, handler_factory: HF) -> Self {
        AmqpClient {
            config,
            transport_factory,
            handler_factory,
            observer: None,
            backoff: ReconnectBackoff::default(),
        }
    }

    /// The observer is handed to every consumer the client creates.
    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replaces the default backoff capped at [`MAX_RECONNECT_DELAY_SECS`].
    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until the process receives ctrl-c or SIGTERM, or until a consumer
    /// ends without asking to reconnect.
    pub async fn run(&mut self, reconnect: bool) -> Result<(), AmqpError> {
        self.run_until(reconnect, shutdown_signal()).await
    }

    /// Runs consumers until `shutdown` resolves.
    ///
    /// Without `reconnect` exactly one consumer runs. With it, a consumer that
    /// ends with `should_reconnect` is replaced after the backoff delay; one
    /// that ends cleanly ends the loop.
    pub async fn run_until<S>(&mut self, reconnect: bool, shutdown: S) -> Result<(), AmqpError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if !reconnect {
            let mut consumer = self.new_consumer();
            let result = consumer.run_until(&mut shutdown).await.map(|_| ());
            self.notify(LifecycleEvent::Terminated);
            return result;
        }

        info!("amqp consumer running in auto-reconnect mode");

        let result = loop {
            let mut consumer = self.new_consumer();

            match consumer.run_until(&mut shutdown).await {
                Err(err) => break Err(err),
                Ok(RunOutcome::Interrupted) => break Ok(()),
                Ok(RunOutcome::Finished) if !consumer.should_reconnect() => break Ok(()),
                Ok(RunOutcome::Finished) => {}
            }

            consumer.stop();
            let delay = self.backoff.next_delay(consumer.was_consuming());
            drop(consumer);

            warn!("reconnecting after {} seconds", delay.as_secs());
            self.notify(LifecycleEvent::Reconnecting { delay });

            tokio::select! {
                _ = &mut shutdown => {
                    info!("interrupt received while waiting to reconnect");
                    break Ok(());
                }
                _ = time::sleep(delay) => {}
            }
        };

        self.notify(LifecycleEvent::Terminated);
        result
    }

    fn new_consumer(&mut self) -> Consumer<T, H> {
        let transport = (self.transport_factory)(&self.config);
        let handler = (self.handler_factory)();

        let consumer = Consumer::new(self.config.clone(), transport, handler);
        match &self.observer {
            Some(observer) => consumer.with_observer(observer.clone()),
            None => consumer,
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        if let Some(observer) = &self.observer {
            observer.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionParams,
        handler::Unhandled,
        message::Delivery,
        mock::{AckingHandler, Broker, Call, Calls, FakeTransport},
        observer::MockConsumerObserver,
    };
    use std::{collections::VecDeque, sync::Mutex};

    fn config() -> ConsumerConfig {
        ConsumerConfig::new("orders", "orders-x", ConnectionParams::new("localhost", 5672))
    }

    /// Hands out one scripted broker per attempt, then refusing brokers.
    fn scripted(
        brokers: Vec<Broker>,
        calls: Calls,
    ) -> impl FnMut(&ConsumerConfig) -> FakeTransport {
        let brokers = Arc::new(Mutex::new(VecDeque::from(brokers)));

        move |_config: &ConsumerConfig| {
            let broker = brokers.lock().unwrap().pop_front().unwrap_or(Broker {
                refuse_connection: true,
                ..Broker::default()
            });
            FakeTransport::with_calls(broker, calls.clone())
        }
    }

    fn recording_observer() -> (Arc<dyn ConsumerObserver>, Arc<Mutex<Vec<LifecycleEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();

        let mut observer = MockConsumerObserver::new();
        observer
            .expect_notify()
            .returning(move |event| recorded.lock().unwrap().push(event));

        (Arc::new(observer), events)
    }

    fn delays(events: &[LifecycleEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Reconnecting { delay } => Some(delay.as_secs()),
                _ => None,
            })
            .collect()
    }

    fn refusing() -> Broker {
        Broker {
            refuse_connection: true,
            ..Broker::default()
        }
    }

    #[test]
    fn should_grow_linearly_and_reset_after_consuming() {
        let mut backoff = ReconnectBackoff::default();

        assert_eq!(backoff.next_delay(false).as_secs(), 1);
        assert_eq!(backoff.next_delay(false).as_secs(), 2);
        assert_eq!(backoff.next_delay(true).as_secs(), 0);
        assert_eq!(backoff.next_delay(false).as_secs(), 1);
    }

    #[test]
    fn should_cap_the_delay() {
        let mut backoff = ReconnectBackoff::default();

        let delays: Vec<u64> = (0..40).map(|_| backoff.next_delay(false).as_secs()).collect();

        assert_eq!(delays[28], 29);
        assert!(delays[29..].iter().all(|d| *d == MAX_RECONNECT_DELAY_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn should_back_off_while_the_broker_refuses_connections() {
        let calls = Calls::default();
        let (observer, events) = recording_observer();
        let mut client = AmqpClient::new(
            config(),
            scripted(vec![refusing(), refusing(), refusing()], calls.clone()),
            AckingHandler::default,
        )
        .with_observer(observer);

        let started = time::Instant::now();
        let result = client
            .run_until(true, time::sleep(Duration::from_millis(5500)))
            .await;

        assert_eq!(result, Ok(()));
        assert!(started.elapsed() >= Duration::from_millis(5500));

        let events = events.lock().unwrap();
        assert_eq!(delays(&events), vec![1, 2, 3]);
        assert_eq!(events.last(), Some(&LifecycleEvent::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn should_reconnect_immediately_after_a_consuming_connection_drops() {
        let calls = Calls::default();
        let (observer, events) = recording_observer();
        let dropping = Broker {
            deliveries: vec![Delivery::new(1, b"order-1")],
            drop_after_consume: true,
            ..Broker::default()
        };
        let handler = AckingHandler::default();
        let bodies = handler.bodies.clone();

        let mut client = AmqpClient::new(
            config(),
            scripted(vec![refusing(), dropping], calls.clone()),
            move || handler.clone(),
        )
        .with_observer(observer);

        client
            .run_until(true, time::sleep(Duration::from_millis(1500)))
            .await
            .unwrap();

        assert_eq!(delays(&events.lock().unwrap())[..2], [1, 0]);
        assert_eq!(bodies.lock().unwrap().clone(), vec![b"order-1".to_vec()]);
        assert!(calls.lock().unwrap().contains(&Call::Ack(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_at_the_cap_without_exceeding_it() {
        let (observer, events) = recording_observer();
        let mut client = AmqpClient::new(
            config(),
            scripted(Vec::new(), Calls::default()),
            AckingHandler::default,
        )
        .with_observer(observer);

        // 1 + 2 + ... + 30 = 465, then two more waits at the cap
        client
            .run_until(true, time::sleep(Duration::from_secs(465 + 31)))
            .await
            .unwrap();

        let delays = delays(&events.lock().unwrap());
        assert_eq!(delays.iter().max(), Some(&MAX_RECONNECT_DELAY_SECS));
        assert_eq!(delays[29..], [30, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_run_once_without_reconnect() {
        let calls = Calls::default();
        let (observer, events) = recording_observer();
        let mut client = AmqpClient::new(
            config(),
            scripted(vec![refusing(), refusing()], calls.clone()),
            AckingHandler::default,
        )
        .with_observer(observer);

        let result = client.run_until(false, std::future::pending()).await;

        assert_eq!(result, Ok(()));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(
            events.lock().unwrap().clone(),
            vec![
                LifecycleEvent::Disconnected {
                    should_reconnect: true,
                    was_consuming: false,
                },
                LifecycleEvent::Terminated,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_end_the_loop_when_interrupted_while_consuming() {
        let calls = Calls::default();
        let mut client = AmqpClient::new(
            config(),
            scripted(vec![Broker::default()], calls.clone()),
            AckingHandler::default,
        );

        let result = client
            .run_until(true, time::sleep(Duration::from_secs(10)))
            .await;

        assert_eq!(result, Ok(()));
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, Call::OpenConnection { .. }))
                .count(),
            1
        );
        assert_eq!(calls.last(), Some(&Call::CloseConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn should_propagate_a_missing_handler() {
        let broker = Broker {
            deliveries: vec![Delivery::new(4, b"lost")],
            ..Broker::default()
        };
        let mut client = AmqpClient::new(
            config(),
            scripted(vec![broker], Calls::default()),
            || Unhandled,
        );

        let result = client.run_until(true, std::future::pending()).await;

        assert_eq!(result, Err(AmqpError::HandlerNotImplemented));
    }
}
