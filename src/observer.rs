// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Lifecycle notifications for collaborators outside the consumer, such as
//! metrics registries, probes or webhook senders. Delivery of those signals is
//! the observer's business; the consumer only reports what happened.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The broker accepted the connection.
    Connected,
    /// The handshake completed and deliveries may now arrive.
    Consuming { consumer_tag: String },
    /// A consumer finished running.
    Disconnected {
        should_reconnect: bool,
        was_consuming: bool,
    },
    /// The supervisor is about to wait before creating a new consumer.
    Reconnecting { delay: Duration },
    /// The supervisor gave up or was interrupted.
    Terminated,
}

#[cfg_attr(test, mockall::automock)]
pub trait ConsumerObserver: Send + Sync {
    fn notify(&self, event: LifecycleEvent);
}
