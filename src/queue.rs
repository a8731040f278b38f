// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions and Bindings
//!
//! This module provides the queue a consumer declares and the bindings that
//! connect it to its exchange. One binding is issued per routing key; an empty
//! key set yields a single binding without a routing key.

use std::fmt;

/// Definition of the queue a consumer declares and consumes from.
///
/// An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Identifies one in-flight Queue.Bind request until the broker acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindRequestId(pub(crate) u64);

impl fmt::Display for BindRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bind#{}", self.0)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: Option<String>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default the exchange name is empty and there is no routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: None,
        }
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// The routing key, or `None` for a binding without one.
    pub fn key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// Expands a resolved routing key list into the bindings to issue.
    ///
    /// No keys means one unconditional binding; otherwise one binding per key.
    pub fn for_routing_keys(queue: &str, exchange: &str, keys: &[String]) -> Vec<QueueBinding> {
        if keys.is_empty() {
            return vec![QueueBinding::new(queue).exchange(exchange)];
        }

        keys.iter()
            .map(|key| QueueBinding::new(queue).exchange(exchange).routing_key(key))
            .collect()
    }
}
