// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Registry
//!
//! This module declares exchanges, queues and the bindings between them on the
//! broker and records each declared entity by name. Every declaration goes
//! through an open channel of the shared [`ChannelPool`].
//!
//! The main components are:
//! - `TopologyRegistry`: declares and records topology entities
//! - `Exchange`, `Queue`, `Binding`: the recorded entities

use crate::{
    channel::ChannelPool,
    connection::ConnectionSlot,
    errors::AmqpError,
    exchange::{Exchange, ExchangeDefinition, ExchangeKind},
    queue::{Binding, Queue, QueueBinding, QueueDefinition},
    transport::AmqpChannel,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error, Span};

/// Declares topology on the broker and records it by name.
///
/// Names are unique per entity kind; declaring a name again replaces the
/// recorded entity.
pub struct TopologyRegistry {
    slot: ConnectionSlot,
    pool: Arc<ChannelPool>,
    exchanges: RwLock<HashMap<String, Exchange>>,
    queues: RwLock<HashMap<String, Queue>>,
    bindings: RwLock<HashMap<String, Binding>>,
    span: Span,
}

impl TopologyRegistry {
    pub fn new(slot: ConnectionSlot, pool: Arc<ChannelPool>, span: Span) -> Self {
        TopologyRegistry {
            slot,
            pool,
            exchanges: RwLock::new(HashMap::default()),
            queues: RwLock::new(HashMap::default()),
            bindings: RwLock::new(HashMap::default()),
            span,
        }
    }

    /// Returns an open channel, failing when there is no live connection.
    async fn declaring_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.slot.live().await?;
        Ok(self.pool.channel().await?.channel())
    }

    /// Declares the exchange on the broker and records it.
    pub async fn declare_exchange(&self, def: ExchangeDefinition) -> Result<Exchange, AmqpError> {
        let channel = self.declaring_channel().await?;

        debug!(parent: &self.span, name = %def.name, kind = %def.kind, "creating exchange");

        match channel.exchange_declare(&def).await {
            Err(err) => {
                error!(
                    parent: &self.span,
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(err)
            }
            _ => Ok(()),
        }?;

        let exchange = Exchange::from(&def);
        self.exchanges
            .write()
            .await
            .insert(def.name.clone(), exchange.clone());

        Ok(exchange)
    }

    pub async fn add_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
    ) -> Result<Exchange, AmqpError> {
        let def = ExchangeDefinition::new(name)
            .kind(ExchangeKind::from(kind))
            .durable(durable)
            .auto_delete(auto_delete)
            .internal(internal)
            .no_wait(no_wait);

        self.declare_exchange(def).await
    }

    /// Declares the queue on the broker and records it with the counters the
    /// broker reported.
    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<Queue, AmqpError> {
        let channel = self.declaring_channel().await?;

        debug!(parent: &self.span, name = %def.name, "creating queue");

        let state = match channel.queue_declare(&def).await {
            Err(err) => {
                error!(
                    parent: &self.span,
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(err)
            }
            Ok(state) => Ok(state),
        }?;

        let queue = Queue::new(&def.name, state);
        self.queues
            .write()
            .await
            .insert(def.name.clone(), queue.clone());

        Ok(queue)
    }

    pub async fn add_queue(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        exclusive: bool,
    ) -> Result<Queue, AmqpError> {
        let def = QueueDefinition::new(name)
            .durable(durable)
            .auto_delete(auto_delete)
            .exclusive(exclusive);

        self.declare_queue(def).await
    }

    /// Binds a recorded queue to a recorded exchange.
    pub async fn add_binding(
        &self,
        name: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<Binding, AmqpError> {
        if !self.exchanges.read().await.contains_key(exchange) {
            return Err(AmqpError::ExchangeNotFound(exchange.to_owned()));
        }
        if !self.queues.read().await.contains_key(queue) {
            return Err(AmqpError::QueueNotFound(queue.to_owned()));
        }

        let channel = self.declaring_channel().await?;
        let def = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);

        debug!(
            parent: &self.span,
            exchange, queue, routing_key, "binding queue to exchange"
        );

        channel.queue_bind(&def).await?;

        let binding = Binding::new(name, &def);
        self.bindings
            .write()
            .await
            .insert(name.to_owned(), binding.clone());

        Ok(binding)
    }

    /// Re-reads the counters of a recorded queue with a passive declaration.
    pub async fn refresh_queue(&self, name: &str) -> Result<Queue, AmqpError> {
        let Some(recorded) = self.queue(name).await else {
            return Err(AmqpError::QueueNotFound(name.to_owned()));
        };

        let channel = self.declaring_channel().await?;
        let state = channel
            .queue_declare(&QueueDefinition::new(name).passive())
            .await?;

        let queue = Queue {
            message_count: state.message_count,
            consumer_count: state.consumer_count,
            ..recorded
        };
        self.queues
            .write()
            .await
            .insert(name.to_owned(), queue.clone());

        Ok(queue)
    }

    pub async fn exchange(&self, name: &str) -> Option<Exchange> {
        self.exchanges.read().await.get(name).cloned()
    }

    pub async fn queue(&self, name: &str) -> Option<Queue> {
        self.queues.read().await.get(name).cloned()
    }

    pub async fn binding(&self, name: &str) -> Option<Binding> {
        self.bindings.read().await.get(name).cloned()
    }

    pub async fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exchanges.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}
