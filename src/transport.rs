// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The broker handle never talks to the wire protocol directly. It drives the
//! traits in this module, which the [`crate::amqp`] module implements on top of
//! lapin. Keeping the seam narrow (dial, liveness, channel derivation,
//! declarations, publish, consume with acknowledgement) lets every component
//! above it be exercised against mocks.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::{QueueBinding, QueueDefinition}};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// Value of a broker-specific argument (`x-message-ttl`, `x-delayed-type`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    LongInt(i32),
    LongLongInt(i64),
    LongString(String),
}

/// Argument table attached to exchange and queue declarations.
pub type FieldArguments = BTreeMap<String, FieldValue>;

/// Snapshot of broker-side queue counters returned by a declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: String,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Settles a single delivery with the broker.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
pub struct Delivery {
    pub msg_type: String,
    pub exchange: String,
    pub routing_key: String,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(msg_type: &str, data: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            msg_type: msg_type.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
            headers: BTreeMap::default(),
            data,
            acker,
        }
    }

    pub fn with_route(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("msg_type", &self.msg_type)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("len", &self.data.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A protocol channel derived from a connection.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueState, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_publish(&self, msg: OutboundMessage) -> Result<(), AmqpError>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An established broker connection.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Dials broker connections.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, uri: &str, connection_name: &str)
        -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}
