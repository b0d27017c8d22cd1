// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Handle
//!
//! This module provides the error types raised by the broker handle and its
//! components. `AmqpError` covers connectivity, resource and configuration
//! failures; `MappingError` covers everything that can go wrong while turning
//! a payload into a typed message (or back).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// The variants fall into four groups:
/// - connectivity: dial failures, exhausted retries, use of a closed connection
/// - resources: missing channels, exchanges or queues, declaration failures
/// - configuration: missing configuration, unimplemented features
/// - mapping: wraps a [`MappingError`] raised while encoding or decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The retry loop gave up after the configured number of attempts
    #[error("max retries reached ({0})")]
    MaxRetriesReached(u32),

    /// An operation required a connection but none is held
    #[error("broker has no connection")]
    NoConnection,

    /// The held connection reports itself closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// No channel could be derived before the deadline elapsed
    #[error("channel error: timeout after {timeout_ms}ms")]
    ChannelTimeout {
        timeout_ms: u64,
        cause: Option<String>,
    },

    /// The channel pool holds no open channel
    #[error("cannot get a channel")]
    NoChannelAvailable,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The exchange was never declared through the registry
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// The queue was never declared through the registry
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// No listener is registered under the given name
    #[error("listener `{0}` not found")]
    ListenerNotFound(String),

    /// No emitter is registered under the given name
    #[error("emitter `{0}` not found")]
    EmitterNotFound(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The broker handle was used before any configuration was supplied
    #[error("no available configuration")]
    MissingConfiguration,

    /// The requested feature is not implemented
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// The operation was abandoned because the broker is shutting down
    #[error("operation cancelled")]
    Cancelled,

    /// A message could not be encoded or decoded
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Errors raised while mapping payloads to typed messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// The static mapper has no case for this type identifier
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    /// The dynamic mapper has no registration for this type identifier
    #[error("no mapping configured for message {0}")]
    NoMapping(String),

    /// A registered shape does not satisfy the message contract
    #[error("type {0} does not implement the message contract")]
    InvalidMessageShape(String),

    /// The payload could not be decoded into the resolved shape
    #[error("cannot unmarshal message {msg_type}: {cause}")]
    DecodeError { msg_type: String, cause: String },

    /// The message could not be encoded for publishing
    #[error("cannot marshal message {msg_type}: {cause}")]
    EncodeError { msg_type: String, cause: String },
}
