// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Emitter
//!
//! An emitter publishes messages to one exchange. Callers hand messages to a
//! bounded outbound channel and get back a per-message result slot; a single
//! worker task encodes and publishes the envelopes in order. A failed publish
//! is reported on its own slot and the worker moves on to the next message.

use crate::{
    channel::ChannelPool, errors::AmqpError, message::BaseMessage, otel,
    transport::OutboundMessage,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument, Span};
use uuid::Uuid;

/// Capacity of the outbound channel of every emitter.
const EMITTER_BUFFER: usize = 64;

/// A message waiting to be published, paired with the slot its outcome is
/// reported on.
#[derive(Debug)]
pub struct EmittedMessage {
    pub message: Box<dyn BaseMessage>,
    pub headers: BTreeMap<String, String>,
    pub context: Context,
    pub error_tx: oneshot::Sender<Result<(), AmqpError>>,
}

impl EmittedMessage {
    pub fn new(
        message: Box<dyn BaseMessage>,
    ) -> (EmittedMessage, oneshot::Receiver<Result<(), AmqpError>>) {
        let (error_tx, error_rx) = oneshot::channel();

        let envelope = EmittedMessage {
            message,
            headers: BTreeMap::default(),
            context: Context::current(),
            error_tx,
        };

        (envelope, error_rx)
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone)]
struct Target {
    exchange: String,
    routing_key: String,
}

pub struct Emitter {
    name: String,
    target: Target,
    outbound: mpsc::Sender<EmittedMessage>,
}

impl Emitter {
    /// Creates the emitter and spawns its worker; must be called inside a
    /// tokio runtime.
    ///
    /// An empty `routing_key` publishes to the exchange directly.
    pub fn new(
        name: &str,
        exchange: &str,
        routing_key: &str,
        pool: Arc<ChannelPool>,
        channel_timeout: Duration,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        let target = Target {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        let (outbound, rx) = mpsc::channel(EMITTER_BUFFER);

        tokio::spawn(
            run(rx, target.clone(), pool, channel_timeout, cancel.child_token())
                .instrument(span),
        );

        Emitter {
            name: name.to_owned(),
            target,
            outbound,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.target.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.target.routing_key
    }

    /// Enqueues an envelope built by [`EmittedMessage::new`].
    ///
    /// Fails with `Cancelled` once the worker has stopped; the envelope's slot
    /// is dropped in that case.
    pub async fn send(&self, envelope: EmittedMessage) -> Result<(), AmqpError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| AmqpError::Cancelled)
    }

    /// Enqueues `message` and returns the slot its publish outcome arrives on.
    pub async fn emit(
        &self,
        message: Box<dyn BaseMessage>,
    ) -> oneshot::Receiver<Result<(), AmqpError>> {
        let (envelope, error_rx) = EmittedMessage::new(message);

        if let Err(err) = self.send(envelope).await {
            debug!(error = err.to_string(), emitter = %self.name, "emitter is closed");
        }

        error_rx
    }

    /// Enqueues `message` and waits for its publish outcome.
    pub async fn publish(&self, message: Box<dyn BaseMessage>) -> Result<(), AmqpError> {
        match self.emit(message).await.await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::Cancelled),
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<EmittedMessage>,
    target: Target,
    pool: Arc<ChannelPool>,
    channel_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let EmittedMessage {
            message,
            headers,
            context,
            error_tx,
        } = envelope;

        let result = publish_one(
            &target,
            &pool,
            channel_timeout,
            message.as_ref(),
            headers,
            &context,
        )
        .await;

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                msg_type = message.msg_type(),
                exchange = %target.exchange,
                "error publishing message"
            );
        }

        let _ = error_tx.send(result);
    }

    debug!(exchange = %target.exchange, "emitter stopped");
}

async fn publish_one(
    target: &Target,
    pool: &ChannelPool,
    channel_timeout: Duration,
    message: &dyn BaseMessage,
    mut headers: BTreeMap<String, String>,
    context: &Context,
) -> Result<(), AmqpError> {
    let data = message.encode()?;

    otel::inject_context(context, &mut headers);

    let channel = pool.acquire(channel_timeout).await?.channel();

    channel
        .basic_publish(OutboundMessage {
            exchange: target.exchange.clone(),
            routing_key: target.routing_key.clone(),
            msg_type: message.msg_type().to_owned(),
            message_id: Uuid::new_v4().to_string(),
            headers,
            data,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionSlot,
        message::Text,
        transport::{AmqpChannel, AmqpConnection, MockAmqpChannel, MockAmqpConnection},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn emitter_over(channel: MockAmqpChannel, routing_key: &str) -> Emitter {
        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);

        let mut conn = MockAmqpConnection::new();
        conn.expect_is_open().return_const(true);
        conn.expect_create_channel()
            .returning(move || Ok(channel.clone()));

        let slot = ConnectionSlot::new();
        slot.replace(Some(Arc::new(conn) as Arc<dyn AmqpConnection>))
            .await;
        let cancel = CancellationToken::new();
        let pool = Arc::new(ChannelPool::new(slot, cancel.clone(), Span::none()));

        Emitter::new(
            "orders-emitter",
            "orders",
            routing_key,
            pool,
            Duration::from_millis(10),
            cancel,
            Span::none(),
        )
    }

    #[tokio::test]
    async fn failed_publish_does_not_stop_the_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_basic_publish().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AmqpError::PublishingError("channel closed by broker".to_owned()))
            } else {
                Ok(())
            }
        });

        let emitter = emitter_over(channel, "").await;

        let first = emitter.emit(Box::new(Text::new("one"))).await;
        let second = emitter.emit(Box::new(Text::new("two"))).await;

        assert_eq!(
            first.await.unwrap(),
            Err(AmqpError::PublishingError("channel closed by broker".to_owned()))
        );
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn published_message_carries_type_id_and_route() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_basic_publish()
            .withf(|msg| {
                msg.exchange == "orders"
                    && msg.routing_key == "invoices"
                    && msg.msg_type == "text"
                    && Uuid::parse_str(&msg.message_id).is_ok()
                    && msg.headers.get("tenant").map(String::as_str) == Some("acme")
                    && msg.data == br#"{"Body":"paid"}"#.to_vec()
            })
            .times(1)
            .returning(|_| Ok(()));

        let emitter = emitter_over(channel, "invoices").await;

        let mut headers = BTreeMap::new();
        headers.insert("tenant".to_owned(), "acme".to_owned());
        let (envelope, slot) = EmittedMessage::new(Box::new(Text::new("paid")));
        emitter.send(envelope.with_headers(headers)).await.unwrap();

        assert_eq!(slot.await.unwrap(), Ok(()));
        assert_eq!(emitter.exchange(), "orders");
        assert_eq!(emitter.routing_key(), "invoices");
    }

    #[tokio::test]
    async fn publish_waits_for_the_outcome() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_basic_publish().returning(|_| Ok(()));

        let emitter = emitter_over(channel, "").await;

        assert_eq!(emitter.publish(Box::new(Text::new("hi"))).await, Ok(()));
    }
}
