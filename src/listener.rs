// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Listener
//!
//! A listener consumes one queue, decodes every delivery through its
//! [`MessageMapper`] and forwards the typed message to the caller. Deliveries
//! that decode are acknowledged; deliveries that do not are rejected without
//! requeue and reported as errors on the same stream. A bad message never
//! stops the consume loop.

use crate::{
    channel::ChannelPool,
    errors::AmqpError,
    mapper::MessageMapper,
    message::{BaseMessage, Payload},
    otel,
    transport::Delivery,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span as _, Status},
    Context,
};
use std::{borrow::Cow, fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};
use uuid::Uuid;

/// Capacity of the stream handed out by [`Listener::listen`].
const LISTENER_BUFFER: usize = 64;

/// A decoded delivery.
pub struct ReceivedMessage {
    pub msg_type: String,
    pub message: Box<dyn BaseMessage>,
    /// Trace context propagated by the publisher.
    pub context: Context,
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("msg_type", &self.msg_type)
            .field("message", &self.message)
            .finish()
    }
}

pub struct Listener {
    name: String,
    exchange: String,
    queue: String,
    mapper: Arc<dyn MessageMapper>,
    pool: Arc<ChannelPool>,
    channel_timeout: Duration,
    cancel: CancellationToken,
    span: Span,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        exchange: &str,
        queue: &str,
        mapper: Arc<dyn MessageMapper>,
        pool: Arc<ChannelPool>,
        channel_timeout: Duration,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Listener {
            name: name.to_owned(),
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            mapper,
            pool,
            channel_timeout,
            cancel,
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Starts consuming the queue.
    ///
    /// The returned stream ends when the broker ends the consumer, when the
    /// receiver is dropped or when the broker handle shuts down.
    pub async fn listen(
        &self,
    ) -> Result<mpsc::Receiver<Result<ReceivedMessage, AmqpError>>, AmqpError> {
        let channel = self.pool.acquire(self.channel_timeout).await?.channel();
        let consumer_tag = format!("{}-{}", self.queue, Uuid::new_v4());

        let mut deliveries = match channel.basic_consume(&self.queue, &consumer_tag).await {
            Err(err) => {
                error!(
                    parent: &self.span,
                    error = err.to_string(),
                    queue = %self.queue,
                    "error to create the consumer"
                );
                Err(err)
            }
            Ok(stream) => Ok(stream),
        }?;

        info!(parent: &self.span, queue = %self.queue, %consumer_tag, "listener started");

        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let mapper = self.mapper.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(
            async move {
                let tracer = global::tracer("amqp listener");

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tx.closed() => break,
                        next = deliveries.next() => next,
                    };

                    let Some(result) = next else {
                        break;
                    };

                    let item = match result {
                        Ok(delivery) => receive(&tracer, mapper.as_ref(), delivery).await,
                        Err(err) => {
                            error!(error = err.to_string(), "errors consume msg");
                            Err(err)
                        }
                    };

                    if tx.send(item).await.is_err() {
                        break;
                    }
                }

                debug!(%consumer_tag, "listener stopped");
            }
            .instrument(self.span.clone()),
        );

        Ok(rx)
    }
}

/// Decodes one delivery and settles it with the broker.
async fn receive(
    tracer: &BoxedTracer,
    mapper: &dyn MessageMapper,
    mut delivery: Delivery,
) -> Result<ReceivedMessage, AmqpError> {
    let (context, mut span) = otel::new_span(&delivery.headers, tracer, &delivery.msg_type);
    let data = std::mem::take(&mut delivery.data);

    match mapper.map_message(&delivery.msg_type, Payload::Bytes(data)) {
        Ok(message) => {
            if let Err(err) = delivery.ack().await {
                error!("error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(err);
            }

            span.set_status(Status::Ok);
            Ok(ReceivedMessage {
                msg_type: delivery.msg_type,
                message,
                context,
            })
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            if let Err(nack_err) = delivery.nack(false).await {
                error!(error = nack_err.to_string(), "error whiling nack msg");
            }

            Err(AmqpError::Mapping(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionSlot,
        errors::MappingError,
        mapper::StaticMapper,
        message::Text,
        transport::{
            AmqpChannel, AmqpConnection, DeliveryStream, MockAcknowledger, MockAmqpChannel,
            MockAmqpConnection,
        },
    };
    use std::sync::Mutex;

    fn acker(acks: usize, nacks: usize) -> Box<MockAcknowledger> {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(acks).returning(|| Ok(()));
        acker
            .expect_nack()
            .withf(|requeue| !requeue)
            .times(nacks)
            .returning(|_| Ok(()));
        Box::new(acker)
    }

    async fn listener_over(channel: MockAmqpChannel, cancel: CancellationToken) -> Listener {
        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);

        let mut conn = MockAmqpConnection::new();
        conn.expect_is_open().return_const(true);
        conn.expect_create_channel()
            .returning(move || Ok(channel.clone()));

        let slot = ConnectionSlot::new();
        slot.replace(Some(Arc::new(conn) as Arc<dyn AmqpConnection>))
            .await;
        let pool = Arc::new(ChannelPool::new(slot, cancel.clone(), Span::none()));

        Listener::new(
            "jobs-listener",
            "jobs-exchange",
            "jobs",
            Arc::new(StaticMapper::new()),
            pool,
            Duration::from_millis(10),
            cancel,
            Span::none(),
        )
    }

    fn consuming(deliveries: Vec<Result<Delivery, AmqpError>>) -> MockAmqpChannel {
        let stream: DeliveryStream = futures_util::stream::iter(deliveries).boxed();
        let stream = Mutex::new(Some(stream));

        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_basic_consume()
            .withf(|queue, tag| queue == "jobs" && tag.starts_with("jobs-"))
            .times(1)
            .returning(move |_, _| match stream.lock().unwrap().take() {
                Some(stream) => Ok(stream),
                None => Err(AmqpError::BindingConsumerError("jobs".to_owned())),
            });
        channel
    }

    #[tokio::test]
    async fn decoded_deliveries_are_acked_and_forwarded() {
        let text = Text::new("hello");
        let delivery = Delivery::new("text", text.encode().unwrap(), acker(1, 0))
            .with_route("jobs-exchange", "jobs");

        let listener = listener_over(consuming(vec![Ok(delivery)]), CancellationToken::new()).await;
        let mut rx = listener.listen().await.unwrap();

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received.msg_type, "text");
        assert_eq!(received.message.downcast_ref::<Text>(), Some(&text));

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn bad_messages_are_rejected_without_stopping_the_loop() {
        let deliveries = vec![
            Ok(Delivery::new("invoice", b"{}".to_vec(), acker(0, 1))),
            Ok(Delivery::new("text", b"{broken".to_vec(), acker(0, 1))),
            Err(AmqpError::ConsumerError("frame error".to_owned())),
            Ok(Delivery::new("message", b"{}".to_vec(), acker(1, 0))),
        ];

        let listener = listener_over(consuming(deliveries), CancellationToken::new()).await;
        let mut rx = listener.listen().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap().unwrap_err(),
            AmqpError::Mapping(MappingError::UnknownMessageType("invoice".to_owned()))
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(AmqpError::Mapping(MappingError::DecodeError { .. }))
        ));
        assert_eq!(
            rx.recv().await.unwrap().unwrap_err(),
            AmqpError::ConsumerError("frame error".to_owned())
        );
        assert_eq!(rx.recv().await.unwrap().unwrap().msg_type, "message");
    }

    #[tokio::test]
    async fn consume_failure_is_returned() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_basic_consume()
            .returning(|queue, _| Err(AmqpError::BindingConsumerError(queue.to_owned())));

        let listener = listener_over(channel, CancellationToken::new()).await;

        assert_eq!(
            listener.listen().await.unwrap_err(),
            AmqpError::BindingConsumerError("jobs".to_owned())
        );
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let stream: DeliveryStream = futures_util::stream::pending().boxed();
        let stream = Mutex::new(Some(stream));

        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_basic_consume()
            .returning(move |_, _| Ok(stream.lock().unwrap().take().unwrap()));

        let cancel = CancellationToken::new();
        let listener = listener_over(channel, cancel.clone()).await;
        let mut rx = listener.listen().await.unwrap();

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
