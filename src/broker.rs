// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Handle
//!
//! [`RabbitMQ`] is the only object callers hold. It composes the connection
//! manager, the channel pool and the topology registry, and keeps the named
//! listeners and emitters built on top of them. Every component shares the
//! same connection slot, so a reconnect through the handle is seen by all of
//! them.
//!
//! ```no_run
//! use broker::{amqp::LapinTransport, broker::RabbitMQ, config::{EnvConfig, RabbitMQConfigs}};
//!
//! # async fn run() -> Result<(), broker::errors::AmqpError> {
//! let cfg = RabbitMQConfigs::from_source(&EnvConfig::new());
//! let rabbit = RabbitMQ::start(cfg, LapinTransport::new()).await?;
//!
//! rabbit.add_exchange("orders", "topic", true, false, false, false).await?;
//! rabbit.add_emitter("orders", "orders", &[]).await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::{ChannelPool, PooledChannel},
    config::RabbitMQConfigs,
    connection::ConnectionManager,
    emitter::Emitter,
    errors::AmqpError,
    exchange::{Exchange, ExchangeDefinition},
    listener::Listener,
    mapper::{MessageMapper, StaticMapper},
    queue::{Binding, Queue, QueueDefinition},
    topology::TopologyRegistry,
    transport::{AmqpConnection, Transport},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Span};

/// Builds the mapper handed to every new listener.
pub type MapperFactory = Arc<dyn Fn() -> Arc<dyn MessageMapper> + Send + Sync>;

pub struct RabbitMQ {
    cfg: RwLock<Option<RabbitMQConfigs>>,
    transport: Arc<dyn Transport>,
    connection: ConnectionManager,
    pool: Arc<ChannelPool>,
    topology: TopologyRegistry,
    listeners: RwLock<HashMap<String, Arc<Listener>>>,
    emitters: RwLock<HashMap<String, Arc<Emitter>>>,
    mapper_factory: MapperFactory,
    cancel: CancellationToken,
    span: Span,
}

impl RabbitMQ {
    /// Creates an unconnected handle.
    ///
    /// Listeners get a [`StaticMapper`] unless another factory is installed
    /// with [`RabbitMQ::with_mapper`].
    pub fn new(cfg: Option<RabbitMQConfigs>, transport: Arc<dyn Transport>) -> Self {
        let name = cfg
            .as_ref()
            .map(|cfg| cfg.name.clone())
            .unwrap_or_else(|| RabbitMQConfigs::default().name);
        let span = info_span!("rabbitmq", handler = %name);

        Self::build(
            cfg,
            transport,
            Arc::new(|| Arc::new(StaticMapper::new()) as Arc<dyn MessageMapper>),
            span,
        )
    }

    fn build(
        cfg: Option<RabbitMQConfigs>,
        transport: Arc<dyn Transport>,
        mapper_factory: MapperFactory,
        span: Span,
    ) -> Self {
        let cancel = CancellationToken::new();
        let connection = ConnectionManager::new(transport.clone(), cancel.clone(), span.clone());
        let slot = connection.slot();
        let pool = Arc::new(ChannelPool::new(slot.clone(), cancel.clone(), span.clone()));
        let topology = TopologyRegistry::new(slot, pool.clone(), span.clone());

        RabbitMQ {
            cfg: RwLock::new(cfg),
            transport,
            connection,
            pool,
            topology,
            listeners: RwLock::new(HashMap::default()),
            emitters: RwLock::new(HashMap::default()),
            mapper_factory,
            cancel,
            span,
        }
    }

    /// Replaces the span every log line of the handle is recorded under.
    ///
    /// Meant for construction time: components are rebuilt, so anything
    /// declared or connected before is dropped.
    pub fn with_span(self, span: Span) -> Self {
        let RabbitMQ {
            cfg,
            transport,
            mapper_factory,
            cancel,
            ..
        } = self;
        cancel.cancel();

        Self::build(cfg.into_inner(), transport, mapper_factory, span)
    }

    /// Installs the factory that builds the mapper of every new listener.
    pub fn with_mapper<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn MessageMapper> + Send + Sync + 'static,
    {
        self.mapper_factory = Arc::new(factory);
        self
    }

    /// Creates a handle, connects with retry and derives the first channel.
    ///
    /// Failing to connect or to obtain the channel is fatal.
    pub async fn start(
        cfg: RabbitMQConfigs,
        transport: Arc<dyn Transport>,
    ) -> Result<RabbitMQ, AmqpError> {
        let rabbit = RabbitMQ::new(Some(cfg), transport);

        rabbit.connect(true).await?;

        let timeout = rabbit.channel_timeout().await;
        match rabbit.retry_channel(timeout).await {
            Ok(Ok(_)) => Ok(rabbit),
            Ok(Err(err)) => {
                error!(parent: &rabbit.span, error = err.to_string(), "rabbitmq start failed");
                Err(err)
            }
            Err(_) => Err(AmqpError::Cancelled),
        }
    }

    pub async fn set_config(&self, cfg: RabbitMQConfigs) {
        *self.cfg.write().await = Some(cfg);
    }

    pub async fn config(&self) -> Option<RabbitMQConfigs> {
        self.cfg.read().await.clone()
    }

    /// Logical handler name, also used as the connection name.
    pub async fn name(&self) -> String {
        match self.cfg.read().await.as_ref() {
            Some(cfg) => cfg.name.clone(),
            None => RabbitMQConfigs::default().name,
        }
    }

    async fn required_config(&self) -> Result<RabbitMQConfigs, AmqpError> {
        self.config().await.ok_or(AmqpError::MissingConfiguration)
    }

    async fn channel_timeout(&self) -> Duration {
        let ms = match self.cfg.read().await.as_ref() {
            Some(cfg) => cfg.channel_timeout_ms,
            None => RabbitMQConfigs::default().channel_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Connects, or reconnects, the handle.
    ///
    /// The new connection replaces the old one in the shared slot and every
    /// pooled channel of the old connection is flagged closed in the same
    /// step. The old connection is closed afterwards.
    pub async fn connect(&self, retry: bool) -> Result<(), AmqpError> {
        let cfg = self.required_config().await?;

        let conn = self.connection.dial(&cfg, retry).await?;
        let stale = self.pool.replace_connection(Some(conn)).await;
        self.connection.retire(stale).await;

        info!(parent: &self.span, host = cfg.redacted_url(), "rabbitmq connected");
        Ok(())
    }

    /// Dials once without storing the connection.
    pub async fn connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let cfg = self.required_config().await?;
        self.connection.connection(&cfg).await
    }

    /// Starts a retry cycle without storing its outcome.
    pub async fn retry_connection(
        &self,
    ) -> Result<oneshot::Receiver<Option<Arc<dyn AmqpConnection>>>, AmqpError> {
        let cfg = self.required_config().await?;
        Ok(self.connection.retry_connection(&cfg))
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub fn retry_channel(
        &self,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<PooledChannel, AmqpError>> {
        self.pool.retry_channel(timeout)
    }

    pub async fn channel(&self) -> Result<PooledChannel, AmqpError> {
        self.pool.channel().await
    }

    pub fn channels(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
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
        self.topology
            .add_exchange(name, kind, durable, auto_delete, internal, no_wait)
            .await
    }

    pub async fn declare_exchange(&self, def: ExchangeDefinition) -> Result<Exchange, AmqpError> {
        self.topology.declare_exchange(def).await
    }

    pub async fn add_queue(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        exclusive: bool,
    ) -> Result<Queue, AmqpError> {
        self.topology
            .add_queue(name, durable, auto_delete, exclusive)
            .await
    }

    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<Queue, AmqpError> {
        self.topology.declare_queue(def).await
    }

    pub async fn add_binding(
        &self,
        name: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<Binding, AmqpError> {
        self.topology
            .add_binding(name, exchange, queue, routing_key)
            .await
    }

    pub async fn refresh_queue(&self, name: &str) -> Result<Queue, AmqpError> {
        self.topology.refresh_queue(name).await
    }

    /// Records a listener on `queue` with a fresh mapper.
    pub async fn add_listener(
        &self,
        name: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<Arc<Listener>, AmqpError> {
        if self.connection.slot().get().await.is_none() {
            return Err(AmqpError::NoConnection);
        }

        let listener = Arc::new(Listener::new(
            name,
            exchange,
            queue,
            (self.mapper_factory)(),
            self.pool.clone(),
            self.channel_timeout().await,
            self.cancel.clone(),
            self.span.clone(),
        ));

        self.listeners
            .write()
            .await
            .insert(name.to_owned(), listener.clone());

        Ok(listener)
    }

    pub async fn listener(&self, name: &str) -> Result<Arc<Listener>, AmqpError> {
        match self.listeners.read().await.get(name) {
            Some(listener) => Ok(listener.clone()),
            None => Err(AmqpError::ListenerNotFound(name.to_owned())),
        }
    }

    /// Records an emitter publishing to `exchange`.
    ///
    /// Without a queue messages are published with an empty routing key; a
    /// single queue name becomes the routing key. Binding several queues to
    /// one emitter is not supported.
    pub async fn add_emitter(
        &self,
        name: &str,
        exchange: &str,
        queues: &[&str],
    ) -> Result<Arc<Emitter>, AmqpError> {
        let routing_key = match queues {
            [] => "",
            [queue] => *queue,
            _ => return Err(AmqpError::Unimplemented("multi-queue binding".to_owned())),
        };

        if self.connection.slot().get().await.is_none() {
            return Err(AmqpError::NoConnection);
        }

        let emitter = Arc::new(Emitter::new(
            name,
            exchange,
            routing_key,
            self.pool.clone(),
            self.channel_timeout().await,
            self.cancel.clone(),
            self.span.clone(),
        ));

        self.emitters
            .write()
            .await
            .insert(name.to_owned(), emitter.clone());

        Ok(emitter)
    }

    pub async fn emitter(&self, name: &str) -> Result<Arc<Emitter>, AmqpError> {
        match self.emitters.read().await.get(name) {
            Some(emitter) => Ok(emitter.clone()),
            None => Err(AmqpError::EmitterNotFound(name.to_owned())),
        }
    }

    /// Stops every background task, drops listeners and emitters and closes
    /// the connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        self.cancel.cancel();

        self.listeners.write().await.clear();
        self.emitters.write().await.clear();

        info!(parent: &self.span, "rabbitmq shutting down");
        match self.pool.replace_connection(None).await {
            Some(conn) if conn.is_open() => conn.close().await,
            _ => Ok(()),
        }
    }
}
