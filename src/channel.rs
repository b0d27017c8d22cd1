// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Pool
//!
//! Channels are derived from the live connection and recorded in a pool with
//! an identity and an open flag. Callers pick the first open channel; a new
//! one is derived on demand through [`ChannelPool::retry_channel`]. A
//! derivation is attempted once and bounded by a timeout; its error is
//! handed back to the caller rather than retried.
//!
//! The pool also owns writes to the connection slot: replacing the
//! connection and flagging the old channels closed happen under the entries
//! lock, so no caller observes a new connection next to channels still
//! flagged open on the old one.

use crate::{
    connection::ConnectionSlot,
    errors::AmqpError,
    transport::{AmqpChannel, AmqpConnection},
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};
use uuid::Uuid;

/// A channel recorded in the pool.
#[derive(Clone)]
pub struct PooledChannel {
    pub id: Uuid,
    pub name: Option<String>,
    channel: Arc<dyn AmqpChannel>,
}

impl PooledChannel {
    fn new(channel: Arc<dyn AmqpChannel>) -> Self {
        PooledChannel {
            id: Uuid::new_v4(),
            name: None,
            channel,
        }
    }

    pub fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.clone()
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct ChannelEntry {
    channel: PooledChannel,
    open: bool,
}

pub struct ChannelPool {
    slot: ConnectionSlot,
    entries: Arc<Mutex<Vec<ChannelEntry>>>,
    cancel: CancellationToken,
    span: Span,
}

impl ChannelPool {
    pub fn new(slot: ConnectionSlot, cancel: CancellationToken, span: Span) -> Self {
        ChannelPool {
            slot,
            entries: Arc::new(Mutex::new(vec![])),
            cancel,
            span,
        }
    }

    /// Derives one channel from the live connection in a background task.
    ///
    /// Exactly one result is delivered: the recorded channel, or
    /// `ChannelTimeout` when the single derivation attempt fails or does not
    /// finish within `timeout`; a failed attempt carries its error as the
    /// cause. A missing or closed connection fails immediately, and so does a
    /// channel whose connection was replaced while it was being derived.
    pub fn retry_channel(
        &self,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<PooledChannel, AmqpError>> {
        let (tx, rx) = oneshot::channel();

        let slot = self.slot.clone();
        let entries = self.entries.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(
            async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(AmqpError::Cancelled),
                    result = derive_channel(&slot, timeout) => result,
                };

                let result = match result {
                    Ok((conn, channel)) => record(&slot, &entries, conn, channel).await,
                    Err(err) => Err(err),
                };

                match &result {
                    Ok(pooled) => info!(id = %pooled.id, "rabbitmq channel obtained"),
                    Err(err @ AmqpError::ChannelTimeout { .. }) => {
                        error!(error = err.to_string(), reason = "timeout", "rabbitmq channel error")
                    }
                    Err(err) => error!(error = err.to_string(), "rabbitmq channel error"),
                }

                let _ = tx.send(result);
            }
            .instrument(self.span.clone()),
        );

        rx
    }

    /// Returns the first channel flagged open.
    ///
    /// Entries whose underlying channel reports closed are flagged closed on
    /// the way.
    pub async fn channel(&self) -> Result<PooledChannel, AmqpError> {
        let mut entries = self.entries.lock().await;

        for entry in entries.iter_mut().filter(|e| e.open) {
            if entry.channel.channel.is_open() {
                return Ok(entry.channel.clone());
            }
            entry.open = false;
        }

        Err(AmqpError::NoChannelAvailable)
    }

    /// Returns an open channel, deriving a new one when none is recorded.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledChannel, AmqpError> {
        match self.channel().await {
            Ok(channel) => Ok(channel),
            Err(AmqpError::NoChannelAvailable) => match self.retry_channel(timeout).await {
                Ok(result) => result,
                Err(_) => Err(AmqpError::Cancelled),
            },
            Err(err) => Err(err),
        }
    }

    pub async fn name_channel(&self, id: Uuid, name: &str) -> Result<(), AmqpError> {
        let mut entries = self.entries.lock().await;

        match entries.iter_mut().find(|e| e.channel.id == id) {
            Some(entry) => {
                entry.channel.name = Some(name.to_owned());
                Ok(())
            }
            None => Err(AmqpError::NoChannelAvailable),
        }
    }

    /// Flags the channel closed and closes it on the broker.
    pub async fn close_channel(&self, id: Uuid) -> Result<(), AmqpError> {
        let channel = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.iter_mut().find(|e| e.channel.id == id && e.open) else {
                return Ok(());
            };
            entry.open = false;
            entry.channel.channel()
        };

        if channel.is_open() {
            channel.close().await?;
        }

        Ok(())
    }

    /// Stores `conn` in the connection slot and flags every recorded channel
    /// closed, both under the entries lock. Returns the replaced connection,
    /// which the caller closes.
    pub async fn replace_connection(
        &self,
        conn: Option<Arc<dyn AmqpConnection>>,
    ) -> Option<Arc<dyn AmqpConnection>> {
        let mut entries = self.entries.lock().await;
        let stale = self.slot.replace(conn).await;
        invalidate(&mut entries);
        stale
    }

    /// Flags every recorded channel closed.
    pub async fn invalidate_all(&self) {
        invalidate(&mut self.entries.lock().await);
    }

    /// Drops closed entries, returning how many were removed.
    pub async fn prune(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.open);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn open_count(&self) -> usize {
        self.entries.lock().await.iter().filter(|e| e.open).count()
    }
}

fn invalidate(entries: &mut [ChannelEntry]) {
    for entry in entries.iter_mut() {
        entry.open = false;
    }
    debug!(count = entries.len(), "channels invalidated");
}

async fn derive_channel(
    slot: &ConnectionSlot,
    timeout: Duration,
) -> Result<(Arc<dyn AmqpConnection>, Arc<dyn AmqpChannel>), AmqpError> {
    let conn = slot.live().await?;
    let timeout_ms = timeout.as_millis() as u64;

    match tokio::time::timeout(timeout, conn.create_channel()).await {
        Ok(Ok(channel)) => Ok((conn, channel)),
        Ok(Err(err)) => Err(AmqpError::ChannelTimeout {
            timeout_ms,
            cause: Some(err.to_string()),
        }),
        Err(_) => Err(AmqpError::ChannelTimeout {
            timeout_ms,
            cause: None,
        }),
    }
}

/// Records a derived channel as open, unless the connection it came from has
/// been replaced in the meantime.
async fn record(
    slot: &ConnectionSlot,
    entries: &Mutex<Vec<ChannelEntry>>,
    conn: Arc<dyn AmqpConnection>,
    channel: Arc<dyn AmqpChannel>,
) -> Result<PooledChannel, AmqpError> {
    let mut entries = entries.lock().await;

    match slot.get().await {
        Some(current) if Arc::ptr_eq(&current, &conn) => {
            let pooled = PooledChannel::new(channel);
            entries.push(ChannelEntry {
                channel: pooled.clone(),
                open: true,
            });
            Ok(pooled)
        }
        _ => Err(AmqpError::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockAmqpChannel, MockAmqpConnection};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Connection whose channel derivation blocks until released.
    #[derive(Default)]
    struct GatedConnection {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl AmqpConnection for GatedConnection {
        fn is_open(&self) -> bool {
            true
        }

        async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(open_channel())
        }

        async fn close(&self) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    fn open_channel() -> Arc<dyn AmqpChannel> {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_close().returning(|| Ok(()));
        Arc::new(channel)
    }

    async fn pool_with(conn: MockAmqpConnection) -> ChannelPool {
        let slot = ConnectionSlot::new();
        slot.replace(Some(Arc::new(conn) as Arc<dyn AmqpConnection>))
            .await;
        ChannelPool::new(slot, CancellationToken::new(), Span::none())
    }

    async fn pool_with_gated(conn: Arc<GatedConnection>) -> ChannelPool {
        let slot = ConnectionSlot::new();
        slot.replace(Some(conn as Arc<dyn AmqpConnection>)).await;
        ChannelPool::new(slot, CancellationToken::new(), Span::none())
    }

    fn healthy_connection() -> MockAmqpConnection {
        let mut conn = MockAmqpConnection::new();
        conn.expect_is_open().return_const(true);
        conn.expect_create_channel()
            .returning(|| Ok(open_channel()));
        conn
    }

    #[tokio::test]
    async fn zero_timeout_against_failing_connection_times_out() {
        let mut conn = MockAmqpConnection::new();
        conn.expect_is_open().return_const(true);
        conn.expect_create_channel()
            .returning(|| Err(AmqpError::ChannelError("channel max reached".to_owned())));

        let pool = pool_with(conn).await;
        let result = pool.retry_channel(Duration::ZERO).await.unwrap();

        assert_eq!(
            result.unwrap_err(),
            AmqpError::ChannelTimeout {
                timeout_ms: 0,
                cause: Some("failure to create a channel: channel max reached".to_owned()),
            }
        );
        assert!(pool.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn derivation_error_is_surfaced_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut conn = MockAmqpConnection::new();
        conn.expect_is_open().return_const(true);
        conn.expect_create_channel().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AmqpError::ChannelError("busy".to_owned()))
            } else {
                Ok(open_channel())
            }
        });

        let pool = pool_with(conn).await;
        let result = pool
            .retry_channel(Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(
            result.unwrap_err(),
            AmqpError::ChannelTimeout {
                timeout_ms: 200,
                cause: Some("failure to create a channel: busy".to_owned()),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_derivation_times_out_without_cause() {
        let pool = pool_with_gated(Arc::new(GatedConnection::default())).await;
        let result = pool.retry_channel(Duration::from_millis(50)).await.unwrap();

        assert_eq!(
            result.unwrap_err(),
            AmqpError::ChannelTimeout {
                timeout_ms: 50,
                cause: None,
            }
        );
    }

    #[tokio::test]
    async fn channel_derived_during_a_reconnect_is_not_handed_out() {
        let gated = Arc::new(GatedConnection::default());
        let pool = pool_with_gated(gated.clone()).await;

        let pending = pool.retry_channel(Duration::from_secs(5));
        gated.entered.notified().await;

        let stale = pool
            .replace_connection(Some(Arc::new(healthy_connection())))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&stale, &(gated.clone() as Arc<dyn AmqpConnection>)));

        gated.release.notify_one();
        assert_eq!(pending.await.unwrap().unwrap_err(), AmqpError::ConnectionClosed);
        assert!(pool.is_empty().await);

        let fresh = pool.retry_channel(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(pool.channel().await.unwrap().id, fresh.id);
        assert_eq!(pool.open_count().await, 1);
    }

    #[tokio::test]
    async fn replacing_the_connection_flags_old_channels_closed() {
        let pool = pool_with(healthy_connection()).await;
        let old = pool.acquire(Duration::from_millis(10)).await.unwrap();

        let stale = pool
            .replace_connection(Some(Arc::new(healthy_connection())))
            .await;
        assert!(stale.is_some());
        assert_eq!(pool.channel().await.unwrap_err(), AmqpError::NoChannelAvailable);

        let new = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_ne!(old.id, new.id);
        assert_eq!(pool.open_count().await, 1);

        assert!(pool.replace_connection(None).await.is_some());
        assert_eq!(pool.open_count().await, 0);
        assert_eq!(
            pool.retry_channel(Duration::from_millis(10)).await.unwrap().unwrap_err(),
            AmqpError::NoConnection
        );
    }

    #[tokio::test]
    async fn obtained_channel_is_recorded_open() {
        let pool = pool_with(healthy_connection()).await;

        let pooled = pool
            .retry_channel(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.open_count().await, 1);
        assert_eq!(pool.channel().await.unwrap().id, pooled.id);
    }

    #[tokio::test]
    async fn missing_connection_fails_fast() {
        let pool = ChannelPool::new(ConnectionSlot::new(), CancellationToken::new(), Span::none());

        let result = pool.retry_channel(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.unwrap_err(), AmqpError::NoConnection);
    }

    #[tokio::test]
    async fn closed_channels_are_never_handed_out() {
        let pool = pool_with(healthy_connection()).await;

        let first = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let second = pool.retry_channel(Duration::from_millis(10)).await.unwrap().unwrap();

        pool.close_channel(first.id).await.unwrap();
        assert_eq!(pool.channel().await.unwrap().id, second.id);

        pool.close_channel(second.id).await.unwrap();
        assert_eq!(pool.channel().await.unwrap_err(), AmqpError::NoChannelAvailable);

        assert_eq!(pool.len().await, 2);
        assert_eq!(pool.prune().await, 2);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn stale_underlying_channel_is_flagged_closed() {
        let mut conn = MockAmqpConnection::new();
        conn.expect_is_open().return_const(true);
        conn.expect_create_channel().returning(|| {
            let mut channel = MockAmqpChannel::new();
            channel.expect_is_open().return_const(false);
            Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
        });

        let pool = pool_with(conn).await;
        pool.retry_channel(Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(pool.channel().await.unwrap_err(), AmqpError::NoChannelAvailable);
        assert_eq!(pool.open_count().await, 0);
    }

    #[tokio::test]
    async fn invalidation_flags_every_channel_closed() {
        let pool = pool_with(healthy_connection()).await;
        let pooled = pool.acquire(Duration::from_millis(10)).await.unwrap();
        pool.name_channel(pooled.id, "publisher").await.unwrap();
        assert_eq!(pool.channel().await.unwrap().name.as_deref(), Some("publisher"));

        pool.invalidate_all().await;

        assert_eq!(pool.open_count().await, 0);
        assert_eq!(pool.len().await, 1);
    }
}
