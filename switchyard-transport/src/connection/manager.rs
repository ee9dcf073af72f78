//! Pools keyed by destination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_core::{Providers, Url};
use tokio::sync::OnceCell;

use super::{
    ConnectError, Connection, ConnectionEvent, ConnectionEventListener, ConnectionFactory,
    ConnectionPool, ConnectionSelectStrategy, DefaultConnectionFactory, HealOutcome, PoolHealer,
    RandomSelectStrategy, Reconnector,
};
use crate::config::TransportConfig;
use crate::protocol::ProtocolRegistry;

/// Owns every pool of a client or a connection-managing server.
///
/// Each destination's pool is built by exactly one caller; concurrent first
/// callers wait on the same construction and observe the same pool.
pub struct ConnectionManager<P: Providers> {
    providers: P,
    config: TransportConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    strategy: Arc<dyn ConnectionSelectStrategy>,
    pools: DashMap<String, Arc<OnceCell<Arc<ConnectionPool>>>>,
    reconnector: OnceLock<Arc<dyn Reconnector>>,
    closed: AtomicBool,
}

impl<P: Providers> ConnectionManager<P> {
    /// Manager dialing through the default factory.
    ///
    /// Connections it creates report their lifecycle back to the manager,
    /// which evicts closed connections and queues reconnects.
    pub fn new(providers: P, protocols: Arc<ProtocolRegistry>, config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let listener: Weak<dyn ConnectionEventListener> = weak.clone();
            let factory = DefaultConnectionFactory::new(providers.clone(), protocols, config.clone())
                .with_events(listener);
            Self::build(providers, config, Some(Arc::new(factory)))
        })
    }

    /// Manager dialing through `factory`.
    pub fn with_factory(providers: P, config: TransportConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self::build(providers, config, Some(factory)))
    }

    /// Manager that only tracks connections handed to [`add`](Self::add).
    pub fn inbound(providers: P, config: TransportConfig) -> Arc<Self> {
        Arc::new(Self::build(providers, config, None))
    }

    fn build(providers: P, config: TransportConfig, factory: Option<Arc<dyn ConnectionFactory>>) -> Self {
        let strategy = Arc::new(RandomSelectStrategy::new(providers.random().clone()));
        Self {
            providers,
            config,
            factory,
            strategy,
            pools: DashMap::new(),
            reconnector: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Route reconnect requests for failed connections to `reconnector`.
    ///
    /// Only the first reconnector set is kept.
    pub fn set_reconnector(&self, reconnector: Arc<dyn Reconnector>) -> bool {
        self.reconnector.set(reconnector).is_ok()
    }

    /// The configuration pools are built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<Arc<ConnectionPool>>> {
        self.pools.entry(key.to_string()).or_default().clone()
    }

    fn new_pool(&self, key: &str) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            key,
            self.strategy.clone(),
            self.config.max_connections_per_url,
        ))
    }

    fn target_for(&self, url: &Url) -> usize {
        url.connections()
            .unwrap_or(self.config.default_connections_per_url)
    }

    /// The pool for `url`, building and warming it on first use.
    ///
    /// # Errors
    ///
    /// Fails if the inline dials of the first warm-up fail. The next caller
    /// retries construction.
    pub async fn get_or_create_pool(&self, url: &Url) -> Result<Arc<ConnectionPool>, ConnectError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Shutdown);
        }
        let key = url.pool_key();
        let cell = self.cell(&key);
        let pool = cell.get_or_try_init(|| self.construct_pool(url, &key)).await?;
        Ok(pool.clone())
    }

    async fn construct_pool(&self, url: &Url, key: &str) -> Result<Arc<ConnectionPool>, ConnectError> {
        let factory = self.factory.clone().ok_or(ConnectError::NoFactory)?;
        let pool = self.new_pool(key);
        let target = self.target_for(url);
        tracing::debug!(pool = %key, target, "building connection pool");

        match pool
            .heal_to_target(
                factory,
                url,
                target,
                self.config.connect_timeout,
                self.config.sync_create_count.max(1),
                self.providers.task(),
            )
            .await
        {
            Ok(_) => Ok(pool),
            Err(e) => {
                pool.close_all();
                Err(e)
            }
        }
    }

    /// The pool for `key`, if built.
    pub fn get_pool(&self, key: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(key).and_then(|cell| cell.get().cloned())
    }

    /// A live pooled connection for `url`, without dialing.
    pub fn get_connection(&self, url: &Url) -> Option<Arc<Connection>> {
        self.get_pool(&url.pool_key())?.get_connection()
    }

    /// A live connection for `url`, dialing if the pool has none.
    pub async fn get_or_create_connection(&self, url: &Url) -> Result<Arc<Connection>, ConnectError> {
        let pool = self.get_or_create_pool(url).await?;
        if let Some(connection) = pool.get_connection() {
            return Ok(connection);
        }
        let connection = self.create_connection(url).await?;
        if !pool.add(connection.clone()) {
            tracing::debug!(pool = %pool.key(), "pool full, using unpooled connection");
        }
        Ok(connection)
    }

    /// Dial a fresh, unpooled connection to `url`.
    pub async fn create_connection(&self, url: &Url) -> Result<Arc<Connection>, ConnectError> {
        let factory = self.factory.as_ref().ok_or(ConnectError::NoFactory)?;
        factory.create(url, self.config.connect_timeout).await
    }

    /// Pool `connection` under its own key.
    pub async fn add(&self, connection: Arc<Connection>) -> bool {
        let key = connection.pool_key().to_string();
        loop {
            let cell = self.cell(&key);
            let pool = cell.get_or_init(|| async { self.new_pool(&key) }).await;
            let added = pool.add(connection.clone());
            let current = self
                .pools
                .get(&key)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &cell));
            if current {
                return added;
            }
            // the pool was dropped as empty between lookup and insert
            if added {
                pool.remove(&connection);
            }
        }
    }

    /// Evict `connection` from its pool and close it.
    ///
    /// Inbound pools are keyed by peer address and dropped once empty.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let key = connection.pool_key();
        let removed = self.get_pool(key).is_some_and(|pool| pool.remove(connection));
        connection.close();
        if connection.url().is_none() {
            self.drop_if_empty(key);
        }
        removed
    }

    fn drop_if_empty(&self, key: &str) {
        let dropped = self.pools.remove_if(key, |_, cell| {
            cell.get().is_some_and(|pool| pool.live_count() == 0)
        });
        if let Some((_, cell)) = dropped {
            if let Some(pool) = cell.get() {
                pool.close_all();
            }
            tracing::debug!(pool = %key, "dropped empty pool");
        }
    }

    /// Drop the pool for `key`, closing its connections.
    pub fn remove_pool(&self, key: &str) {
        if let Some((_, cell)) = self.pools.remove(key) {
            if let Some(pool) = cell.get() {
                pool.close_all();
            }
        }
    }

    /// Start a background heal if the pool for `url` is below target.
    pub async fn heal_if_needed(&self, url: &Url) -> Result<HealOutcome, ConnectError> {
        let factory = self.factory.clone().ok_or(ConnectError::NoFactory)?;
        let Some(pool) = self.get_pool(&url.pool_key()) else {
            self.get_or_create_pool(url).await?;
            return Ok(HealOutcome::Completed);
        };
        pool.heal_to_target(
            factory,
            url,
            self.target_for(url),
            self.config.connect_timeout,
            0,
            self.providers.task(),
        )
        .await
    }

    /// Number of built pools.
    pub fn pool_count(&self) -> usize {
        self.pools.iter().filter(|entry| entry.value().initialized()).count()
    }

    /// Close every pool. Later pool requests fail with `Shutdown`.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.remove_pool(&key);
        }
    }
}

#[async_trait]
impl<P: Providers> PoolHealer for ConnectionManager<P> {
    async fn heal(&self, url: &Url) -> Result<(), ConnectError> {
        let factory = self.factory.clone().ok_or(ConnectError::NoFactory)?;
        let pool = self.get_or_create_pool(url).await?;
        let target = self.target_for(url);
        pool.heal_to_target(
            factory,
            url,
            target,
            self.config.connect_timeout,
            target,
            self.providers.task(),
        )
        .await
        .map(|_| ())
    }
}

impl<P: Providers> ConnectionEventListener for ConnectionManager<P> {
    fn on_event(&self, event: ConnectionEvent, connection: &Arc<Connection>) {
        match event {
            ConnectionEvent::Connected => {
                tracing::debug!(connection = connection.id(), pool = %connection.pool_key(), "connection ready");
            }
            ConnectionEvent::Closed => {
                self.remove(connection);
                if self.closed.load(Ordering::SeqCst) || !self.config.enable_reconnect {
                    return;
                }
                if let (Some(url), Some(reconnector)) = (connection.url(), self.reconnector.get()) {
                    reconnector.reconnect(url.clone());
                }
            }
        }
    }
}

impl<P: Providers> std::fmt::Debug for ConnectionManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pools", &self.pool_count())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
