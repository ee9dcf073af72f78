//! Configuration for the transport runtime.

use std::time::Duration;

use switchyard_core::{TokioNetworkProvider, TokioProviders};

/// Options recognized by clients, servers and the connections they own.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Timeout for a single dial attempt.
    pub connect_timeout: Duration,

    /// Dial attempts made by the connection factory before giving up.
    pub connect_max_retry: u32,

    /// Read inactivity after which a heartbeat is triggered.
    pub idle_time: Duration,

    /// Whether idle client connections send heartbeats.
    pub idle_heartbeat: bool,

    /// Consecutive unanswered heartbeats before a connection is closed.
    pub max_heartbeat_failures: u32,

    /// Whether the server keeps a registry of inbound connections.
    pub server_manage_connection: bool,

    /// Whether decoded batches are off-loaded to the worker pool.
    pub dispatch_batch_to_executor: bool,

    /// Concurrent batches the worker pool accepts before rejecting.
    pub dispatch_pool_size: usize,

    /// Pool size used when a URL does not name one.
    pub default_connections_per_url: usize,

    /// Hard cap on pooled connections per destination.
    pub max_connections_per_url: usize,

    /// Connections created inline when a pool is first built.
    ///
    /// The rest of the pool warms up in the background.
    pub sync_create_count: usize,

    /// Whether closed client connections are queued for reconnection.
    pub enable_reconnect: bool,

    /// Minimum spacing between two reconnect tasks.
    pub reconnect_interval: Duration,

    /// Set `TCP_NODELAY` on sockets.
    pub tcp_nodelay: bool,

    /// Largest accepted frame body.
    pub max_frame_size: usize,

    /// Size of the chunk read from a socket per wake-up.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            connect_max_retry: 3,
            idle_time: Duration::from_millis(10_000),
            idle_heartbeat: true,
            max_heartbeat_failures: 3,
            server_manage_connection: false,
            dispatch_batch_to_executor: false,
            dispatch_pool_size: 64,
            default_connections_per_url: 1,
            max_connections_per_url: 1_000_000,
            sync_create_count: 1,
            enable_reconnect: true,
            reconnect_interval: Duration::from_millis(1000),
            tcp_nodelay: true,
            max_frame_size: 16 * 1024 * 1024,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl TransportConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dial timeout and attempts.
    pub fn with_connect(mut self, timeout: Duration, max_retry: u32) -> Self {
        self.connect_timeout = timeout;
        self.connect_max_retry = max_retry;
        self
    }

    /// Configure idle heartbeats. `None` disables them.
    pub fn with_heartbeat(mut self, idle_time: Option<Duration>) -> Self {
        match idle_time {
            Some(idle) => {
                self.idle_time = idle;
                self.idle_heartbeat = true;
            }
            None => self.idle_heartbeat = false,
        }
        self
    }

    /// Off-load decoded batches to a worker pool of the given size.
    pub fn with_dispatch_pool(mut self, enabled: bool, size: usize) -> Self {
        self.dispatch_batch_to_executor = enabled;
        self.dispatch_pool_size = size;
        self
    }

    /// Set default and maximum pool sizes per destination.
    pub fn with_connections_per_url(mut self, default: usize, max: usize) -> Self {
        self.default_connections_per_url = default;
        self.max_connections_per_url = max;
        self
    }

    /// Set the number of connections dialed inline on pool construction.
    pub fn with_sync_create_count(mut self, count: usize) -> Self {
        self.sync_create_count = count;
        self
    }

    /// Configure automatic reconnection.
    pub fn with_reconnect(mut self, enabled: bool, interval: Duration) -> Self {
        self.enable_reconnect = enabled;
        self.reconnect_interval = interval;
        self
    }

    /// Keep a registry of inbound connections on the server.
    pub fn with_server_manage_connection(mut self, enabled: bool) -> Self {
        self.server_manage_connection = enabled;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            connect_max_retry: 2,
            idle_time: Duration::from_millis(1000),
            reconnect_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Tokio providers with sockets configured from this config.
    pub fn tokio_providers(&self) -> TokioProviders {
        TokioProviders::new().with_network(TokioNetworkProvider::new().with_nodelay(self.tcp_nodelay))
    }
}
