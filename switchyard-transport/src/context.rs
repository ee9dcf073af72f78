//! Shared runtime state for clients and servers.

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{CompressorRegistry, Providers, SerializerRegistry};

use crate::config::TransportConfig;
use crate::dispatch::{CommandDispatcher, ProcessorRegistry};
use crate::invoke::{Remoting, TimeoutScheduler};
use crate::protocol::{BinaryHeartbeatTrigger, BinaryProtocol, Protocol, ProtocolRegistry};

/// How long a heartbeat may go unanswered before it counts as missed.
pub const HEARTBEAT_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Registries, configuration and the timeout scheduler one runtime shares.
///
/// Built once and handed to [`RemotingClient`](crate::RemotingClient) and
/// [`RemotingServer`](crate::RemotingServer). Nothing here is global, so
/// independent runtimes can coexist in one process.
pub struct TransportContext<P: Providers> {
    providers: P,
    config: TransportConfig,
    protocols: Arc<ProtocolRegistry>,
    serializers: Arc<SerializerRegistry>,
    compressors: Arc<CompressorRegistry>,
    timer: Arc<TimeoutScheduler>,
}

impl<P: Providers> TransportContext<P> {
    /// Context with the default serializers and compressors and no protocol.
    ///
    /// Starts the timeout scheduler, so must be called inside a runtime.
    pub fn new(providers: P, config: TransportConfig) -> Arc<Self> {
        let timer = TimeoutScheduler::start(providers.task());
        Arc::new(Self {
            providers,
            config,
            protocols: Arc::new(ProtocolRegistry::new()),
            serializers: Arc::new(SerializerRegistry::with_defaults()),
            compressors: Arc::new(CompressorRegistry::with_defaults()),
            timer,
        })
    }

    /// Provider bundle.
    pub fn providers(&self) -> &P {
        &self.providers
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Registered protocols.
    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    /// Registered serializers.
    pub fn serializers(&self) -> &Arc<SerializerRegistry> {
        &self.serializers
    }

    /// Registered compressors.
    pub fn compressors(&self) -> &Arc<CompressorRegistry> {
        &self.compressors
    }

    /// The shared timeout scheduler.
    pub fn timer(&self) -> &Arc<TimeoutScheduler> {
        &self.timer
    }

    /// Send paths bound to this context's clock and scheduler.
    pub fn remoting(&self) -> Remoting<P::Time> {
        Remoting::new(self.providers.time().clone(), self.timer.clone())
    }

    /// Register a protocol bundle. The first bundle for a code wins.
    pub fn register_protocol(&self, protocol: Protocol) -> bool {
        self.protocols.register(protocol)
    }

    /// Register the binary protocol dispatching to `processors`.
    ///
    /// Heartbeats and the worker pool follow the configuration.
    pub fn register_binary(&self, processors: ProcessorRegistry) -> bool {
        let mut dispatcher = CommandDispatcher::new(
            &self.providers,
            Arc::new(processors),
            self.serializers.clone(),
            self.compressors.clone(),
        );
        if self.config.dispatch_batch_to_executor {
            dispatcher = dispatcher.with_worker_pool(&self.providers, self.config.dispatch_pool_size);
        }
        let protocol = if self.config.idle_heartbeat {
            BinaryProtocol::bundle_with_heartbeat(
                Arc::new(dispatcher),
                self.config.max_frame_size,
                BinaryHeartbeatTrigger::new(
                    self.providers.task().clone(),
                    HEARTBEAT_ACK_TIMEOUT,
                    self.config.max_heartbeat_failures,
                ),
            )
        } else {
            BinaryProtocol::bundle(Arc::new(dispatcher), self.config.max_frame_size)
        };
        self.register_protocol(protocol)
    }

    /// Stop the timeout scheduler. Outstanding timeouts fire immediately.
    pub fn shutdown(&self) {
        self.timer.shutdown();
    }
}

impl<P: Providers> std::fmt::Debug for TransportContext<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("config", &self.config)
            .field("protocols", &self.protocols.codes())
            .field("timer", &self.timer)
            .finish()
    }
}
