//! Dialing new connections.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::{NetworkProvider, Providers, TimeProvider, Url};

use super::{ConnectError, Connection, ConnectionEventListener, ConnectionOptions};
use crate::config::TransportConfig;
use crate::protocol::ProtocolRegistry;

/// Creates connections to a destination.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Dial `url`, giving each attempt at most `timeout`.
    async fn create(&self, url: &Url, timeout: Duration) -> Result<Arc<Connection>, ConnectError>;
}

/// Factory dialing through the provider bundle's network.
pub struct DefaultConnectionFactory<P: Providers> {
    providers: P,
    protocols: Arc<ProtocolRegistry>,
    config: TransportConfig,
    events: Option<Weak<dyn ConnectionEventListener>>,
}

impl<P: Providers> DefaultConnectionFactory<P> {
    /// Factory for connections speaking protocols from `protocols`.
    pub fn new(providers: P, protocols: Arc<ProtocolRegistry>, config: TransportConfig) -> Self {
        Self {
            providers,
            protocols,
            config,
            events: None,
        }
    }

    /// Attach `listener` to every connection this factory creates.
    pub fn with_events(mut self, listener: Weak<dyn ConnectionEventListener>) -> Self {
        self.events = Some(listener);
        self
    }

    async fn dial_once(&self, address: &str, timeout: Duration) -> Result<<P::Network as NetworkProvider>::TcpStream, ConnectError> {
        match self
            .providers
            .time()
            .timeout(timeout, self.providers.network().connect(address))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ConnectError::Dial {
                address: address.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ConnectError::Timeout {
                address: address.to_string(),
                timeout,
            }),
        }
    }
}

#[async_trait]
impl<P: Providers> ConnectionFactory for DefaultConnectionFactory<P> {
    async fn create(&self, url: &Url, timeout: Duration) -> Result<Arc<Connection>, ConnectError> {
        let address = url.address();
        let attempts = self.config.connect_max_retry.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.dial_once(&address, timeout).await {
                Ok(stream) => {
                    let mut options =
                        ConnectionOptions::outbound(url.clone(), self.protocols.clone(), &self.config);
                    if let Some(events) = &self.events {
                        options = options.with_events(events.clone());
                    }
                    return Connection::spawn(stream, options, self.providers.task());
                }
                Err(e) => {
                    tracing::debug!(
                        address = %address,
                        attempt,
                        attempts,
                        error = %e,
                        "dial attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or(ConnectError::Dial {
            address: address.clone(),
            message: "no dial attempted".to_string(),
        });
        tracing::warn!(address = %address, attempts, error = %error, "failed to create connection");
        Err(error)
    }
}
