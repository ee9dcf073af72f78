//! Connections and the machinery keeping pools of them healthy.
//!
//! - [`Connection`]: one transport stream, its in-flight futures and bound
//!   protocol
//! - [`ConnectionPool`]: the live connections to one destination
//! - [`ConnectionManager`]: pools keyed by destination, built once each
//! - [`ReconnectManager`]: background worker re-healing pools after failures

mod core;
mod error;
mod event;
mod factory;
mod manager;
mod pool;
mod reconnect;
mod strategy;

pub use self::core::{Connection, ConnectionOptions};
pub use error::ConnectError;
pub use event::{ConnectionEvent, ConnectionEventListener};
pub use factory::{ConnectionFactory, DefaultConnectionFactory};
pub use manager::ConnectionManager;
pub use pool::{ConnectionPool, HealOutcome};
pub use reconnect::{PoolHealer, ReconnectManager, ReconnectTask, Reconnector};
pub use strategy::{ConnectionSelectStrategy, RandomSelectStrategy};
