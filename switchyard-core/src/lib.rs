//! # switchyard-core
//!
//! Core abstractions shared by the switchyard transport runtime.
//!
//! - **Provider traits**: networking, time, task spawning and randomness, with
//!   Tokio-backed implementations bundled by [`TokioProviders`]
//! - **Addressing types**: [`ProtocolCode`], [`CommandCode`] and [`Url`]
//! - **Codec registries**: payload serializers and compressors looked up by a
//!   one-byte code
//!
//! ## Provider Traits
//!
//! - [`NetworkProvider`]: dialing and listening
//! - [`TimeProvider`]: sleep, timeout and wall-clock time
//! - [`TaskProvider`]: named task spawning
//! - [`RandomProvider`]: random numbers for connection selection

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod compress;
mod network;
mod providers;
mod random;
mod task;
mod time;
mod types;

// Codec exports
pub use codec::{CodecError, JsonSerializer, SERIALIZER_JSON, Serializer, SerializerRegistry};
pub use compress::{COMPRESSOR_DEFLATE, CompressError, Compressor, CompressorRegistry, DeflateCompressor};

// Provider trait exports
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use random::{RandomProvider, TokioRandomProvider};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};

// Core type exports
pub use types::{CommandCode, DEFAULT_PORT, PROTOCOL_CODE_LENGTH, ProtocolCode, Url, UrlParseError};
