use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use switchyard_core::ProtocolCode;

use super::Protocol;

/// Protocol bundles keyed by code.
///
/// The first registration for a code wins, so wiring order does not matter.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<ProtocolCode, Arc<Protocol>>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bundle under its own code.
    ///
    /// Returns `false` and keeps the existing bundle if the code is taken.
    pub fn register(&self, protocol: Protocol) -> bool {
        let mut protocols = self.protocols.write();
        if protocols.contains_key(&protocol.code()) {
            tracing::debug!(code = %protocol.code(), "protocol already registered, ignoring");
            return false;
        }
        protocols.insert(protocol.code(), Arc::new(protocol));
        true
    }

    /// Bundle registered under `code`.
    pub fn resolve(&self, code: ProtocolCode) -> Option<Arc<Protocol>> {
        self.protocols.read().get(&code).cloned()
    }

    /// Whether `code` is registered.
    pub fn contains(&self, code: ProtocolCode) -> bool {
        self.protocols.read().contains_key(&code)
    }

    /// All registered codes, sorted.
    pub fn codes(&self) -> Vec<ProtocolCode> {
        let mut codes: Vec<ProtocolCode> = self.protocols.read().keys().copied().collect();
        codes.sort();
        codes
    }
}
