//! Processors by command code.

use std::collections::HashMap;
use std::sync::Arc;

use switchyard_core::CommandCode;

use super::Processor;

/// Maps command codes to processors.
///
/// Filled before the server starts and read-only afterwards; share it behind
/// an `Arc`.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<CommandCode, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `command`.
    ///
    /// The first registration for a code wins; returns `false` for later ones.
    pub fn register(&mut self, command: CommandCode, processor: Arc<dyn Processor>) -> bool {
        if self.processors.contains_key(&command) {
            tracing::warn!(command = %command, "processor already registered, ignoring");
            return false;
        }
        self.processors.insert(command, processor);
        true
    }

    /// Processor for `command`.
    pub fn get(&self, command: CommandCode) -> Option<&Arc<dyn Processor>> {
        self.processors.get(&command)
    }

    /// Number of registered processors.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether no processor is registered.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.processors.keys().map(|c| c.value()).collect();
        codes.sort_unstable();
        f.debug_struct("ProcessorRegistry").field("commands", &codes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{FnProcessor, ProcessError};

    fn processor(tag: &'static str) -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(move |_ctx, _req| -> Result<_, ProcessError> {
            Err(ProcessError::failed(tag))
        }))
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry = ProcessorRegistry::new();
        let first = processor("first");
        assert!(registry.register(CommandCode::new(1), first.clone()));
        assert!(!registry.register(CommandCode::new(1), processor("second")));

        let got = registry.get(CommandCode::new(1)).expect("registered");
        assert!(Arc::ptr_eq(got, &first));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(CommandCode::new(2)).is_none());
    }
}
