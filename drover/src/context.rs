use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::Configuration;
use crate::error::Result;
use crate::hooks::HookRegistry;

/// Process-wide state: the merged configuration and the global hooks.
///
/// A context is created explicitly and shared as `Arc<Context>` by the
/// manager and everything it starts. Configuration reads return a snapshot;
/// changes made after [`Manager::start`](crate::Manager::start) only affect
/// pipelines started later.
#[derive(Debug, Default)]
pub struct Context {
    config: RwLock<Configuration>,
    hooks: HookRegistry,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Configuration) -> Self {
        Self {
            config: RwLock::new(config),
            hooks: HookRegistry::new(),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Merge overrides into the configuration; last write wins per key.
    pub fn configure(&self, overrides: Value) -> Result<()> {
        self.config.write().merge(overrides)?;
        Ok(())
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Configuration {
        self.config.read().clone()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Restore default configuration and drop every global hook.
    pub fn reset(&self) {
        *self.config.write() = Configuration::default();
        self.hooks.clear_hooks();
    }
}
