//! Per-process table of open channels
//!
//! Foreign runtimes are bad at running destructors on time, so the binding
//! layer parks every handle it hands out in a [`ChannelRegistry`] and tears
//! them down explicitly. One name maps to at most one handle per registry,
//! which keeps a process from double-counting its own attachment.

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Open channels keyed by name
pub struct ChannelRegistry {
    config: ChannelConfig,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Channel>>> {
        // A panic while holding the table cannot leave it half-updated
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or open `name`, reusing this registry's handle if it has one.
    ///
    /// A registered handle with a different entry size is an error.
    pub fn create(&self, name: &str, max_entry_size_bytes: usize) -> Result<Arc<Channel>> {
        let mut table = self.table();
        if let Some(channel) = table.get(name) {
            if channel.max_entry_size() != max_entry_size_bytes {
                return Err(ChannelError::AlreadyRegistered {
                    name: name.to_string(),
                    existing: channel.max_entry_size(),
                    requested: max_entry_size_bytes,
                });
            }
            return Ok(channel.clone());
        }

        let channel = Arc::new(Channel::create_or_open_with(
            name,
            max_entry_size_bytes,
            &self.config,
        )?);
        table.insert(name.to_string(), channel.clone());
        debug!(channel = name, "registered");
        Ok(channel)
    }

    /// Open an existing `name`, reusing this registry's handle if it has one
    pub fn open(&self, name: &str) -> Result<Arc<Channel>> {
        let mut table = self.table();
        if let Some(channel) = table.get(name) {
            return Ok(channel.clone());
        }

        let channel = Arc::new(Channel::open_existing_with(name, &self.config)?);
        table.insert(name.to_string(), channel.clone());
        debug!(channel = name, "registered");
        Ok(channel)
    }

    /// Look up a registered handle
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.table().get(name).cloned()
    }

    /// Drop the registry's handle for `name`.
    ///
    /// The channel detaches once no other clone of the handle is alive.
    /// Returns whether anything was registered under that name.
    pub fn remove(&self, name: &str) -> bool {
        // Detach outside the table lock; it may wait on the global file lock
        let removed = self.table().remove(name);
        let found = removed.is_some();
        drop(removed);
        if found {
            debug!(channel = name, "unregistered");
        }
        found
    }

    /// Number of registered channels
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Detach every registered channel
    pub fn clear(&self) {
        let drained: Vec<_> = self.table().drain().map(|(_, channel)| channel).collect();
        drop(drained);
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
