// Plugin registry: the configured handlers a scheduler can start
// transactions for, each with its long-lived state. Built at startup,
// owned by the scheduler; no global tables.

use core::fmt;

use log::info;

use crate::config::MAX_PLUGINS;
use crate::kernel::plugin::{HandlerError, Plugin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginId(pub u8);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    Full,
    Init(HandlerError),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Full => write!(f, "registry full ({} plugins)", MAX_PLUGINS),
            RegisterError::Init(e) => write!(f, "handler init failed: {}", e),
        }
    }
}

pub(crate) struct Registered<P: Plugin> {
    pub plugin: P,
    pub persistent: P::Persistent,
}

pub struct Registry<P: Plugin> {
    entries: [Option<Registered<P>>; MAX_PLUGINS],
}

impl<P: Plugin> Registry<P> {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| None),
        }
    }

    /// Add a configured plugin, running its one-time handler init.
    pub fn register(&mut self, plugin: P) -> Result<PluginId, RegisterError> {
        let idx = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(RegisterError::Full)?;

        let mut persistent = P::Persistent::default();
        plugin
            .handler_init(&mut persistent)
            .map_err(RegisterError::Init)?;

        info!("registry: {} on {}", PluginId(idx as u8), plugin.bus());
        self.entries[idx] = Some(Registered { plugin, persistent });
        Ok(PluginId(idx as u8))
    }

    pub fn get(&self, id: PluginId) -> Option<&P> {
        self.entry(id).map(|e| &e.plugin)
    }

    pub fn persistent(&self, id: PluginId) -> Option<&P::Persistent> {
        self.entry(id).map(|e| &e.persistent)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn entry(&self, id: PluginId) -> Option<&Registered<P>> {
        self.entries.get(id.0 as usize)?.as_ref()
    }

    pub(crate) fn entry_mut(&mut self, id: PluginId) -> Option<&mut Registered<P>> {
        self.entries.get_mut(id.0 as usize)?.as_mut()
    }
}

impl<P: Plugin> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}
