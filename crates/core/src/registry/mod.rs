use std::{collections::BTreeMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    parameter::{ControlTarget, ParamValue, Parameter},
    MixerError, Result,
};

/// Directory of named parameters that external controllers and persistence
/// may address. Entries are registered once while the console is assembled
/// and never removed; the registry only hands out references and does not
/// control parameter lifetime.
///
/// Entries are either bindable (controllers may drive them) or persisted
/// only (saved and restored with the settings, never bound).
#[derive(Default)]
pub struct ParameterRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

struct Entry {
    target: Arc<dyn ControlTarget>,
    bindable: bool,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a clone of `param` under its own name, open to controller
    /// bindings.
    pub fn register<T: ParamValue>(&self, param: &Parameter<T>) -> Result<()> {
        self.insert(param, true)
    }

    /// Registers `param` for persistence only; it can never be bound.
    pub fn register_persisted<T: ParamValue>(&self, param: &Parameter<T>) -> Result<()> {
        self.insert(param, false)
    }

    fn insert<T: ParamValue>(&self, param: &Parameter<T>, bindable: bool) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(param.name()) {
            return Err(MixerError::DuplicateParameter(param.name().to_string()));
        }
        entries.insert(
            param.name().to_string(),
            Entry {
                target: Arc::new(param.clone()),
                bindable,
            },
        );
        tracing::debug!(name = param.name(), kind = ?param.kind(), bindable, "registered parameter");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ControlTarget>> {
        self.entries.read().get(name).map(|entry| entry.target.clone())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ControlTarget>> {
        self.get(name)
            .ok_or_else(|| MixerError::UnknownParameter(name.to_string()))
    }

    /// Resolves a parameter a controller may drive. Persisted-only entries
    /// and values without a numeric range are [`MixerError::Unbindable`].
    pub fn lookup_bindable(&self, name: &str) -> Result<Arc<dyn ControlTarget>> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| MixerError::UnknownParameter(name.to_string()))?;
        if !entry.bindable || entry.target.control_range().is_none() {
            return Err(MixerError::Unbindable(name.to_string()));
        }
        Ok(entry.target.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Sorted parameter names.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Names of parameters a controller can drive.
    pub fn bindable_names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.bindable && entry.target.control_range().is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("names", &self.names())
            .finish()
    }
}
