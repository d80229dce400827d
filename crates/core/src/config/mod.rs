//! Persisted console settings.
//!
//! The settings document is a JSON object with one key per subsystem. Each
//! section loads independently: a missing or malformed section is reported
//! in the [`LoadReport`] and leaves that subsystem at its defaults while the
//! others still load.

use std::{fs, path::Path};

use serde_json::{Map, Value};

use crate::{
    controller::ControllerInput,
    display::{DisplayLinkConfig, DisplayStreamer},
    mapping::{BindingRecord, ControllerBindingEngine},
    MixerError, ParameterRegistry, Result,
};

pub const PARAMETERS_SECTION: &str = "parameters";
pub const BINDINGS_SECTION: &str = "bindings";
pub const DISPLAY_SECTION: &str = "display";
pub const CONTROLLER_SECTION: &str = "controller";

/// A subsystem that owns one section of the settings document.
pub trait SettingsSection {
    fn section_name(&self) -> &'static str;
    fn save_section(&self) -> Result<Value>;
    fn load_section(&self, value: &Value) -> Result<()>;
}

/// Outcome of applying a settings document.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<&'static str>,
    /// One [`MixerError::Section`] per failed section.
    pub errors: Vec<MixerError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed_sections(&self) -> Vec<&str> {
        self.errors
            .iter()
            .filter_map(|err| match err {
                MixerError::Section { section, .. } => Some(section.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// In-memory settings document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsDocument {
    root: Map<String, Value>,
}

impl SettingsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a document. Fails only when the text is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        match serde_json::from_str(text)? {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(MixerError::msg("settings document must be a JSON object")),
        }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Snapshots every section.
    pub fn collect(sections: &[&dyn SettingsSection]) -> Result<Self> {
        let mut root = Map::new();
        for section in sections {
            root.insert(section.section_name().to_string(), section.save_section()?);
        }
        Ok(Self { root })
    }

    pub fn section(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.root)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Loads every section independently.
    pub fn apply(&self, sections: &[&dyn SettingsSection]) -> LoadReport {
        let mut report = LoadReport::default();
        for section in sections {
            let name = section.section_name();
            let outcome = match self.root.get(name) {
                Some(value) => section.load_section(value),
                None => Err(MixerError::msg("section is missing")),
            };
            match outcome {
                Ok(()) => report.loaded.push(name),
                Err(err) => {
                    tracing::warn!(section = name, %err, "failed to load settings section");
                    report.errors.push(match err {
                        MixerError::Section { .. } => err,
                        other => MixerError::section(name, other.to_string()),
                    });
                }
            }
        }

        for name in self.root.keys() {
            if !sections.iter().any(|section| section.section_name() == name) {
                tracing::debug!(section = %name, "ignoring unknown settings section");
            }
        }
        report
    }
}

impl SettingsSection for ParameterRegistry {
    fn section_name(&self) -> &'static str {
        PARAMETERS_SECTION
    }

    fn save_section(&self) -> Result<Value> {
        let mut values = Map::new();
        for name in self.names() {
            let target = self.lookup(&name)?;
            values.insert(name, target.value_json()?);
        }
        Ok(Value::Object(values))
    }

    /// Entries that fail are reported together; the rest are still applied.
    fn load_section(&self, value: &Value) -> Result<()> {
        let values = value
            .as_object()
            .ok_or_else(|| MixerError::section(PARAMETERS_SECTION, "expected an object"))?;

        let failures: Vec<String> = values
            .iter()
            .filter_map(|(name, value)| {
                self.lookup(name)
                    .and_then(|target| target.load_json(value))
                    .err()
                    .map(|err| format!("{name}: {err}"))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MixerError::section(PARAMETERS_SECTION, failures.join("; ")))
        }
    }
}

impl SettingsSection for ControllerBindingEngine {
    fn section_name(&self) -> &'static str {
        BINDINGS_SECTION
    }

    fn save_section(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.records())?)
    }

    fn load_section(&self, value: &Value) -> Result<()> {
        let records: Vec<BindingRecord> = serde_json::from_value(value.clone())?;
        let errors = self.load_records(&records);
        if errors.is_empty() {
            Ok(())
        } else {
            let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Err(MixerError::section(BINDINGS_SECTION, reasons.join("; ")))
        }
    }
}

impl SettingsSection for DisplayStreamer {
    fn section_name(&self) -> &'static str {
        DISPLAY_SECTION
    }

    fn save_section(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.config())?)
    }

    fn load_section(&self, value: &Value) -> Result<()> {
        let config: DisplayLinkConfig = serde_json::from_value(value.clone())?;
        self.apply_config(&config)
    }
}

impl SettingsSection for ControllerInput {
    fn section_name(&self) -> &'static str {
        CONTROLLER_SECTION
    }

    fn save_section(&self) -> Result<Value> {
        Ok(serde_json::json!({ "device": self.device.get() }))
    }

    /// Restores the device selection only; capture is never started from
    /// settings.
    fn load_section(&self, value: &Value) -> Result<()> {
        let device = value
            .get("device")
            .and_then(Value::as_str)
            .ok_or_else(|| MixerError::section(CONTROLLER_SECTION, "missing `device`"))?;
        self.device.set(device.to_string());
        Ok(())
    }
}
