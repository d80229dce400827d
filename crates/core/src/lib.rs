//! Core library for the LED mixer console.
//!
//! Two decks render independently; their frames are joined, crossfaded,
//! colour corrected and streamed to a serial LED display. Every adjustable
//! value is a [`Parameter`] that UI code, persistence and MIDI controllers
//! write through the same path. Each module owns one subsystem and
//! [`console::MixConsole`] wires them together.

pub mod barrier;
pub mod compose;
pub mod config;
pub mod console;
pub mod controller;
pub mod display;
pub mod error;
pub mod mapping;
pub mod parameter;
pub mod registry;
pub mod render;

pub use barrier::{Arrival, ParticipantId, RenderBarrier};
pub use compose::{ColorCorrection, ConvertedImages, ImageConverter};
pub use config::{LoadReport, SettingsDocument, SettingsSection};
pub use console::MixConsole;
pub use controller::{
    ControllerEvent, ControllerInput, ControllerKey, ControllerSender, ControllerTransport,
};
pub use display::{
    DisplayLinkConfig, DisplayStreamer, LinkEvent, RecordingDevice, ScanlineDirection,
    SerialDevice, TtyDevice,
};
pub use error::{MixerError, Result};
pub use mapping::{Binding, BindingRecord, ControllerBindingEngine, LearnState, ParameterUpdate};
pub use parameter::{ControlTarget, ParamValue, Parameter, Subscription, ValueKind};
pub use registry::ParameterRegistry;
pub use render::{Framebuffer, Pattern, PatternDeck, RenderCompletion, RenderProducer};
