//! Controller-to-parameter bindings and the learn-mode state machine.
//!
//! Routing is strictly one way: a [`ControllerKey`] resolves to at most one
//! [`Binding`], and that binding writes into a parameter through
//! [`Parameter::set`](crate::Parameter::set). Several keys may drive the same
//! parameter. The committed table is replaced as a whole on every change so
//! dispatch always reads a consistent snapshot.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    controller::{ControllerEvent, ControllerEventSink, ControllerKey},
    parameter::{ControlTarget, Subscription},
    MixerError, Parameter, ParameterRegistry, Result,
};

/// Linear map from a controller's native range into a parameter range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearScale {
    pub in_min: f64,
    pub in_max: f64,
    pub out_min: f64,
    pub out_max: f64,
}

impl LinearScale {
    pub fn new(input: (f64, f64), output: (f64, f64)) -> Self {
        Self {
            in_min: input.0,
            in_max: input.1,
            out_min: output.0,
            out_max: output.1,
        }
    }

    /// Maps `raw` into the output range. Inputs outside the native range are
    /// pinned to its ends.
    pub fn apply(&self, raw: f64) -> f64 {
        let span = self.in_max - self.in_min;
        if span == 0.0 {
            return self.out_min;
        }
        let t = ((raw - self.in_min) / span).clamp(0.0, 1.0);
        self.out_min + t * (self.out_max - self.out_min)
    }
}

/// Committed route from one physical control to one parameter.
#[derive(Clone)]
pub struct Binding {
    pub key: ControllerKey,
    pub target: Arc<dyn ControlTarget>,
    pub scale: LinearScale,
}

impl Binding {
    /// Builds a binding whose scale maps `0..=max_value` onto the target's
    /// control range.
    pub fn new(key: ControllerKey, target: Arc<dyn ControlTarget>, max_value: u16) -> Result<Self> {
        let range = target
            .control_range()
            .ok_or_else(|| MixerError::Unbindable(target.name().to_string()))?;
        Ok(Self {
            key,
            target,
            scale: LinearScale::new((0.0, max_value as f64), range),
        })
    }

    pub fn parameter_name(&self) -> &str {
        self.target.name()
    }

    pub fn to_record(&self) -> BindingRecord {
        BindingRecord {
            device: self.key.device,
            channel: self.key.channel,
            control: self.key.control,
            parameter: self.parameter_name().to_string(),
            scale: self.scale,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &self.key)
            .field("parameter", &self.parameter_name())
            .field("scale", &self.scale)
            .finish()
    }
}

/// Persisted form of a [`Binding`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub device: u32,
    pub channel: u8,
    pub control: u16,
    pub parameter: String,
    pub scale: LinearScale,
}

impl BindingRecord {
    pub fn key(&self) -> ControllerKey {
        ControllerKey::new(self.device, self.channel, self.control)
    }
}

/// Keyed binding table. One entry per controller key.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    entries: HashMap<ControllerKey, Binding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `binding`, returning the binding it replaced.
    pub fn insert(&mut self, binding: Binding) -> Option<Binding> {
        self.entries.insert(binding.key, binding)
    }

    pub fn remove(&mut self, key: &ControllerKey) -> Option<Binding> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &ControllerKey) -> Option<&Binding> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bindings ordered by controller key.
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self.entries.values().cloned().collect();
        bindings.sort_by_key(|binding| binding.key);
        bindings
    }
}

/// Concrete value routed to a parameter by live dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    pub target: String,
    pub value: f64,
    pub changed: bool,
}

/// Pending binding captured while learning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingCandidate {
    pub key: ControllerKey,
    pub parameter: String,
    pub max_value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LearnState {
    #[default]
    Idle,
    Listening,
    Confirming(BindingCandidate),
}

impl LearnState {
    pub fn is_active(&self) -> bool {
        !matches!(self, LearnState::Idle)
    }
}

#[derive(Debug, Default)]
struct LearnSession {
    state: LearnState,
    /// Parameter the user last interacted with; supplied by the caller.
    target: Option<String>,
}

/// Learn-and-bind engine plus live dispatch of controller input.
pub struct ControllerBindingEngine {
    registry: Arc<ParameterRegistry>,
    capturing: Parameter<bool>,
    /// True while learn mode is active (listening or confirming).
    pub learn_mode: Parameter<bool>,
    /// True while a candidate is waiting to be stored.
    pub candidate_ready: Parameter<bool>,
    session: Mutex<LearnSession>,
    /// Serialises flag updates; reentrant so a flag observer may drive the
    /// engine again.
    flag_gate: ReentrantMutex<()>,
    table: RwLock<Arc<BindingTable>>,
    _capture_watch: Subscription,
}

impl ControllerBindingEngine {
    /// `capturing` is the controller input's capture state; learn mode may
    /// only start while it is true and is abandoned as soon as it drops.
    pub fn new(registry: Arc<ParameterRegistry>, capturing: Parameter<bool>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let capture_watch = capturing.subscribe(move |active: &bool| {
                if !*active {
                    if let Some(engine) = weak.upgrade() {
                        engine.cancel_learn();
                    }
                }
            });

            Self {
                registry,
                capturing,
                learn_mode: Parameter::new("midiLearnMode", false),
                candidate_ready: Parameter::new("midiCandidateReady", false),
                session: Mutex::new(LearnSession::default()),
                flag_gate: ReentrantMutex::new(()),
                table: RwLock::new(Arc::new(BindingTable::new())),
                _capture_watch: capture_watch,
            }
        })
    }

    pub fn learn_state(&self) -> LearnState {
        self.session.lock().state.clone()
    }

    /// Enters listening mode. Ignored unless the controller input is
    /// capturing and learn mode is currently off.
    pub fn start_learn(&self) -> bool {
        if !self.capturing.get() {
            tracing::debug!("learn request ignored, controller input is not capturing");
            return false;
        }
        {
            let mut session = self.session.lock();
            if session.state.is_active() {
                return false;
            }
            session.state = LearnState::Listening;
        }
        tracing::info!("controller learn mode started");
        self.sync_flags();
        true
    }

    /// Leaves learn mode, discarding any pending candidate.
    pub fn cancel_learn(&self) {
        let was_active = {
            let mut session = self.session.lock();
            std::mem::take(&mut session.state).is_active()
        };
        if was_active {
            tracing::info!("controller learn mode stopped");
        }
        self.sync_flags();
    }

    /// Toggles learn mode on or off; returns whether learn mode is now
    /// active.
    pub fn toggle_learn(&self) -> bool {
        if self.learn_state().is_active() {
            self.cancel_learn();
            false
        } else {
            self.start_learn()
        }
    }

    /// Selects the parameter the next learned control will be bound to. A
    /// pending candidate is retargeted.
    pub fn set_learn_target(&self, name: &str) -> Result<()> {
        self.registry.lookup_bindable(name)?;

        let mut session = self.session.lock();
        session.target = Some(name.to_string());
        if let LearnState::Confirming(candidate) = &mut session.state {
            candidate.parameter = name.to_string();
        }
        Ok(())
    }

    pub fn learn_target(&self) -> Option<String> {
        self.session.lock().target.clone()
    }

    /// Commits the pending candidate, replacing any binding already held by
    /// its controller key. Fails without side effects when nothing is
    /// pending.
    pub fn store(&self) -> Result<Binding> {
        let binding = {
            let mut session = self.session.lock();
            let candidate = match &session.state {
                LearnState::Confirming(candidate) => candidate.clone(),
                _ => {
                    return Err(MixerError::InvalidOperation(
                        "no learned binding is pending".into(),
                    ))
                }
            };
            let target = self.registry.lookup_bindable(&candidate.parameter)?;
            let binding = Binding::new(candidate.key, target, candidate.max_value)?;
            self.install(binding.clone());
            session.state = LearnState::Idle;
            binding
        };

        tracing::info!(
            key = %binding.key,
            parameter = binding.parameter_name(),
            "stored learned binding"
        );
        self.sync_flags();
        Ok(binding)
    }

    /// Binds `key` to a registered parameter directly, bypassing learn mode.
    pub fn bind(&self, key: ControllerKey, parameter: &str, max_value: u16) -> Result<()> {
        let target = self.registry.lookup_bindable(parameter)?;
        self.install(Binding::new(key, target, max_value)?);
        Ok(())
    }

    pub fn unbind(&self, key: &ControllerKey) -> Option<Binding> {
        let mut table = self.table.write();
        let mut next = BindingTable::clone(&table);
        let removed = next.remove(key);
        *table = Arc::new(next);
        removed
    }

    fn install(&self, binding: Binding) {
        let mut table = self.table.write();
        let mut next = BindingTable::clone(&table);
        if let Some(previous) = next.insert(binding) {
            tracing::debug!(
                key = %previous.key,
                parameter = previous.parameter_name(),
                "replaced existing binding"
            );
        }
        *table = Arc::new(next);
    }

    /// Snapshot of the committed table.
    pub fn table(&self) -> Arc<BindingTable> {
        self.table.read().clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.table().bindings()
    }

    pub fn records(&self) -> Vec<BindingRecord> {
        self.bindings().iter().map(Binding::to_record).collect()
    }

    /// Replaces the whole table from persisted records. Records naming
    /// unknown or unbindable parameters are skipped and reported.
    pub fn load_records(&self, records: &[BindingRecord]) -> Vec<MixerError> {
        let mut next = BindingTable::new();
        let mut errors = Vec::new();
        for record in records {
            match self.registry.lookup_bindable(&record.parameter) {
                Ok(target) => {
                    next.insert(Binding {
                        key: record.key(),
                        target,
                        scale: record.scale,
                    });
                }
                Err(err) => errors.push(err),
            }
        }
        *self.table.write() = Arc::new(next);
        errors
    }

    pub fn clear_bindings(&self) {
        *self.table.write() = Arc::new(BindingTable::new());
    }

    /// Routes one event through the committed table. Events without a
    /// binding are dropped.
    pub fn dispatch(&self, event: &ControllerEvent) -> Option<ParameterUpdate> {
        let table = self.table();
        let binding = table.get(&event.key)?;
        let value = binding.scale.apply(event.value as f64);
        let changed = binding.target.set_scaled(value);
        Some(ParameterUpdate {
            target: binding.parameter_name().to_string(),
            value,
            changed,
        })
    }

    fn learn_from(&self, event: &ControllerEvent) {
        let candidate = {
            let mut session = self.session.lock();
            if session.state != LearnState::Listening {
                return;
            }
            let Some(parameter) = session.target.clone() else {
                tracing::debug!(key = %event.key, "no learn target selected, ignoring control");
                return;
            };
            let candidate = BindingCandidate {
                key: event.key,
                parameter,
                max_value: event.max_value,
            };
            session.state = LearnState::Confirming(candidate.clone());
            candidate
        };

        tracing::info!(
            key = %candidate.key,
            parameter = %candidate.parameter,
            "learned binding candidate"
        );
        self.sync_flags();
    }

    /// Brings `learn_mode` and `candidate_ready` in line with the session.
    /// Called after every transition; the gate makes the last caller read
    /// the newest state, so the flags never settle on a stale one.
    fn sync_flags(&self) {
        let _gate = self.flag_gate.lock();
        let (active, ready) = {
            let session = self.session.lock();
            (
                session.state.is_active(),
                matches!(session.state, LearnState::Confirming(_)),
            )
        };
        self.candidate_ready.set(ready);
        self.learn_mode.set(active);
    }
}

impl ControllerEventSink for ControllerBindingEngine {
    fn handle_event(&self, event: &ControllerEvent) {
        if let Some(update) = self.dispatch(event) {
            tracing::debug!(key = %event.key, target = %update.target, value = update.value, "dispatched controller value");
        }
        self.learn_from(event);
    }
}

impl fmt::Debug for ControllerBindingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBindingEngine")
            .field("learn_state", &self.learn_state())
            .field("bindings", &self.table().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        capturing: Parameter<bool>,
        fade: Parameter<f32>,
        gamma: Parameter<f32>,
        engine: Arc<ControllerBindingEngine>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ParameterRegistry::new());
        let fade = Parameter::ranged("crossfade", 0.0_f32, 0.0, 1.0);
        let gamma = Parameter::ranged("displayGamma", 2.2_f32, 1.5, 3.5);
        registry.register(&fade).unwrap();
        registry.register(&gamma).unwrap();
        registry
            .register(&Parameter::new("portName", String::new()))
            .unwrap();
        registry
            .register_persisted(&Parameter::ranged("displayWidth", 32_i32, 16, 64))
            .unwrap();
        let capturing = Parameter::new("controllerCapturing", false);
        let engine = ControllerBindingEngine::new(registry, capturing.clone());
        Fixture {
            capturing,
            fade,
            gamma,
            engine,
        }
    }

    fn cc(control: u8, value: u8) -> ControllerEvent {
        ControllerEvent::control_change(0, 0, control, value)
    }

    #[test]
    fn scale_maps_native_range_onto_parameter_range() {
        let scale = LinearScale::new((0.0, 127.0), (1.5, 3.5));
        assert_eq!(scale.apply(0.0), 1.5);
        assert_eq!(scale.apply(127.0), 3.5);
        assert_eq!(scale.apply(500.0), 3.5);
        assert!((scale.apply(63.5) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn dispatch_scales_into_bound_parameter() {
        let fx = fixture();
        fx.engine.bind(ControllerKey::new(0, 0, 7), "displayGamma", 127).unwrap();

        let update = fx.engine.dispatch(&cc(7, 127)).unwrap();
        assert!(update.changed);
        assert_eq!(fx.gamma.get(), 3.5);

        fx.engine.dispatch(&cc(7, 0));
        assert_eq!(fx.gamma.get(), 1.5);
    }

    #[test]
    fn unbound_events_do_not_touch_parameters() {
        let fx = fixture();
        fx.engine.bind(ControllerKey::new(0, 0, 7), "crossfade", 127).unwrap();

        assert!(fx.engine.dispatch(&cc(8, 127)).is_none());
        assert!(fx
            .engine
            .dispatch(&ControllerEvent::control_change(1, 0, 7, 127))
            .is_none());
        assert_eq!(fx.fade.get(), 0.0);
    }

    #[test]
    fn rebinding_a_key_replaces_the_previous_binding() {
        let fx = fixture();
        let key = ControllerKey::new(0, 0, 7);
        fx.engine.bind(key, "crossfade", 127).unwrap();
        fx.engine.bind(key, "displayGamma", 127).unwrap();

        assert_eq!(fx.engine.table().len(), 1);
        fx.engine.dispatch(&cc(7, 127));
        assert_eq!(fx.fade.get(), 0.0);
        assert_eq!(fx.gamma.get(), 3.5);
    }

    #[test]
    fn several_controls_may_drive_one_parameter() {
        let fx = fixture();
        fx.engine.bind(ControllerKey::new(0, 0, 1), "crossfade", 127).unwrap();
        fx.engine.bind(ControllerKey::new(0, 0, 2), "crossfade", 127).unwrap();

        fx.engine.dispatch(&cc(1, 127));
        assert_eq!(fx.fade.get(), 1.0);
        fx.engine.dispatch(&cc(2, 0));
        assert_eq!(fx.fade.get(), 0.0);
    }

    #[test]
    fn text_parameters_cannot_be_bound() {
        let fx = fixture();
        let err = fx
            .engine
            .bind(ControllerKey::new(0, 0, 1), "portName", 127)
            .unwrap_err();
        assert!(matches!(err, MixerError::Unbindable(_)));
        assert!(fx.engine.set_learn_target("portName").is_err());
    }

    #[test]
    fn learn_requires_capturing_input() {
        let fx = fixture();
        assert!(!fx.engine.start_learn());
        assert_eq!(fx.engine.learn_state(), LearnState::Idle);

        fx.capturing.set(true);
        assert!(fx.engine.start_learn());
        assert_eq!(fx.engine.learn_state(), LearnState::Listening);
        assert!(fx.engine.learn_mode.get());
    }

    #[test]
    fn full_learn_flow_commits_binding() {
        let fx = fixture();
        fx.capturing.set(true);
        fx.engine.set_learn_target("crossfade").unwrap();
        assert!(fx.engine.toggle_learn());

        fx.engine.handle_event(&cc(21, 10));
        assert!(fx.engine.candidate_ready.get());
        assert_eq!(
            fx.engine.learn_state(),
            LearnState::Confirming(BindingCandidate {
                key: ControllerKey::new(0, 0, 21),
                parameter: "crossfade".into(),
                max_value: 127,
            })
        );

        // A second control during confirmation keeps the first candidate.
        fx.engine.handle_event(&cc(22, 10));
        let binding = fx.engine.store().unwrap();
        assert_eq!(binding.key, ControllerKey::new(0, 0, 21));
        assert_eq!(fx.engine.learn_state(), LearnState::Idle);
        assert!(!fx.engine.candidate_ready.get());
        assert!(!fx.engine.learn_mode.get());

        fx.engine.handle_event(&cc(21, 127));
        assert_eq!(fx.fade.get(), 1.0);
    }

    #[test]
    fn listening_without_target_stays_listening() {
        let fx = fixture();
        fx.capturing.set(true);
        fx.engine.start_learn();
        fx.engine.handle_event(&cc(1, 1));
        assert_eq!(fx.engine.learn_state(), LearnState::Listening);
    }

    #[test]
    fn retargeting_updates_pending_candidate() {
        let fx = fixture();
        fx.capturing.set(true);
        fx.engine.set_learn_target("crossfade").unwrap();
        fx.engine.start_learn();
        fx.engine.handle_event(&cc(5, 0));
        fx.engine.set_learn_target("displayGamma").unwrap();

        let binding = fx.engine.store().unwrap();
        assert_eq!(binding.parameter_name(), "displayGamma");
    }

    #[test]
    fn store_without_candidate_is_rejected() {
        let fx = fixture();
        fx.engine.bind(ControllerKey::new(0, 0, 1), "crossfade", 127).unwrap();

        assert!(matches!(fx.engine.store(), Err(MixerError::InvalidOperation(_))));

        fx.capturing.set(true);
        fx.engine.start_learn();
        assert!(matches!(fx.engine.store(), Err(MixerError::InvalidOperation(_))));
        assert_eq!(fx.engine.learn_state(), LearnState::Listening);
        assert_eq!(fx.engine.records().len(), 1);
    }

    #[test]
    fn toggle_while_confirming_cancels_candidate() {
        let fx = fixture();
        fx.capturing.set(true);
        fx.engine.set_learn_target("crossfade").unwrap();
        fx.engine.start_learn();
        fx.engine.handle_event(&cc(9, 0));

        assert!(!fx.engine.start_learn());
        assert!(!fx.engine.toggle_learn());
        assert_eq!(fx.engine.learn_state(), LearnState::Idle);
        assert!(fx.engine.table().is_empty());
    }

    #[test]
    fn stopping_capture_exits_learn_mode() {
        let fx = fixture();
        fx.capturing.set(true);
        fx.engine.set_learn_target("crossfade").unwrap();
        fx.engine.start_learn();
        fx.engine.handle_event(&cc(9, 0));

        fx.capturing.set(false);
        assert_eq!(fx.engine.learn_state(), LearnState::Idle);
        assert!(!fx.engine.candidate_ready.get());
        assert!(!fx.engine.learn_mode.get());
    }

    #[test]
    fn records_round_trip_and_skip_unknown_parameters() {
        let fx = fixture();
        fx.engine.bind(ControllerKey::new(1, 2, 3), "displayGamma", 127).unwrap();
        let mut records = fx.engine.records();
        records.push(BindingRecord {
            device: 0,
            channel: 0,
            control: 4,
            parameter: "missing".into(),
            scale: LinearScale::new((0.0, 127.0), (0.0, 1.0)),
        });

        fx.engine.clear_bindings();
        let errors = fx.engine.load_records(&records);
        assert_eq!(errors.len(), 1);
        assert_eq!(fx.engine.records(), records[..1].to_vec());
    }

    #[test]
    fn persisted_only_parameters_cannot_be_bound() {
        let fx = fixture();
        let key = ControllerKey::new(0, 0, 2);
        assert!(matches!(
            fx.engine.bind(key, "displayWidth", 127),
            Err(MixerError::Unbindable(_))
        ));
        assert!(fx.engine.set_learn_target("displayWidth").is_err());

        let errors = fx.engine.load_records(&[BindingRecord {
            device: 0,
            channel: 0,
            control: 2,
            parameter: "displayWidth".into(),
            scale: LinearScale::new((0.0, 127.0), (16.0, 64.0)),
        }]);
        assert!(matches!(errors.as_slice(), [MixerError::Unbindable(_)]));
        assert!(fx.engine.table().is_empty());
    }

    #[test]
    fn learn_flags_follow_state_under_concurrent_requests() {
        let fx = fixture();
        fx.capturing.set(true);
        fx.engine.set_learn_target("crossfade").unwrap();

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let engine = fx.engine.clone();
                std::thread::spawn(move || {
                    for step in 0..500_u32 {
                        match (worker + step) % 4 {
                            0 => {
                                engine.start_learn();
                            }
                            1 => engine.handle_event(&ControllerEvent::control_change(0, 0, 3, 1)),
                            2 => {
                                let _ = engine.store();
                            }
                            _ => engine.cancel_learn(),
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let state = fx.engine.learn_state();
        assert_eq!(fx.engine.learn_mode.get(), state.is_active());
        assert_eq!(
            fx.engine.candidate_ready.get(),
            matches!(state, LearnState::Confirming(_))
        );
    }
}
