//! Controller input: typed events, raw MIDI decoding and the dispatch thread
//! that forwards events to the binding engine in arrival order.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{parameter::Subscription, MixerError, Parameter, Result};

#[cfg(feature = "midi")]
pub mod midi;

/// Maximum controller events buffered between the transport and dispatch.
const EVENT_QUEUE_SIZE: usize = 1024;

/// Control indices for non-CC messages live above the 7-bit CC space.
pub const NOTE_CONTROL_BASE: u16 = 0x100;
pub const PITCH_BEND_CONTROL: u16 = 0x200;
pub const CHANNEL_PRESSURE_CONTROL: u16 = 0x300;

/// Device id carried by events from the selected input. Only one input is
/// captured at a time, so bindings stay valid when port order changes.
pub const SELECTED_DEVICE: u32 = 0;

const SEVEN_BIT_MAX: u16 = 127;
const FOURTEEN_BIT_MAX: u16 = 16_383;

/// Identifies one physical control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerKey {
    pub device: u32,
    pub channel: u8,
    pub control: u16,
}

impl ControllerKey {
    pub fn new(device: u32, channel: u8, control: u16) -> Self {
        Self {
            device,
            channel,
            control,
        }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.device, self.channel, self.control)
    }
}

/// A single value change from a controller, in device-native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerEvent {
    pub key: ControllerKey,
    pub value: u16,
    /// Largest value the control can send (127 for 7-bit messages).
    pub max_value: u16,
    /// Arrival order; assigned when the event enters the input queue.
    pub sequence: u64,
}

impl ControllerEvent {
    pub fn control_change(device: u32, channel: u8, cc: u8, value: u8) -> Self {
        Self {
            key: ControllerKey::new(device, channel, cc as u16),
            value: value as u16,
            max_value: SEVEN_BIT_MAX,
            sequence: 0,
        }
    }
}

/// Decodes raw MIDI bytes into a controller event. System messages and
/// messages without a meaningful value are dropped.
pub fn parse_midi_message(device: u32, data: &[u8]) -> Option<ControllerEvent> {
    let status_byte = *data.first()?;
    if status_byte >= 0xF0 || status_byte < 0x80 {
        return None;
    }

    let channel = status_byte & 0x0F;
    let status = status_byte & 0xF0;
    let data1 = data.get(1).copied().unwrap_or(0) & 0x7F;
    let data2 = data.get(2).copied().unwrap_or(0) & 0x7F;

    let (control, value, max_value) = match status {
        0xB0 => (data1 as u16, data2 as u16, SEVEN_BIT_MAX),
        0x90 => (NOTE_CONTROL_BASE + data1 as u16, data2 as u16, SEVEN_BIT_MAX),
        0x80 => (NOTE_CONTROL_BASE + data1 as u16, 0, SEVEN_BIT_MAX),
        0xE0 => (
            PITCH_BEND_CONTROL,
            ((data2 as u16) << 7) | data1 as u16,
            FOURTEEN_BIT_MAX,
        ),
        0xD0 => (CHANNEL_PRESSURE_CONTROL, data1 as u16, SEVEN_BIT_MAX),
        _ => return None,
    };

    Some(ControllerEvent {
        key: ControllerKey::new(device, channel, control),
        value,
        max_value,
        sequence: 0,
    })
}

/// Consumer of dispatched controller events.
pub trait ControllerEventSink: Send + Sync {
    fn handle_event(&self, event: &ControllerEvent);
}

/// Handle given to the concrete transport (hardware driver) for pushing
/// events into the console. Events pushed while capture is stopped are
/// dropped.
#[derive(Clone)]
pub struct ControllerSender {
    events: Sender<ControllerEvent>,
    capturing: Parameter<bool>,
    sequence: Arc<AtomicU64>,
}

impl ControllerSender {
    /// Queues an event for dispatch. Returns `false` when it was dropped.
    pub fn push(&self, mut event: ControllerEvent) -> bool {
        if !self.capturing.get() {
            return false;
        }
        event.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::debug!(key = %event.key, "controller queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Decodes and queues a raw MIDI message.
    pub fn push_midi(&self, device: u32, data: &[u8]) -> bool {
        match parse_midi_message(device, data) {
            Some(event) => self.push(event),
            None => false,
        }
    }
}

impl fmt::Debug for ControllerSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerSender")
            .field("capturing", &self.capturing.get())
            .finish()
    }
}

/// Hardware source of controller messages. It is opened on the selected
/// device when capture starts and closed whenever capture stops.
pub trait ControllerTransport: Send {
    fn open(&mut self, device: &str, sender: ControllerSender) -> Result<()>;
    /// Must be a no-op when nothing is open.
    fn close(&mut self);
}

type SharedTransport = Arc<Mutex<Option<Box<dyn ControllerTransport>>>>;

/// Owns the capture state and the dispatch thread.
pub struct ControllerInput {
    /// Name of the selected input device; empty means none.
    pub device: Parameter<String>,
    /// Whether events are currently being captured.
    pub capturing: Parameter<bool>,
    sender: ControllerSender,
    transport: SharedTransport,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    _device_watch: Subscription,
    _capture_watch: Subscription,
}

impl ControllerInput {
    /// `capturing` is shared with whoever must react to capture stopping
    /// (the binding engine leaves learn mode on it).
    pub fn new(capturing: Parameter<bool>, sink: Arc<dyn ControllerEventSink>) -> Self {
        let device = Parameter::new("controllerDevice", String::new());
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let worker = thread::Builder::new()
            .name("controller-dispatch".into())
            .spawn(move || dispatch_loop(events_rx, shutdown_rx, sink))
            .map_err(|err| tracing::error!(%err, "failed to spawn controller dispatch thread"))
            .ok();

        // Switching devices always stops capture.
        let device_watch = {
            let capturing = capturing.clone();
            device.subscribe(move |name: &String| {
                tracing::info!(device = %name, "controller device changed");
                capturing.set(false);
            })
        };

        let transport: SharedTransport = Arc::new(Mutex::new(None));
        let capture_watch = {
            let transport = transport.clone();
            capturing.subscribe(move |active: &bool| {
                if !*active {
                    if let Some(transport) = transport.lock().as_mut() {
                        transport.close();
                    }
                }
            })
        };

        Self {
            sender: ControllerSender {
                events: events_tx,
                capturing: capturing.clone(),
                sequence: Arc::new(AtomicU64::new(0)),
            },
            device,
            capturing,
            transport,
            shutdown: Some(shutdown_tx),
            worker,
            _device_watch: device_watch,
            _capture_watch: capture_watch,
        }
    }

    /// Installs the hardware transport. Capture is stopped first so the
    /// previous transport is closed.
    pub fn set_transport(&self, transport: Box<dyn ControllerTransport>) {
        self.stop();
        if let Some(mut previous) = self.transport.lock().replace(transport) {
            previous.close();
        }
    }

    pub fn sender(&self) -> ControllerSender {
        self.sender.clone()
    }

    /// Starts capturing from the selected device.
    pub fn start(&self) -> Result<()> {
        if self.device.get().is_empty() {
            return Err(MixerError::Device("no controller device selected".into()));
        }
        if self.worker.is_none() {
            return Err(MixerError::Device("controller dispatch is not running".into()));
        }
        if self.capturing.get() {
            return Ok(());
        }
        if let Some(transport) = self.transport.lock().as_mut() {
            transport.open(&self.device.get(), self.sender())?;
        }
        if self.capturing.set(true) {
            tracing::info!(device = %self.device.get(), "controller capture started");
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.capturing.set(false) {
            tracing::info!("controller capture stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.get()
    }
}

impl Drop for ControllerInput {
    fn drop(&mut self) {
        self.capturing.set(false);
        if let Some(transport) = self.transport.lock().as_mut() {
            transport.close();
        }
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for ControllerInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerInput")
            .field("device", &self.device.get())
            .field("capturing", &self.capturing.get())
            .finish()
    }
}

fn dispatch_loop(
    events: Receiver<ControllerEvent>,
    shutdown: Receiver<()>,
    sink: Arc<dyn ControllerEventSink>,
) {
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => sink.handle_event(&event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    tracing::debug!("controller dispatch stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct ChannelSink(Sender<ControllerEvent>);

    impl ControllerEventSink for ChannelSink {
        fn handle_event(&self, event: &ControllerEvent) {
            let _ = self.0.send(*event);
        }
    }

    fn input() -> (ControllerInput, Receiver<ControllerEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let capturing = Parameter::new("controllerCapturing", false);
        (ControllerInput::new(capturing, Arc::new(ChannelSink(tx))), rx)
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        log: Arc<Mutex<Vec<String>>>,
        sender: Arc<Mutex<Option<ControllerSender>>>,
        refuse: bool,
    }

    impl ControllerTransport for FakeTransport {
        fn open(&mut self, device: &str, sender: ControllerSender) -> Result<()> {
            if self.refuse {
                return Err(MixerError::Device(format!("{device} not found")));
            }
            self.log.lock().push(format!("open {device}"));
            *self.sender.lock() = Some(sender);
            Ok(())
        }

        fn close(&mut self) {
            if self.sender.lock().take().is_some() {
                self.log.lock().push("close".into());
            }
        }
    }

    #[test]
    fn transport_follows_capture() {
        let (input, rx) = input();
        let transport = FakeTransport::default();
        input.set_transport(Box::new(transport.clone()));
        input.device.set("Pads".into());

        input.start().unwrap();
        input.start().unwrap();
        let sender = transport.sender.lock().clone().unwrap();
        assert!(sender.push_midi(SELECTED_DEVICE, &[0xB0, 1, 64]));
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.key, ControllerKey::new(SELECTED_DEVICE, 0, 1));

        input.stop();
        input.start().unwrap();
        input.device.set("Knobs".into());
        assert!(!input.is_capturing());
        assert_eq!(
            *transport.log.lock(),
            vec!["open Pads", "close", "open Pads", "close"]
        );
    }

    #[test]
    fn failed_transport_open_leaves_capture_off() {
        let (input, _rx) = input();
        input.set_transport(Box::new(FakeTransport {
            refuse: true,
            ..FakeTransport::default()
        }));
        input.device.set("Ghost".into());

        assert!(matches!(input.start(), Err(MixerError::Device(message)) if message.contains("Ghost")));
        assert!(!input.is_capturing());
    }

    #[test]
    fn parses_control_change() {
        let event = parse_midi_message(2, &[0xB3, 7, 100]).unwrap();
        assert_eq!(event.key, ControllerKey::new(2, 3, 7));
        assert_eq!(event.value, 100);
        assert_eq!(event.max_value, 127);
    }

    #[test]
    fn parses_notes_and_pitch_bend() {
        let on = parse_midi_message(0, &[0x90, 60, 90]).unwrap();
        assert_eq!(on.key.control, NOTE_CONTROL_BASE + 60);
        assert_eq!(on.value, 90);

        let off = parse_midi_message(0, &[0x80, 60, 64]).unwrap();
        assert_eq!(off.key, on.key);
        assert_eq!(off.value, 0);

        let bend = parse_midi_message(0, &[0xE1, 0x7F, 0x7F]).unwrap();
        assert_eq!(bend.key.control, PITCH_BEND_CONTROL);
        assert_eq!(bend.value, 16_383);
        assert_eq!(bend.max_value, 16_383);
    }

    #[test]
    fn drops_system_and_malformed_messages() {
        assert!(parse_midi_message(0, &[]).is_none());
        assert!(parse_midi_message(0, &[0xF8]).is_none());
        assert!(parse_midi_message(0, &[0x40, 1, 2]).is_none());
        assert!(parse_midi_message(0, &[0xC0, 5]).is_none());
    }

    #[test]
    fn start_requires_a_device() {
        let (input, _rx) = input();
        assert!(matches!(input.start(), Err(MixerError::Device(_))));
        assert!(!input.is_capturing());

        input.device.set("nanoKONTROL2".into());
        input.start().unwrap();
        assert!(input.is_capturing());
    }

    #[test]
    fn changing_device_stops_capture() {
        let (input, _rx) = input();
        input.device.set("a".into());
        input.start().unwrap();

        input.device.set("b".into());
        assert!(!input.is_capturing());
    }

    #[test]
    fn dispatches_in_arrival_order_only_while_capturing() {
        let (input, rx) = input();
        let sender = input.sender();
        assert!(!sender.push(ControllerEvent::control_change(0, 0, 1, 1)));

        input.device.set("dev".into());
        input.start().unwrap();
        for value in 0..5 {
            assert!(sender.push(ControllerEvent::control_change(0, 0, 1, value)));
        }
        assert!(sender.push_midi(0, &[0xB0, 2, 9]));

        let received: Vec<ControllerEvent> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        let values: Vec<u16> = received.iter().map(|event| event.value).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 9]);
        assert!(received.windows(2).all(|w| w[0].sequence < w[1].sequence));

        input.stop();
        assert!(!sender.push(ControllerEvent::control_change(0, 0, 1, 1)));
    }
}
