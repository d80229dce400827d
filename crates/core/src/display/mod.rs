//! Streaming composited frames to a serial LED display.
//!
//! Frames are flattened into RGB bytes in the order the physical strip is
//! wired and written on a dedicated thread, so a slow or stalled device never
//! blocks compositing. The hand-off slot holds a single frame: a newer frame
//! replaces one that has not been written yet.

use std::{
    fmt,
    io::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{parameter::Subscription, render::Framebuffer, MixerError, Parameter, Result};

/// Bytes handed to the device per write call; sending is re-checked between
/// chunks so a stop request aborts a frame quickly.
const WRITE_CHUNK: usize = 256;
/// Bits on the wire per byte with 8N1 framing.
const BITS_PER_BYTE: u64 = 10;
/// Extra time a frame may take beyond its wire time before a timeout is
/// reported.
const WRITE_GRACE: Duration = Duration::from_millis(500);
const EVENT_QUEUE_SIZE: usize = 64;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const STANDARD_BAUD_RATES: [u32; 9] = [
    9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 921_600, 1_000_000,
];

/// Raster traversal used when flattening an image onto a 1-D strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanlineDirection {
    #[default]
    ConstantLeftToRight,
    ConstantRightToLeft,
    /// Serpentine wiring, first row left to right.
    AlternatingStartLeft,
    /// Serpentine wiring, first row right to left.
    AlternatingStartRight,
}

impl ScanlineDirection {
    /// Whether output row `row` runs right to left.
    pub fn is_reversed(self, row: u32) -> bool {
        match self {
            ScanlineDirection::ConstantLeftToRight => false,
            ScanlineDirection::ConstantRightToLeft => true,
            ScanlineDirection::AlternatingStartLeft => row % 2 == 1,
            ScanlineDirection::AlternatingStartRight => row % 2 == 0,
        }
    }
}

/// Serial link settings, persisted as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayLinkConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub scanline_direction: ScanlineDirection,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub interval_ms: i32,
    pub sending: bool,
}

impl Default for DisplayLinkConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            scanline_direction: ScanlineDirection::default(),
            flip_horizontal: false,
            flip_vertical: false,
            interval_ms: 50,
            sending: false,
        }
    }
}

/// Flattens `image` into RGB triplets. Flips are applied to the image first;
/// the scanline direction then decides the order within each output row.
pub fn serialize_frame(
    image: &Framebuffer,
    direction: ScanlineDirection,
    flip_horizontal: bool,
    flip_vertical: bool,
) -> Vec<u8> {
    let width = image.width();
    let height = image.height();
    let mut out = Vec::with_capacity(width as usize * height as usize * 3);

    for row in 0..height {
        let y = if flip_vertical { height - 1 - row } else { row };
        let reversed = direction.is_reversed(row);
        for column in 0..width {
            let flipped_x = if reversed { width - 1 - column } else { column };
            let x = if flip_horizontal {
                width - 1 - flipped_x
            } else {
                flipped_x
            };
            out.extend_from_slice(&image.pixel(x, y)[..3]);
        }
    }
    out
}

/// Minimum wire time for `bytes` at `baud`.
pub fn transmit_time(bytes: usize, baud: u32) -> Duration {
    if baud == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(bytes as u64 * BITS_PER_BYTE * 1_000_000 / baud as u64)
}

/// Byte sink behind the display link.
pub trait SerialDevice: Send {
    fn open(&mut self, name: &str, baud: u32) -> Result<()>;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Time a single write may block before the port reports a timeout.
const PORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial port opened through the `serialport` crate at the configured baud
/// rate with 8N1 framing.
#[derive(Default)]
pub struct TtyDevice {
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl TtyDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for TtyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtyDevice")
            .field("port", &self.port.as_ref().and_then(|port| port.name()))
            .finish()
    }
}

/// Bare device names such as `ttyUSB0` live under `/dev` on unix systems.
fn device_path(name: &str) -> String {
    if cfg!(unix) && !name.contains('/') {
        format!("/dev/{name}")
    } else {
        name.to_string()
    }
}

impl SerialDevice for TtyDevice {
    fn open(&mut self, name: &str, baud: u32) -> Result<()> {
        let path = device_path(name);
        let port = serialport::new(path.as_str(), baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|err| MixerError::Device(format!("failed to open {path}: {err}")))?;
        tracing::debug!(%path, baud, "serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| MixerError::Device("port is not open".into()))?;
        port.write_all(bytes)
            .map_err(|err| MixerError::Device(format!("write failed: {err}")))
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.flush();
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[derive(Debug, Default)]
struct Recording {
    open: Option<(String, u32)>,
    opens: Vec<(String, u32)>,
    frames: Vec<Vec<u8>>,
    current: Vec<u8>,
    fail_open: bool,
}

/// In-memory sink used for dry runs and tests. Clones share the same
/// recording. Each close finishes the bytes written since the last close as
/// one entry of [`RecordingDevice::closed_streams`].
#[derive(Debug, Clone, Default)]
pub struct RecordingDevice {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `open` calls fail.
    pub fn fail_open(&self, fail: bool) {
        self.inner.lock().fail_open = fail;
    }

    /// All bytes written, across opens.
    pub fn written(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut all: Vec<u8> = inner.frames.concat();
        all.extend_from_slice(&inner.current);
        all
    }

    pub fn closed_streams(&self) -> Vec<Vec<u8>> {
        self.inner.lock().frames.clone()
    }

    pub fn opens(&self) -> Vec<(String, u32)> {
        self.inner.lock().opens.clone()
    }
}

impl SerialDevice for RecordingDevice {
    fn open(&mut self, name: &str, baud: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_open {
            return Err(MixerError::Device(format!("{name} is busy")));
        }
        inner.open = Some((name.to_string(), baud));
        inner.opens.push((name.to_string(), baud));
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.open.is_none() {
            return Err(MixerError::Device("port is not open".into()));
        }
        inner.current.extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = self.inner.lock();
        if inner.open.take().is_some() {
            let stream = std::mem::take(&mut inner.current);
            inner.frames.push(stream);
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open.is_some()
    }
}

/// Lists serial device names present on this machine, without the `/dev/`
/// prefix.
pub fn available_port_names() -> Vec<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            tracing::warn!(%err, "failed to enumerate serial ports");
            return Vec::new();
        }
    };
    let mut names: Vec<String> = ports
        .into_iter()
        .map(|port| port.port_name.trim_start_matches("/dev/").to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Status changes reported by the streaming thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened(String),
    Closed,
    Error(String),
    Timeout(String),
}

#[derive(Debug, Default)]
struct Slot {
    frame: Option<Framebuffer>,
    reconfigure: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
    config: Mutex<DisplayLinkConfig>,
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Shared {
    fn request_reconfigure(&self) {
        self.slot.lock().reconfigure = true;
        self.wake.notify_all();
    }
}

/// Owns the serial link and the writer thread.
pub struct DisplayStreamer {
    /// Whether frames are sent. Clearing it aborts an in-flight frame and
    /// closes the port.
    pub sending: Parameter<bool>,
    /// Reflects whether the device is currently open.
    pub port_open: Parameter<bool>,
    /// Compositing tick in milliseconds.
    pub interval: Parameter<i32>,
    shared: Arc<Shared>,
    events: Receiver<LinkEvent>,
    worker: Option<JoinHandle<()>>,
    _sending_watch: Subscription,
}

impl DisplayStreamer {
    pub fn new(device: Box<dyn SerialDevice>) -> Self {
        let sending = Parameter::new("displaySending", false);
        let port_open = Parameter::new("displayPortOpen", false);
        let interval = Parameter::ranged("displayInterval", 50, 20, 100);
        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_QUEUE_SIZE);

        let sending_watch = {
            let shared = shared.clone();
            sending.subscribe(move |active: &bool| {
                tracing::info!(sending = *active, "display sending changed");
                shared.request_reconfigure();
            })
        };

        let worker = {
            let writer = LinkWriter {
                shared: shared.clone(),
                device,
                opened: None,
                sending: sending.clone(),
                port_open: port_open.clone(),
                events: events_tx,
            };
            thread::Builder::new()
                .name("display-link".into())
                .spawn(move || writer.run())
                .map_err(|err| tracing::error!(%err, "failed to spawn display link thread"))
                .ok()
        };

        Self {
            sending,
            port_open,
            interval,
            shared,
            events: events_rx,
            worker,
            _sending_watch: sending_watch,
        }
    }

    /// Hands a frame to the writer. Returns `false` when it was discarded
    /// because sending is off. A frame still waiting in the slot is replaced.
    pub fn send_frame(&self, frame: Framebuffer) -> bool {
        if !self.sending.get() {
            return false;
        }
        let replaced = self.shared.slot.lock().frame.replace(frame).is_some();
        if replaced {
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.wake.notify_all();
        true
    }

    /// Selecting a different port stops sending, as the open device no
    /// longer matches the selection.
    pub fn set_port_name(&self, name: &str) {
        {
            let mut config = self.shared.config.lock();
            if config.port_name == name {
                return;
            }
            config.port_name = name.to_string();
        }
        tracing::info!(port = name, "display port selected");
        self.sending.set(false);
        self.shared.request_reconfigure();
    }

    pub fn set_baud_rate(&self, baud: u32) -> Result<()> {
        if baud == 0 {
            return Err(MixerError::InvalidOperation("baud rate must be positive".into()));
        }
        self.shared.config.lock().baud_rate = baud;
        self.shared.request_reconfigure();
        Ok(())
    }

    pub fn set_scanline_direction(&self, direction: ScanlineDirection) {
        self.shared.config.lock().scanline_direction = direction;
    }

    pub fn set_flip(&self, horizontal: bool, vertical: bool) {
        let mut config = self.shared.config.lock();
        config.flip_horizontal = horizontal;
        config.flip_vertical = vertical;
    }

    pub fn set_sending(&self, sending: bool) {
        self.sending.set(sending);
    }

    /// Current settings, including the sending flag and interval.
    pub fn config(&self) -> DisplayLinkConfig {
        let mut config = self.shared.config.lock().clone();
        config.sending = self.sending.get();
        config.interval_ms = self.interval.get();
        config
    }

    /// Restores persisted settings as one unit.
    pub fn apply_config(&self, config: &DisplayLinkConfig) -> Result<()> {
        if config.baud_rate == 0 {
            return Err(MixerError::InvalidOperation("baud rate must be positive".into()));
        }
        {
            let mut current = self.shared.config.lock();
            *current = config.clone();
        }
        self.interval.set(config.interval_ms);
        self.sending.set(config.sending);
        self.shared.request_reconfigure();
        Ok(())
    }

    /// Receiver for link status changes.
    pub fn events(&self) -> Receiver<LinkEvent> {
        self.events.clone()
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for DisplayStreamer {
    fn drop(&mut self) {
        self.shared.slot.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for DisplayStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayStreamer")
            .field("config", &self.config())
            .field("port_open", &self.port_open.get())
            .finish()
    }
}

struct LinkWriter {
    shared: Arc<Shared>,
    device: Box<dyn SerialDevice>,
    opened: Option<(String, u32)>,
    sending: Parameter<bool>,
    port_open: Parameter<bool>,
    events: Sender<LinkEvent>,
}

impl LinkWriter {
    fn run(mut self) {
        loop {
            let frame = {
                let mut slot = self.shared.slot.lock();
                while slot.frame.is_none() && !slot.reconfigure && !slot.shutdown {
                    self.shared.wake.wait(&mut slot);
                }
                if slot.shutdown {
                    break;
                }
                slot.reconfigure = false;
                slot.frame.take()
            };

            // Settings are captured once per frame and stay fixed while it is
            // written.
            let config = self.shared.config.lock().clone();
            self.reconcile(&config);

            if let Some(frame) = frame {
                if self.opened.is_some() {
                    self.write_frame(&frame, &config);
                }
            }
        }
        self.close();
        tracing::debug!("display link thread stopped");
    }

    fn reconcile(&mut self, config: &DisplayLinkConfig) {
        let wanted = self.sending.get() && !config.port_name.is_empty();
        let target = (config.port_name.clone(), config.baud_rate);

        if self.opened.is_some() && (!wanted || self.opened.as_ref() != Some(&target)) {
            self.close();
        }
        if wanted && self.opened.is_none() {
            match self.device.open(&target.0, target.1) {
                Ok(()) => {
                    tracing::info!(port = %target.0, baud = target.1, "display port opened");
                    self.opened = Some(target.clone());
                    self.port_open.set(true);
                    self.emit(LinkEvent::Opened(target.0));
                }
                Err(err) => {
                    tracing::warn!(port = %target.0, %err, "failed to open display port");
                    self.emit(LinkEvent::Error(err.to_string()));
                    self.sending.set(false);
                }
            }
        }
    }

    fn write_frame(&mut self, frame: &Framebuffer, config: &DisplayLinkConfig) {
        let bytes = serialize_frame(
            frame,
            config.scanline_direction,
            config.flip_horizontal,
            config.flip_vertical,
        );
        let started = Instant::now();

        for chunk in bytes.chunks(WRITE_CHUNK) {
            if !self.sending.get() {
                tracing::debug!("sending stopped mid-frame, aborting write");
                self.close();
                return;
            }
            if let Err(err) = self.device.write(chunk) {
                tracing::warn!(%err, "display write failed");
                self.emit(LinkEvent::Error(err.to_string()));
                self.close();
                return;
            }
        }
        self.shared.frames_written.fetch_add(1, Ordering::Relaxed);

        let wire_time = transmit_time(bytes.len(), config.baud_rate);
        let elapsed = started.elapsed();
        if elapsed > wire_time * 2 + WRITE_GRACE {
            self.emit(LinkEvent::Timeout(format!(
                "frame of {} bytes took {} ms",
                bytes.len(),
                elapsed.as_millis()
            )));
        }
        self.pace(started + wire_time);
    }

    /// Holds off the next frame until the previous one has had time to leave
    /// the wire. Frames arriving meanwhile replace each other in the slot.
    fn pace(&self, deadline: Instant) {
        let mut slot = self.shared.slot.lock();
        while !slot.shutdown && Instant::now() < deadline {
            if self.shared.wake.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
    }

    fn close(&mut self) {
        if self.opened.take().is_some() {
            self.device.close();
            tracing::info!("display port closed");
            self.port_open.set(false);
            self.emit(LinkEvent::Closed);
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn image_2x2() -> Framebuffer {
        // p(x, y) = [10 * y + x, 0, 0]
        Framebuffer::from_fn(2, 2, |x, y| [(10 * y + x) as u8, 0, 0, 255])
    }

    fn reds(bytes: &[u8]) -> Vec<u8> {
        bytes.chunks(3).map(|px| px[0]).collect()
    }

    #[test]
    fn alternating_start_left_snakes_rows() {
        let bytes = serialize_frame(&image_2x2(), ScanlineDirection::AlternatingStartLeft, false, false);
        assert_eq!(reds(&bytes), vec![0, 1, 11, 10]);
    }

    #[test]
    fn scanline_directions_order_rows() {
        let image = image_2x2();
        let order = |direction| reds(&serialize_frame(&image, direction, false, false));
        assert_eq!(order(ScanlineDirection::ConstantLeftToRight), vec![0, 1, 10, 11]);
        assert_eq!(order(ScanlineDirection::ConstantRightToLeft), vec![1, 0, 11, 10]);
        assert_eq!(order(ScanlineDirection::AlternatingStartRight), vec![1, 0, 10, 11]);
    }

    #[test]
    fn flips_apply_before_raster_order() {
        let image = image_2x2();
        let vertical = serialize_frame(&image, ScanlineDirection::AlternatingStartLeft, false, true);
        assert_eq!(reds(&vertical), vec![10, 11, 1, 0]);

        let horizontal = serialize_frame(&image, ScanlineDirection::AlternatingStartLeft, true, false);
        assert_eq!(reds(&horizontal), vec![1, 0, 10, 11]);
    }

    #[test]
    fn emits_rgb_without_alpha() {
        let image = Framebuffer::filled(3, 1, [1, 2, 3, 4]);
        let bytes = serialize_frame(&image, ScanlineDirection::ConstantLeftToRight, false, false);
        assert_eq!(bytes, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn transmit_time_follows_baud_rate() {
        assert_eq!(transmit_time(11_520, 115_200), Duration::from_secs(1));
        assert_eq!(transmit_time(100, 0), Duration::ZERO);
    }

    #[test]
    fn streams_frames_once_sending() {
        let device = RecordingDevice::new();
        let streamer = DisplayStreamer::new(Box::new(device.clone()));
        streamer.set_port_name("ttyUSB0");
        streamer.set_baud_rate(1_000_000).unwrap();
        streamer.set_scanline_direction(ScanlineDirection::AlternatingStartLeft);

        assert!(!streamer.send_frame(image_2x2()));
        streamer.set_sending(true);
        assert!(wait_for(|| streamer.port_open.get()));
        assert!(streamer.send_frame(image_2x2()));

        assert!(wait_for(|| streamer.frames_written() == 1));
        assert_eq!(reds(&device.written()), vec![0, 1, 11, 10]);
        assert_eq!(device.opens(), vec![("ttyUSB0".to_string(), 1_000_000)]);
    }

    #[test]
    fn stopping_closes_port_and_reports_status() {
        let device = RecordingDevice::new();
        let streamer = DisplayStreamer::new(Box::new(device.clone()));
        let events = streamer.events();
        streamer.set_port_name("ttyACM0");
        streamer.set_sending(true);
        assert!(wait_for(|| streamer.port_open.get()));

        streamer.set_sending(false);
        assert!(wait_for(|| !streamer.port_open.get()));
        assert!(!device.is_open());

        let received: Vec<LinkEvent> = (0..2)
            .map(|_| events.recv_timeout(Duration::from_secs(3)).unwrap())
            .collect();
        assert_eq!(
            received,
            vec![LinkEvent::Opened("ttyACM0".into()), LinkEvent::Closed]
        );
    }

    #[test]
    fn open_failure_is_reported_not_fatal() {
        let device = RecordingDevice::new();
        device.fail_open(true);
        let streamer = DisplayStreamer::new(Box::new(device.clone()));
        let events = streamer.events();
        streamer.set_port_name("ttyUSB9");
        streamer.set_sending(true);

        let event = events.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(matches!(event, LinkEvent::Error(message) if message.contains("busy")));
        assert!(wait_for(|| !streamer.sending.get()));
        assert!(!streamer.port_open.get());

        device.fail_open(false);
        streamer.set_sending(true);
        assert!(wait_for(|| streamer.port_open.get()));
    }

    #[test]
    fn changing_port_stops_sending() {
        let device = RecordingDevice::new();
        let streamer = DisplayStreamer::new(Box::new(device.clone()));
        streamer.set_port_name("ttyUSB0");
        streamer.set_sending(true);
        assert!(wait_for(|| streamer.port_open.get()));

        streamer.set_port_name("ttyUSB1");
        assert!(!streamer.sending.get());
        assert!(wait_for(|| !streamer.port_open.get()));
    }

    #[test]
    fn config_round_trips_through_apply() {
        let streamer = DisplayStreamer::new(Box::new(RecordingDevice::new()));
        let config = DisplayLinkConfig {
            port_name: "ttyUSB3".into(),
            baud_rate: 460_800,
            scanline_direction: ScanlineDirection::AlternatingStartRight,
            flip_horizontal: true,
            flip_vertical: false,
            interval_ms: 40,
            sending: false,
        };
        streamer.apply_config(&config).unwrap();
        assert_eq!(streamer.config(), config);

        let invalid = DisplayLinkConfig {
            baud_rate: 0,
            ..config.clone()
        };
        assert!(streamer.apply_config(&invalid).is_err());
        assert_eq!(streamer.config(), config);
    }

    /// Device whose writes each wait for a permit, so a frame can be held
    /// part way through.
    #[derive(Clone)]
    struct GatedDevice {
        permits: Receiver<()>,
        written: Arc<Mutex<usize>>,
        open: Arc<Mutex<bool>>,
    }

    impl SerialDevice for GatedDevice {
        fn open(&mut self, _name: &str, _baud: u32) -> Result<()> {
            *self.open.lock() = true;
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            // A dropped sender releases every remaining write.
            let _ = self.permits.recv();
            *self.written.lock() += bytes.len();
            Ok(())
        }

        fn close(&mut self) {
            *self.open.lock() = false;
        }

        fn is_open(&self) -> bool {
            *self.open.lock()
        }
    }

    #[test]
    fn clearing_sending_mid_frame_aborts_the_write() {
        let (permit_tx, permits) = crossbeam_channel::unbounded();
        let device = GatedDevice {
            permits,
            written: Arc::new(Mutex::new(0)),
            open: Arc::new(Mutex::new(false)),
        };
        let streamer = DisplayStreamer::new(Box::new(device.clone()));
        streamer.set_port_name("ttyUSB0");
        streamer.set_baud_rate(1_000_000).unwrap();
        streamer.set_sending(true);
        assert!(wait_for(|| streamer.port_open.get()));

        // 32x32 RGB is twelve chunks.
        let frame = Framebuffer::filled(32, 32, [9, 9, 9, 255]);
        let frame_bytes = 32 * 32 * 3;
        assert!(streamer.send_frame(frame));
        permit_tx.send(()).unwrap();
        permit_tx.send(()).unwrap();
        assert!(wait_for(|| *device.written.lock() == 2 * WRITE_CHUNK));

        streamer.set_sending(false);
        drop(permit_tx);

        assert!(wait_for(|| !streamer.port_open.get()));
        assert!(!device.is_open());
        let written = *device.written.lock();
        assert!(written < frame_bytes, "wrote {written} of {frame_bytes} bytes");
        assert_eq!(streamer.frames_written(), 0);
    }

    #[test]
    fn missing_tty_reports_a_device_error() {
        let mut device = TtyDevice::new();
        let err = device.open("ttyLedMixerMissing0", 115_200).unwrap_err();
        assert!(matches!(err, MixerError::Device(message) if message.contains("ttyLedMixerMissing0")));
        assert!(!device.is_open());
        assert!(device.write(&[1, 2, 3]).is_err());
    }

    #[test]
    fn bare_port_names_resolve_under_dev() {
        if cfg!(unix) {
            assert_eq!(device_path("ttyUSB0"), "/dev/ttyUSB0");
        }
        assert_eq!(device_path("/dev/ttyACM1"), "/dev/ttyACM1");
    }

    #[test]
    fn newer_frames_replace_pending_ones() {
        let device = RecordingDevice::new();
        let streamer = DisplayStreamer::new(Box::new(device.clone()));
        streamer.set_port_name("ttyUSB0");
        // Slow link: 9600 baud keeps the writer pacing between frames.
        streamer.set_baud_rate(9_600).unwrap();
        streamer.set_sending(true);
        assert!(wait_for(|| streamer.port_open.get()));

        let frame = Framebuffer::filled(16, 8, [1, 1, 1, 255]);
        for _ in 0..10 {
            streamer.send_frame(frame.clone());
        }
        assert!(wait_for(|| streamer.frames_written() >= 1));
        assert!(streamer.frames_dropped() >= 1);
        assert!(streamer.frames_written() + streamer.frames_dropped() <= 10);
    }
}
