use std::{
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    barrier::{Arrival, ParticipantId, RenderBarrier},
    MixerError, Result,
};

/// Bytes per pixel; framebuffers are always RGBA8.
pub const CHANNELS: usize = 4;

/// Immutable RGBA8 image snapshot. Clones share the pixel storage.
#[derive(Clone, PartialEq, Eq)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if pixels.len() != expected {
            return Err(MixerError::msg(format!(
                "framebuffer {width}x{height} needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels: pixels.into(),
        })
    }

    /// Caller guarantees `pixels.len() == width * height * CHANNELS`.
    pub(crate) fn from_parts(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * CHANNELS);
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::from_fn(width, height, |_, _| rgba)
    }

    pub fn from_fn(width: u32, height: u32, mut pixel: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&pixel(x, y));
            }
        }
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let mut out = [0; 4];
        out.copy_from_slice(&self.pixels[offset..offset + CHANNELS]);
        out
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// One-shot completion handle passed to a producer with each render request.
#[derive(Debug)]
pub struct RenderCompletion {
    barrier: Arc<RenderBarrier>,
    participant: ParticipantId,
    round: u64,
}

impl RenderCompletion {
    /// `round` is the barrier round the render was requested for; completing
    /// after that round was cancelled has no effect.
    pub fn new(barrier: Arc<RenderBarrier>, participant: ParticipantId, round: u64) -> Self {
        Self {
            barrier,
            participant,
            round,
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Reports the render as finished.
    pub fn complete(self) -> Arrival {
        self.barrier.notify(self.participant, self.round)
    }
}

/// A deck: something that renders a framebuffer asynchronously.
pub trait RenderProducer: Send + Sync {
    fn name(&self) -> &str;
    /// Starts a render. The producer must call
    /// [`RenderCompletion::complete`] once the result is retrievable.
    fn request_render(&self, completion: RenderCompletion);
    /// Result of the last finished render.
    fn framebuffer(&self) -> Option<Framebuffer>;
}

/// Built-in animated test patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    /// Horizontal colour ramp scrolling one pixel per frame.
    Gradient,
    /// Checkerboard whose phase flips every frame.
    Checker,
    Solid([u8; 4]),
}

impl Pattern {
    pub fn render(&self, width: u32, height: u32, frame: u64) -> Framebuffer {
        match *self {
            Pattern::Gradient => Framebuffer::from_fn(width, height, |x, y| {
                let phase = (x as u64 + frame) % width.max(1) as u64;
                let r = (phase * 255 / width.max(1) as u64) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                [r, g, 255 - r, 255]
            }),
            Pattern::Checker => Framebuffer::from_fn(width, height, |x, y| {
                let lit = (x + y + frame as u32) % 2 == 0;
                if lit {
                    [255, 255, 255, 255]
                } else {
                    [0, 0, 0, 255]
                }
            }),
            Pattern::Solid(rgba) => Framebuffer::filled(width, height, rgba),
        }
    }
}

/// Deck that renders a [`Pattern`] on its own worker thread.
pub struct PatternDeck {
    name: String,
    requests: Option<Sender<RenderCompletion>>,
    latest: Arc<Mutex<Option<Framebuffer>>>,
    worker: Option<JoinHandle<()>>,
}

impl PatternDeck {
    pub fn new(name: impl Into<String>, pattern: Pattern, width: u32, height: u32) -> Self {
        let name = name.into();
        let (requests_tx, requests_rx) = crossbeam_channel::unbounded::<RenderCompletion>();
        let latest = Arc::new(Mutex::new(None));

        let worker = {
            let latest = latest.clone();
            thread::Builder::new()
                .name(format!("deck-{name}"))
                .spawn(move || {
                    for (frame, completion) in requests_rx.into_iter().enumerate() {
                        *latest.lock() = Some(pattern.render(width, height, frame as u64));
                        completion.complete();
                    }
                })
                .map_err(|err| tracing::error!(%err, deck = %name, "failed to spawn deck thread"))
                .ok()
        };

        Self {
            name,
            requests: Some(requests_tx),
            latest,
            worker,
        }
    }
}

impl RenderProducer for PatternDeck {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_render(&self, completion: RenderCompletion) {
        let Some(requests) = &self.requests else {
            return;
        };
        if requests.send(completion).is_err() {
            tracing::warn!(deck = %self.name, "deck worker is gone, render request dropped");
        }
    }

    fn framebuffer(&self) -> Option<Framebuffer> {
        self.latest.lock().clone()
    }
}

impl Drop for PatternDeck {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for PatternDeck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternDeck")
            .field("name", &self.name)
            .finish()
    }
}
