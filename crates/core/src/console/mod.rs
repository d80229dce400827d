//! Top-level wiring of the mixing console.
//!
//! Every subsystem is constructed once here and handed its collaborators
//! explicitly. Data flows one way per tick: decks render, the barrier joins
//! them, the converter composites and corrects, then the preview goes to the
//! preview channel and the display image to the streamer.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use crossbeam_channel::Receiver;

use crate::{
    barrier::{ParticipantId, RenderBarrier},
    compose::ImageConverter,
    config::{LoadReport, SettingsDocument, SettingsSection},
    controller::ControllerInput,
    display::{DisplayStreamer, SerialDevice},
    mapping::ControllerBindingEngine,
    render::{Framebuffer, RenderCompletion, RenderProducer},
    Parameter, ParameterRegistry, Result,
};

struct Deck {
    producer: Arc<dyn RenderProducer>,
    participant: ParticipantId,
}

pub struct MixConsole {
    registry: Arc<ParameterRegistry>,
    converter: ImageConverter,
    /// Preview refresh period in milliseconds.
    pub preview_interval: Parameter<i32>,
    engine: Arc<ControllerBindingEngine>,
    controller: ControllerInput,
    barrier: Arc<RenderBarrier>,
    decks: [Deck; 2],
    streamer: Arc<DisplayStreamer>,
    previews: Receiver<Framebuffer>,
    composites: Arc<AtomicU64>,
}

impl MixConsole {
    pub fn new(decks: [Arc<dyn RenderProducer>; 2], device: Box<dyn SerialDevice>) -> Result<Self> {
        let registry = Arc::new(ParameterRegistry::new());
        let converter = ImageConverter::new();
        let preview_interval = Parameter::ranged("previewInterval", 33, 20, 100);
        let streamer = Arc::new(DisplayStreamer::new(device));

        registry.register(&converter.crossfade)?;
        registry.register(&converter.brightness)?;
        registry.register(&converter.contrast)?;
        registry.register(&converter.gamma)?;
        registry.register_persisted(&converter.display_width)?;
        registry.register_persisted(&converter.display_height)?;
        registry.register_persisted(&streamer.interval)?;
        registry.register_persisted(&preview_interval)?;

        let capturing = Parameter::new("controllerCapturing", false);
        let engine = ControllerBindingEngine::new(registry.clone(), capturing.clone());
        let controller = ControllerInput::new(capturing, engine.clone());

        let barrier = Arc::new(RenderBarrier::new());
        let [first, second] = decks;
        let decks = [
            Deck {
                participant: barrier.register(first.name()),
                producer: first,
            },
            Deck {
                participant: barrier.register(second.name()),
                producer: second,
            },
        ];

        let (previews_tx, previews_rx) = crossbeam_channel::bounded(1);
        let composites = Arc::new(AtomicU64::new(0));
        {
            // The callback runs on a deck thread; it holds weak handles so a
            // deck never ends up owning itself through the barrier.
            let producers: [Weak<dyn RenderProducer>; 2] = [
                Arc::downgrade(&decks[0].producer),
                Arc::downgrade(&decks[1].producer),
            ];
            let streamer = Arc::downgrade(&streamer);
            let converter = converter.clone();
            let composites = composites.clone();
            barrier.on_joined(move |round| {
                let [Some(a), Some(b)] = producers.each_ref().map(|deck| {
                    deck.upgrade().and_then(|deck| deck.framebuffer())
                }) else {
                    tracing::warn!(round, "deck output missing, skipping composite");
                    return;
                };

                let images = converter.convert(&a, &b);
                composites.fetch_add(1, Ordering::Relaxed);
                if previews_tx.try_send(images.preview).is_err() {
                    tracing::trace!(round, "preview consumer lagging, frame dropped");
                }
                if let Some(streamer) = streamer.upgrade() {
                    streamer.send_frame(images.display);
                }
            });
        }

        tracing::info!(
            decks = ?barrier.participants(),
            parameters = registry.len(),
            "mix console ready"
        );

        Ok(Self {
            registry,
            converter,
            preview_interval,
            engine,
            controller,
            barrier,
            decks,
            streamer,
            previews: previews_rx,
            composites,
        })
    }

    /// Starts a render round unless the previous one is still joining.
    /// Returns whether a round was started.
    pub fn tick(&self) -> bool {
        if self.barrier.is_joining() {
            tracing::trace!(round = self.barrier.round(), "previous round still rendering");
            return false;
        }
        let round = match self.barrier.start() {
            Ok(round) => round,
            Err(err) => {
                tracing::warn!(%err, "could not start render round");
                return false;
            }
        };
        tracing::trace!(round, "render round started");
        for deck in &self.decks {
            let completion = RenderCompletion::new(self.barrier.clone(), deck.participant, round);
            deck.producer.request_render(completion);
        }
        true
    }

    /// Abandons a stalled round so the next tick can start fresh.
    pub fn cancel_round(&self) -> bool {
        self.barrier.cancel()
    }

    pub fn registry(&self) -> &Arc<ParameterRegistry> {
        &self.registry
    }

    pub fn converter(&self) -> &ImageConverter {
        &self.converter
    }

    pub fn engine(&self) -> &Arc<ControllerBindingEngine> {
        &self.engine
    }

    pub fn controller(&self) -> &ControllerInput {
        &self.controller
    }

    pub fn streamer(&self) -> &DisplayStreamer {
        &self.streamer
    }

    pub fn barrier(&self) -> &RenderBarrier {
        &self.barrier
    }

    /// Latest full-resolution composites. Holds at most one frame; older
    /// previews are dropped while nobody is reading.
    pub fn previews(&self) -> Receiver<Framebuffer> {
        self.previews.clone()
    }

    pub fn composites(&self) -> u64 {
        self.composites.load(Ordering::Relaxed)
    }

    fn sections(&self) -> [&dyn SettingsSection; 4] {
        [
            &*self.registry as &dyn SettingsSection,
            &*self.engine,
            &*self.streamer,
            &self.controller,
        ]
    }

    pub fn save_settings(&self) -> Result<SettingsDocument> {
        SettingsDocument::collect(&self.sections())
    }

    pub fn load_settings(&self, document: &SettingsDocument) -> LoadReport {
        let report = document.apply(&self.sections());
        tracing::info!(
            loaded = ?report.loaded,
            failed = report.errors.len(),
            "settings applied"
        );
        report
    }
}

impl fmt::Debug for MixConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixConsole")
            .field("barrier", &self.barrier)
            .field("engine", &self.engine)
            .field("streamer", &self.streamer)
            .finish()
    }
}
