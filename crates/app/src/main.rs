use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use led_mixer_core::{
    controller::SELECTED_DEVICE,
    display::{available_port_names, STANDARD_BAUD_RATES},
    MixConsole, MixerError, Pattern, PatternDeck, RecordingDevice,
    RenderProducer, SerialDevice, SettingsDocument, TtyDevice,
};
use tracing_subscriber::EnvFilter;

/// Deck resolution used by the built-in pattern decks.
const DECK_SIZE: (u32, u32) = (128, 64);
/// A round still joining after this long is abandoned.
const STALL_LIMIT: Duration = Duration::from_secs(1);

fn main() -> led_mixer_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            settings,
            port,
            baud,
            frames,
            dry_run,
            midi_device,
            midi_replay,
            save,
        } => run_console(RunOptions {
            settings,
            port,
            baud,
            frames,
            dry_run,
            midi_device,
            midi_replay,
            save,
        }),
        Commands::Ports => {
            list_ports();
            Ok(())
        }
        Commands::Parameters => list_parameters(),
        Commands::Defaults { output } => write_defaults(&output),
    }
}

struct RunOptions {
    settings: Option<PathBuf>,
    port: Option<String>,
    baud: Option<u32>,
    frames: Option<u64>,
    dry_run: bool,
    midi_device: Option<String>,
    midi_replay: Option<PathBuf>,
    save: Option<PathBuf>,
}

fn build_console(device: Box<dyn SerialDevice>) -> led_mixer_core::Result<MixConsole> {
    let (width, height) = DECK_SIZE;
    let decks: [Arc<dyn RenderProducer>; 2] = [
        Arc::new(PatternDeck::new("DeckA", Pattern::Gradient, width, height)),
        Arc::new(PatternDeck::new("DeckB", Pattern::Checker, width, height)),
    ];
    MixConsole::new(decks, device)
}

fn run_console(options: RunOptions) -> led_mixer_core::Result<()> {
    let device: Box<dyn SerialDevice> = if options.dry_run {
        Box::new(RecordingDevice::new())
    } else {
        Box::new(TtyDevice::new())
    };
    let console = build_console(device)?;

    if let Some(path) = &options.settings {
        match SettingsDocument::read(path) {
            Ok(document) => {
                let report = console.load_settings(&document);
                for err in &report.errors {
                    tracing::warn!(%err, "using defaults for settings section");
                }
            }
            Err(err) => tracing::warn!(?path, %err, "settings unreadable, using defaults"),
        }
    }

    if let Some(baud) = options.baud {
        console.streamer().set_baud_rate(baud)?;
    }
    if let Some(port) = &options.port {
        console.streamer().set_port_name(port);
    }
    if options.port.is_some() || options.dry_run {
        if options.dry_run && console.streamer().config().port_name.is_empty() {
            console.streamer().set_port_name("dry-run");
        }
        console.streamer().set_sending(true);
    }

    if let Some(device) = &options.midi_device {
        open_midi_input(&console, device)?;
    }
    if let Some(path) = &options.midi_replay {
        replay_midi(&console, path)?;
    }

    let events = console.streamer().events();
    let previews = console.previews();
    let mut last_report = Instant::now();
    let mut ticks = 0_u64;

    tracing::info!(frames = ?options.frames, dry_run = options.dry_run, "console running");
    while options.frames.map_or(true, |limit| ticks < limit) {
        let interval = Duration::from_millis(console.streamer().interval.get().max(1) as u64);
        let started = Instant::now();

        if console.tick() {
            ticks += 1;
        } else if console.barrier().joining_for() > Some(STALL_LIMIT) {
            tracing::warn!(round = console.barrier().round(), "render round stalled");
            console.cancel_round();
        }
        for event in events.try_iter() {
            tracing::info!(?event, "display link");
        }
        // The preview is only counted here; a UI would draw it.
        previews.try_iter().for_each(drop);

        if last_report.elapsed() >= Duration::from_secs(1) {
            tracing::info!(
                ticks,
                composites = console.composites(),
                written = console.streamer().frames_written(),
                dropped = console.streamer().frames_dropped(),
                "console status"
            );
            last_report = Instant::now();
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    // Let the last round join before reporting.
    let deadline = Instant::now() + Duration::from_secs(1);
    while console.barrier().is_joining() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    if console.cancel_round() {
        tracing::warn!("last render round did not finish");
    }

    tracing::info!(
        ticks,
        composites = console.composites(),
        written = console.streamer().frames_written(),
        "console stopped"
    );

    if let Some(path) = &options.save {
        console.save_settings()?.write(path)?;
        tracing::info!(?path, "settings saved");
    }
    Ok(())
}

/// Feeds a text file of MIDI messages through the controller input. Each
/// non-empty line holds one message as hex bytes, e.g. `B0 07 7F`; lines
/// starting with `#` are skipped.
fn replay_midi(console: &MixConsole, path: &Path) -> led_mixer_core::Result<()> {
    let script = fs::read_to_string(path)?;
    let controller = console.controller();
    controller.device.set(path.display().to_string());
    controller.start()?;

    let sender = controller.sender();
    let mut accepted = 0;
    for (index, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bytes = line
            .split_whitespace()
            .map(|byte| u8::from_str_radix(byte, 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|err| MixerError::msg(format!("line {}: {err}", index + 1)))?;
        if sender.push_midi(SELECTED_DEVICE, &bytes) {
            accepted += 1;
        }
    }
    tracing::info!(?path, accepted, "replayed controller input");
    Ok(())
}

#[cfg(feature = "midi")]
fn open_midi_input(console: &MixConsole, device: &str) -> led_mixer_core::Result<()> {
    use led_mixer_core::controller::midi::MidiPortTransport;

    let controller = console.controller();
    controller.set_transport(Box::new(MidiPortTransport::new()));
    controller.device.set(device.to_string());
    controller.start()
}

#[cfg(not(feature = "midi"))]
fn open_midi_input(_console: &MixConsole, device: &str) -> led_mixer_core::Result<()> {
    Err(MixerError::Device(format!(
        "cannot open {device}: built without the `midi` feature"
    )))
}

fn list_ports() {
    let ports = available_port_names();
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    let rates: Vec<String> = STANDARD_BAUD_RATES.iter().map(u32::to_string).collect();
    println!("baud rates: {}", rates.join(", "));
    list_midi_inputs();
}

#[cfg(feature = "midi")]
fn list_midi_inputs() {
    let inputs = led_mixer_core::controller::midi::midi_input_names();
    if inputs.is_empty() {
        println!("no MIDI inputs found");
    }
    for input in inputs {
        println!("midi: {input}");
    }
}

#[cfg(not(feature = "midi"))]
fn list_midi_inputs() {
    println!("MIDI inputs: not available (built without the `midi` feature)");
}

fn list_parameters() -> led_mixer_core::Result<()> {
    let console = build_console(Box::new(RecordingDevice::new()))?;
    let registry = console.registry();
    let bindable = registry.bindable_names();
    for name in registry.names() {
        let target = registry.lookup(&name)?;
        let range = target
            .control_range()
            .map(|(min, max)| format!("[{min}, {max}]"))
            .unwrap_or_else(|| "-".into());
        let marker = if bindable.contains(&name) { "bindable" } else { "" };
        println!("{name:<20} {:<8} {range:<14} {marker}", target.value_json()?.to_string());
    }
    Ok(())
}

fn write_defaults(output: &Path) -> led_mixer_core::Result<()> {
    let console = build_console(Box::new(RecordingDevice::new()))?;
    console.save_settings()?.write(output)?;
    tracing::info!(?output, "default settings written");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-deck LED display mixer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the console with the built-in pattern decks.
    Run {
        /// Settings file to load on startup.
        #[arg(short, long)]
        settings: Option<PathBuf>,
        /// Serial port of the display; enables sending.
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
        /// Stop after this many render rounds.
        #[arg(short, long)]
        frames: Option<u64>,
        /// Record display output in memory instead of opening a device.
        #[arg(long)]
        dry_run: bool,
        /// MIDI input port to capture controller messages from.
        #[arg(long)]
        midi_device: Option<String>,
        /// Text file of hex MIDI messages to feed through the controller input.
        #[arg(long, conflicts_with = "midi_device")]
        midi_replay: Option<PathBuf>,
        /// Write the settings here on exit.
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// List serial ports, baud rates and MIDI inputs.
    Ports,
    /// Print every registered parameter with its value and range.
    Parameters,
    /// Write a settings file containing the default values.
    Defaults {
        /// Destination of the settings file.
        output: PathBuf,
    },
}
