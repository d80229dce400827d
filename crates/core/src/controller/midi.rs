//! MIDI input ports through `midir`.

use midir::{MidiInput, MidiInputConnection};

use super::{ControllerSender, ControllerTransport, SELECTED_DEVICE};
use crate::{MixerError, Result};

const CLIENT_NAME: &str = "led-mixer";

/// Names of the MIDI input ports currently available.
pub fn midi_input_names() -> Vec<String> {
    let midi_in = match MidiInput::new(CLIENT_NAME) {
        Ok(midi_in) => midi_in,
        Err(err) => {
            tracing::warn!(%err, "failed to enumerate MIDI inputs");
            return Vec::new();
        }
    };
    midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .collect()
}

/// Opens the MIDI input port whose name matches the selected device and
/// feeds its messages to the controller queue.
#[derive(Default)]
pub struct MidiPortTransport {
    connection: Option<MidiInputConnection<()>>,
}

impl MidiPortTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }
}

impl ControllerTransport for MidiPortTransport {
    fn open(&mut self, device: &str, sender: ControllerSender) -> Result<()> {
        self.close();

        let midi_in = MidiInput::new(CLIENT_NAME)
            .map_err(|err| MixerError::Device(format!("failed to create MIDI input: {err}")))?;
        let port = midi_in
            .ports()
            .into_iter()
            .find(|port| midi_in.port_name(port).ok().as_deref() == Some(device))
            .ok_or_else(|| MixerError::Device(format!("MIDI port '{device}' not found")))?;

        let connection = midi_in
            .connect(
                &port,
                "led-mixer-input",
                move |_timestamp_us, data, _| {
                    sender.push_midi(SELECTED_DEVICE, data);
                },
                (),
            )
            .map_err(|err| MixerError::Device(format!("failed to connect to {device}: {err}")))?;

        tracing::info!(%device, "MIDI input opened");
        self.connection = Some(connection);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.close();
            tracing::info!("MIDI input closed");
        }
    }
}

impl Drop for MidiPortTransport {
    fn drop(&mut self) {
        self.close();
    }
}
