//! Completion join for independently rendering decks.
//!
//! Each round waits until every registered participant has reported
//! completion, then fires the joined callback exactly once. Participants
//! notify from whichever thread they finished on; the completion check runs
//! under the barrier's lock and the callback runs after it is released, so
//! the callback may start the next round itself.
//!
//! Every arrival names the round it belongs to. An arrival left over from
//! a cancelled round is ignored, so a round only joins on results rendered
//! for it.
//!
//! There is no timeout: a participant that never arrives keeps the round
//! open until [`RenderBarrier::cancel`] is called.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{MixerError, Result};

/// Handle identifying one registered participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(usize);

/// Outcome of a [`RenderBarrier::notify`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Recorded; other participants are still outstanding.
    Pending { remaining: usize },
    /// This arrival completed the round and fired the callback.
    Completed,
    /// The participant had already arrived this round.
    Duplicate,
    /// No round is in progress, the round has moved on, or the id is
    /// unknown.
    Ignored,
}

type JoinedCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Default)]
struct BarrierState {
    names: Vec<String>,
    arrived: Vec<bool>,
    joining: bool,
    /// Set when a participant registered mid-round; that round can no longer
    /// complete.
    invalidated: bool,
    round: u64,
    started_at: Option<Instant>,
}

impl BarrierState {
    fn remaining(&self) -> usize {
        self.arrived.iter().filter(|arrived| !**arrived).count()
    }
}

#[derive(Default)]
pub struct RenderBarrier {
    state: Mutex<BarrierState>,
    on_joined: Mutex<Option<JoinedCallback>>,
}

impl RenderBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback fired once per completed round with the round
    /// number.
    pub fn on_joined<F>(&self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self.on_joined.lock() = Some(Arc::new(callback));
    }

    pub fn register(&self, name: impl Into<String>) -> ParticipantId {
        let name = name.into();
        let mut state = self.state.lock();
        if state.joining {
            tracing::warn!(participant = %name, "participant registered mid-round; round cannot complete");
            state.invalidated = true;
        }
        state.names.push(name);
        state.arrived.push(false);
        ParticipantId(state.names.len() - 1)
    }

    /// Begins a new round. Overlapping rounds are refused so the joined
    /// callback never sees a mix of stale and fresh results.
    pub fn start(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.joining {
            return Err(MixerError::InvalidOperation(format!(
                "round {} is still joining",
                state.round
            )));
        }
        if state.names.is_empty() {
            return Err(MixerError::InvalidOperation(
                "barrier has no participants".into(),
            ));
        }
        state.arrived.iter_mut().for_each(|arrived| *arrived = false);
        state.joining = true;
        state.invalidated = false;
        state.round += 1;
        state.started_at = Some(Instant::now());
        tracing::debug!(round = state.round, "barrier round started");
        Ok(state.round)
    }

    /// Records that `participant` finished its render for `round`. Repeated
    /// arrivals within a round count once.
    pub fn notify(&self, participant: ParticipantId, round: u64) -> Arrival {
        let (round, callback) = {
            let mut state = self.state.lock();
            if !state.joining {
                return Arrival::Ignored;
            }
            if round != state.round {
                tracing::debug!(
                    participant = participant.0,
                    round,
                    current = state.round,
                    "ignoring arrival from an abandoned round"
                );
                return Arrival::Ignored;
            }
            match state.arrived.get_mut(participant.0) {
                None => return Arrival::Ignored,
                Some(true) => return Arrival::Duplicate,
                Some(arrived) => *arrived = true,
            }

            let remaining = state.remaining();
            if remaining > 0 || state.invalidated {
                return Arrival::Pending { remaining };
            }

            state.joining = false;
            state.started_at = None;
            (state.round, self.on_joined.lock().clone())
        };

        tracing::debug!(round, "barrier joined");
        if let Some(callback) = callback {
            callback(round);
        }
        Arrival::Completed
    }

    /// True between [`RenderBarrier::start`] and completion.
    pub fn is_joining(&self) -> bool {
        self.state.lock().joining
    }

    /// How long the current round has been open.
    pub fn joining_for(&self) -> Option<Duration> {
        self.state.lock().started_at.map(|started| started.elapsed())
    }

    /// Abandons the current round without firing the callback.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if !state.joining {
            return false;
        }
        let missing: Vec<&str> = state
            .names
            .iter()
            .zip(&state.arrived)
            .filter(|(_, arrived)| !**arrived)
            .map(|(name, _)| name.as_str())
            .collect();
        tracing::warn!(round = state.round, ?missing, "barrier round cancelled");
        state.joining = false;
        state.started_at = None;
        true
    }

    pub fn round(&self) -> u64 {
        self.state.lock().round
    }

    pub fn participants(&self) -> Vec<String> {
        self.state.lock().names.clone()
    }
}

impl fmt::Debug for RenderBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderBarrier")
            .field("state", &*self.state.lock())
            .finish()
    }
}
