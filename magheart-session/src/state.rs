//! Cached view of the shared meeting state.
//!
//! [`SessionState`] is owned by the client event loop and is the only place
//! inbound events are applied. Consumers never see it directly; they get
//! [`SessionSnapshot`] copies through the fan-out.

use std::collections::{BTreeMap, VecDeque};

use crate::protocol::{
    Envelope, HeartRateSample, InboundEvent, JsonObject, MeetingPhase, ParticipantView,
    ParticipantsState, Role,
};

/// Who we are in which meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub meeting_id: String,
    pub user_id: String,
    pub role: Role,
    pub avatar_seed: String,
    /// Phase announced in `join_meeting` until the server tells us the real one.
    pub initial_phase: MeetingPhase,
}

impl SessionIdentity {
    pub fn new(
        meeting_id: impl Into<String>,
        user_id: impl Into<String>,
        role: Role,
        avatar_seed: impl Into<String>,
    ) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            user_id: user_id.into(),
            role,
            avatar_seed: avatar_seed.into(),
            initial_phase: MeetingPhase::Lobby,
        }
    }

    pub fn with_initial_phase(mut self, phase: MeetingPhase) -> Self {
        self.initial_phase = phase;
        self
    }

    /// Both meeting and user are set.
    pub fn is_complete(&self) -> bool {
        !self.meeting_id.is_empty() && !self.user_id.is_empty()
    }

    /// Same endpoint: meeting and user match.
    pub fn same_meeting(&self, other: &SessionIdentity) -> bool {
        self.meeting_id == other.meeting_id && self.user_id == other.user_id
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Immutable copy of the session state handed to subscribers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// Increases by one with every publish.
    pub revision: u64,
    pub connection: ConnectionState,
    pub is_connected: bool,
    pub participants: BTreeMap<String, ParticipantView>,
    pub heart_rates: BTreeMap<String, HeartRateSample>,
    pub meeting_phase: MeetingPhase,
    pub shared_context: JsonObject,
    /// Inbound log, oldest first.
    pub messages: Vec<Envelope>,
}

/// Mutable session state, owned by the event loop.
#[derive(Debug, Default)]
pub struct SessionState {
    connection: ConnectionState,
    participants: BTreeMap<String, ParticipantView>,
    heart_rates: BTreeMap<String, HeartRateSample>,
    meeting_phase: MeetingPhase,
    /// Set once the phase came from the server or a sent `update_phase`.
    phase_known: bool,
    shared_context: JsonObject,
    messages: VecDeque<Envelope>,
    message_log_capacity: Option<usize>,
    revision: u64,
}

impl SessionState {
    /// `message_log_capacity` of `None` keeps every inbound message.
    pub fn new(message_log_capacity: Option<usize>) -> Self {
        Self {
            message_log_capacity,
            ..Self::default()
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionState) {
        self.connection = connection;
    }

    pub fn meeting_phase(&self) -> MeetingPhase {
        self.meeting_phase
    }

    /// Phase to announce in `join_meeting` and heartbeats.
    pub fn announced_phase(&self, fallback: MeetingPhase) -> MeetingPhase {
        if self.phase_known {
            self.meeting_phase
        } else {
            fallback
        }
    }

    /// Local phase change after a sent `update_phase`.
    pub fn set_phase(&mut self, phase: MeetingPhase) {
        self.meeting_phase = phase;
        self.phase_known = true;
    }

    pub fn participants(&self) -> &BTreeMap<String, ParticipantView> {
        &self.participants
    }

    pub fn heart_rates(&self) -> &BTreeMap<String, HeartRateSample> {
        &self.heart_rates
    }

    pub fn shared_context(&self) -> &JsonObject {
        &self.shared_context
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Apply one inbound event.
    pub fn apply(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::ParticipantsState(resync) => self.apply_resync(resync),

            InboundEvent::HeartRateUpdate(sample) => {
                if sample.user_id.is_empty() {
                    log::debug!("Ignoring heart rate update without userId");
                } else {
                    self.heart_rates.insert(sample.user_id.clone(), sample);
                }
            }

            InboundEvent::PhaseChanged { phase, envelope } => {
                if let Some(phase) = phase {
                    self.set_phase(phase);
                }
                self.log_message(envelope);
            }

            InboundEvent::SharedContextUpdated {
                shared_context,
                envelope,
            } => {
                if let Some(ctx) = shared_context {
                    self.shared_context = ctx;
                }
                self.log_message(envelope);
            }

            InboundEvent::Other(envelope) => self.log_message(envelope),
        }
    }

    /// Roster is replaced; heart rates are merged, never pruned.
    fn apply_resync(&mut self, resync: ParticipantsState) {
        let mut participants = resync.participants.unwrap_or_default();

        for (key, participant) in participants.iter_mut() {
            if participant.user_id.is_empty() {
                participant.user_id = key.clone();
            }
            if let Some(sample) = &participant.heart_rate {
                let mut sample = sample.clone();
                if sample.user_id.is_empty() {
                    sample.user_id = participant.user_id.clone();
                }
                self.heart_rates.insert(participant.user_id.clone(), sample);
            }
        }
        self.participants = participants;

        if let Some(phase) = resync.phase {
            self.set_phase(phase);
        }
        if let Some(ctx) = resync.shared_context {
            self.shared_context = ctx;
        }
    }

    fn log_message(&mut self, envelope: Envelope) {
        self.messages.push_back(envelope);
        if let Some(capacity) = self.message_log_capacity {
            while self.messages.len() > capacity {
                self.messages.pop_front();
            }
        }
    }

    /// Back to the freshly constructed state. The revision keeps counting.
    pub fn reset(&mut self) {
        *self = Self {
            message_log_capacity: self.message_log_capacity,
            revision: self.revision,
            ..Self::default()
        };
    }

    /// Full copy for publishing; bumps the revision.
    pub fn snapshot(&mut self) -> SessionSnapshot {
        self.revision += 1;
        SessionSnapshot {
            revision: self.revision,
            connection: self.connection,
            is_connected: self.connection == ConnectionState::Connected,
            participants: self.participants.clone(),
            heart_rates: self.heart_rates.clone(),
            meeting_phase: self.meeting_phase,
            shared_context: self.shared_context.clone(),
            messages: self.messages.iter().cloned().collect(),
        }
    }
}
