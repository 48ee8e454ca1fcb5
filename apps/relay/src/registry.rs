use chrono::{DateTime, Utc};
use dashmap::DashMap;
use signal_proto::{ParticipantRole, ParticipantSummary, ServerEvent};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handle through which the relay reaches one participant's transport
/// connection. Cloneable; sending never blocks.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            tx,
        }
    }

    /// Best-effort delivery; a closed receiver means the connection is
    /// already tearing down and the disconnect path will clean up.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone)]
struct Participant {
    user_id: String,
    role: ParticipantRole,
    handle: ConnectionHandle,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    started_at: DateTime<Utc>,
    participants: Vec<Participant>,
}

/// Snapshot of one participant handed out by registry lookups.
#[derive(Debug, Clone)]
pub struct ParticipantView {
    pub user_id: String,
    pub role: ParticipantRole,
    pub handle: ConnectionHandle,
}

impl ParticipantView {
    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            id: self.user_id.clone(),
            role: self.role,
        }
    }
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            user_id: p.user_id.clone(),
            role: p.role,
            handle: p.handle.clone(),
        }
    }
}

/// In-memory map of active sessions to participants. Owns room
/// membership lifetime exclusively: a session exists iff it has at
/// least one participant.
///
/// Every operation is a single DashMap entry operation, so concurrent
/// mutations of the same session serialize on the shard lock and can
/// never interleave into a corrupted participant set. Cross-session
/// operations need no coordination.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the participant keyed by user id, creating the
    /// session on first join. A rejoin replaces the prior connection
    /// handle rather than duplicating the entry.
    pub fn add_participant(
        &self,
        session_id: &str,
        user_id: &str,
        role: ParticipantRole,
        handle: ConnectionHandle,
    ) {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                started_at: Utc::now(),
                participants: Vec::new(),
            });
        let participant = Participant {
            user_id: user_id.to_string(),
            role,
            handle,
            joined_at: Utc::now(),
        };
        match session
            .participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
        {
            Some(existing) => *existing = participant,
            None => session.participants.push(participant),
        }
    }

    /// Remove the participant; the session is dropped the instant its
    /// last participant leaves. Returns whether an entry was removed.
    ///
    /// The retain and the emptiness-based session drop happen in one
    /// shard-locked critical section, so a join racing the last leave
    /// either lands in the still-live session or creates a fresh one —
    /// never inherits an emptied session and its stale `started_at`.
    pub fn remove_participant(&self, session_id: &str, user_id: &str) -> bool {
        let mut removed = false;
        self.sessions.remove_if_mut(session_id, |_, session| {
            let before = session.participants.len();
            session.participants.retain(|p| p.user_id != user_id);
            removed = session.participants.len() != before;
            session.participants.is_empty()
        });
        removed
    }

    /// All participants in the session except the caller.
    pub fn other_participants(&self, session_id: &str, user_id: &str) -> Vec<ParticipantView> {
        self.sessions
            .get(session_id)
            .map(|session| {
                session
                    .participants
                    .iter()
                    .filter(|p| p.user_id != user_id)
                    .map(ParticipantView::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_participant(&self, session_id: &str, user_id: &str) -> Option<ParticipantView> {
        self.sessions.get(session_id).and_then(|session| {
            session
                .participants
                .iter()
                .find(|p| p.user_id == user_id)
                .map(ParticipantView::from)
        })
    }

    pub fn session_started_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(session_id).map(|s| s.started_at)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn participant_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.participants.len())
            .sum()
    }
}
