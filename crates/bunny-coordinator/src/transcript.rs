//! The chat transcript.

use std::fmt;

use bunny_client::{ChatMessage, Role};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Identity of a turn. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Normal,
    /// A visible failure notice. Never sent back to the model.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub kind: TurnKind,
}

impl Turn {
    pub fn is_error(&self) -> bool {
        self.kind == TurnKind::Error
    }
}

/// Change notifications for transcript observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// A turn was added at the end.
    Pushed(Turn),
    /// Text was appended to a turn.
    Delta { id: TurnId, text: String },
    /// A turn was swapped for a fresh one in the same position.
    Replaced { old: TurnId, turn: Turn },
    /// A turn's content or kind changed in place.
    Updated(Turn),
    /// A turn was taken out of the transcript.
    Removed(TurnId),
}

/// Ordered list of turns with change notifications.
#[derive(Debug)]
pub struct Transcript {
    turns: Vec<Turn>,
    next_id: u64,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            turns: Vec::new(),
            next_id: 0,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    fn allocate(&mut self) -> TurnId {
        let id = TurnId(self.next_id);
        self.next_id += 1;
        id
    }

    fn emit(&self, event: TranscriptEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Add a normal turn.
    pub fn push(&mut self, role: Role, content: impl Into<String>) -> TurnId {
        self.push_turn(role, content.into(), TurnKind::Normal)
    }

    /// Add an assistant error turn.
    pub fn push_error(&mut self, message: impl Into<String>) -> TurnId {
        self.push_turn(Role::Assistant, message.into(), TurnKind::Error)
    }

    fn push_turn(&mut self, role: Role, content: String, kind: TurnKind) -> TurnId {
        let turn = Turn {
            id: self.allocate(),
            role,
            content,
            kind,
        };
        let id = turn.id;
        self.turns.push(turn.clone());
        self.emit(TranscriptEvent::Pushed(turn));
        id
    }

    /// Append text to a turn. Returns `false` if the turn no longer exists.
    pub fn append_to(&mut self, id: TurnId, text: &str) -> bool {
        let Some(turn) = self.turns.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        turn.content.push_str(text);
        self.emit(TranscriptEvent::Delta {
            id,
            text: text.to_string(),
        });
        true
    }

    /// Swap a turn for an empty assistant placeholder under a new id.
    pub fn replace(&mut self, id: TurnId) -> Option<TurnId> {
        let index = self.turns.iter().position(|t| t.id == id)?;
        let turn = Turn {
            id: self.allocate(),
            role: Role::Assistant,
            content: String::new(),
            kind: TurnKind::Normal,
        };
        let new_id = turn.id;
        self.turns[index] = turn.clone();
        self.emit(TranscriptEvent::Replaced { old: id, turn });
        Some(new_id)
    }

    /// Report a failure on the session's target turn.
    ///
    /// An empty placeholder becomes the error turn; otherwise a new error turn
    /// is added after whatever text was already produced.
    pub fn fail(&mut self, target: TurnId, message: impl Into<String>) -> TurnId {
        let message = message.into();
        if let Some(turn) = self
            .turns
            .iter_mut()
            .find(|t| t.id == target && t.content.is_empty())
        {
            turn.content = message;
            turn.kind = TurnKind::Error;
            let turn = turn.clone();
            self.emit(TranscriptEvent::Updated(turn));
            return target;
        }
        self.push_error(message)
    }

    /// Index of the most recent user turn.
    pub fn last_user_index(&self) -> Option<usize> {
        self.turns.iter().rposition(|t| t.role == Role::User)
    }

    /// Reset the reply to the user turn at `index` to one empty placeholder.
    ///
    /// The first assistant turn after `index` is replaced and every later
    /// assistant turn up to the next user turn is removed. With no reply yet,
    /// a placeholder is inserted right after `index`.
    pub fn reset_reply(&mut self, index: usize) -> TurnId {
        let start = (index + 1).min(self.turns.len());
        let end = self.turns[start..]
            .iter()
            .position(|t| t.role != Role::Assistant)
            .map_or(self.turns.len(), |offset| start + offset);

        if start == end {
            let turn = Turn {
                id: self.allocate(),
                role: Role::Assistant,
                content: String::new(),
                kind: TurnKind::Normal,
            };
            let id = turn.id;
            self.turns.insert(start, turn.clone());
            self.emit(TranscriptEvent::Pushed(turn));
            return id;
        }

        let stale: Vec<TurnId> = self.turns.drain(start + 1..end).map(|t| t.id).collect();
        for id in stale {
            self.emit(TranscriptEvent::Removed(id));
        }
        let first = self.turns[start].id;
        // The turn exists, so replace always succeeds.
        self.replace(first).unwrap_or(first)
    }

    /// Messages to replay to the model for turns `..end`.
    ///
    /// The system prompt comes first when non-empty. Error turns and empty
    /// turns are skipped.
    pub fn messages(&self, end: usize, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::new(Role::System, system_prompt));
        }
        messages.extend(
            self.turns[..end.min(self.turns.len())]
                .iter()
                .filter(|t| t.kind == TurnKind::Normal && !t.content.is_empty())
                .map(|t| ChatMessage::new(t.role, t.content.clone())),
        );
        messages
    }
}
