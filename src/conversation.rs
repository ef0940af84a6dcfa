//! Session-scoped conversation transcript.
//!
//! The transcript is append-only: each user query and each bot reply is
//! pushed as a turn and never rewritten.

use chrono::{DateTime, Utc};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Bot,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::User => write!(f, "You"),
            Speaker::Bot => write!(f, "Bot"),
        }
    }
}

/// A single turn in the conversation.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only transcript for one chat session.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<ConversationTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Speaker::User, text.into());
    }

    pub fn push_bot(&mut self, text: impl Into<String>) {
        self.push(Speaker::Bot, text.into());
    }

    fn push(&mut self, speaker: Speaker, text: String) {
        self.turns.push(ConversationTurn {
            speaker,
            text,
            timestamp: Utc::now(),
        });
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
