// Per-user conversation sessions.

use std::collections::BTreeMap;
use std::fmt;

use tokio::time::Instant;

use episteme_core::{GroupHandle, PredictionGroup, TruthValue, UserId};

/// Which multi-turn dialog a user is in.
pub enum SessionMode {
    /// Answering an open group's questions one at a time.
    Predicting {
        group: GroupHandle,
        group_name: String,
        current_question: String,
    },
    /// Entering the truth value of every question.
    Resolving {
        group: GroupHandle,
        group_name: String,
        current_question: String,
        draft_truths: BTreeMap<String, TruthValue>,
    },
    /// Authoring a new group, held here until it is published.
    Creating { group: PredictionGroup },
}

/// Mode tag without the payload, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Predicting,
    Resolving,
    Creating,
}

impl SessionMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            SessionMode::Predicting { .. } => ModeKind::Predicting,
            SessionMode::Resolving { .. } => ModeKind::Resolving,
            SessionMode::Creating { .. } => ModeKind::Creating,
        }
    }

    pub fn group_name(&self) -> &str {
        match self {
            SessionMode::Predicting { group_name, .. } | SessionMode::Resolving { group_name, .. } => {
                group_name.as_str()
            }
            SessionMode::Creating { group } => group.name(),
        }
    }

    pub fn current_question(&self) -> Option<&str> {
        match self {
            SessionMode::Predicting {
                current_question, ..
            }
            | SessionMode::Resolving {
                current_question, ..
            } => Some(current_question.as_str()),
            SessionMode::Creating { .. } => None,
        }
    }
}

/// One user's open dialog with the bot.
pub struct ConversationSession {
    pub user: UserId,
    /// Public channel the session was started from; announcements go here.
    pub public_channel: String,
    pub mode: SessionMode,
    pub last_activity: Instant,
}

impl ConversationSession {
    pub fn new(user: &str, public_channel: &str, mode: SessionMode) -> Self {
        ConversationSession {
            user: user.to_string(),
            public_channel: public_channel.to_string(),
            mode,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Read-only view of a session, for callers outside the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub mode: ModeKind,
    pub group: String,
    pub current_question: Option<String>,
}

impl From<&ConversationSession> for SessionSummary {
    fn from(session: &ConversationSession) -> Self {
        SessionSummary {
            mode: session.mode.kind(),
            group: session.mode.group_name().to_string(),
            current_question: session.mode.current_question().map(str::to_string),
        }
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.mode {
            ModeKind::Predicting => "predicting on",
            ModeKind::Resolving => "resolving",
            ModeKind::Creating => "creating",
        };
        write!(f, "{verb} `{}`", self.group)
    }
}
