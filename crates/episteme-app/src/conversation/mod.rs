// Conversation manager: routes commands and drives per-user sessions.
//
// A user is either idle (no session) or in exactly one of three dialogs:
// predicting on a group, resolving a group, or creating a new group. Public
// commands start dialogs; direct messages feed the open dialog one turn at
// a time. All replies are returned as outbound messages; nothing here
// touches the network.

pub mod render;
pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use episteme_core::error::Result;
use episteme_core::export;
use episteme_core::{
    ForecastError, GroupHandle, GroupRegistry, PredictionGroup, Resolution, ResolveProgress,
    TruthValue, UserId,
};

use crate::command::{self, Command};
use crate::config::Config;
use crate::protocol::{InboundEvent, OutboundMessage};

pub use session::{ConversationSession, ModeKind, SessionMode, SessionSummary};

/// Reply sent when the store fails underneath a command.
pub const GENERIC_FAILURE: &str = "Something went wrong while saving that. Please try again.";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The slice of configuration the conversation layer needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_name: String,
    pub finish_keyword: String,
    pub cancel_keyword: String,
    pub idle_timeout: Option<Duration>,
    pub export_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Settings {
            bot_name: config.bot.name.clone(),
            finish_keyword: config.bot.finish_keyword.clone(),
            cancel_keyword: config.bot.cancel_keyword.clone(),
            idle_timeout: config.sessions.idle_timeout(),
            export_dir: config.results.export_dir.clone(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Reply collection
// ---------------------------------------------------------------------------

/// Outbound messages produced while handling one inbound event.
struct Replies {
    user: UserId,
    messages: Vec<OutboundMessage>,
}

impl Replies {
    fn new(user: &str) -> Self {
        Replies {
            user: user.to_string(),
            messages: Vec::new(),
        }
    }

    fn direct(&mut self, text: impl Into<String>) {
        self.messages
            .push(OutboundMessage::direct(self.user.clone(), text));
    }

    fn channel(&mut self, channel_id: &str, text: impl Into<String>) {
        self.messages.push(OutboundMessage::channel(channel_id, text));
    }

    /// Answer on the channel the event came from.
    fn reply(&mut self, event: &InboundEvent, text: impl Into<String>) {
        if event.is_direct {
            self.direct(text);
        } else {
            self.channel(&event.channel_id, text);
        }
    }
}

/// Whether a session survives the turn it just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOutcome {
    Continue,
    Finished,
}

fn owned_predictions(group: &PredictionGroup, user: &str) -> Vec<(String, Option<f64>)> {
    group
        .predictions_for(user)
        .into_iter()
        .map(|(q, p)| (q.to_string(), p))
        .collect()
}

// ---------------------------------------------------------------------------
// ConversationManager
// ---------------------------------------------------------------------------

pub struct ConversationManager {
    registry: Arc<GroupRegistry>,
    settings: Settings,
    sessions: Mutex<HashMap<UserId, ConversationSession>>,
}

impl ConversationManager {
    pub fn new(registry: Arc<GroupRegistry>, settings: Settings) -> Self {
        ConversationManager {
            registry,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<UserId, ConversationSession>> {
        self.sessions.lock().expect("session map poisoned")
    }

    /// The user's open session, if any.
    pub fn session(&self, user: &str) -> Option<SessionSummary> {
        self.sessions().get(user).map(SessionSummary::from)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// Handle one inbound chat event and return the replies to send.
    ///
    /// Events from one user must be handled serially; different users may
    /// be handled concurrently.
    pub fn handle(&self, event: &InboundEvent) -> Vec<OutboundMessage> {
        let mut out = Replies::new(&event.user_id);

        if event.is_direct {
            let open = self.sessions().remove(&event.user_id);
            match open {
                Some(session) => self.session_turn(session, &event.text, &mut out),
                None => match command::parse_direct(&event.text) {
                    Ok(cmd) => self.route(cmd, event, &mut out),
                    Err(e) => {
                        debug!("Unrecognized direct message from {}: {}", event.user_id, e);
                        out.direct(e.to_string());
                    }
                },
            }
        } else {
            match command::parse_public(&event.text, &self.settings.bot_name) {
                None => {}
                Some(Ok(cmd)) => self.route(cmd, event, &mut out),
                Some(Err(e)) => {
                    debug!("Bad public command from {}: {}", event.user_id, e);
                    out.reply(event, format!("{}: {}", event.user_id, e));
                }
            }
        }

        out.messages
    }

    /// Discard sessions idle for longer than the configured timeout and
    /// notify their users.
    pub fn expire_idle(&self, now: Instant) -> Vec<OutboundMessage> {
        let Some(timeout) = self.settings.idle_timeout else {
            return Vec::new();
        };

        let mut sessions = self.sessions();
        let expired: Vec<UserId> = sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(user, _)| user.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|user| sessions.remove(&user))
            .map(|session| {
                let summary = SessionSummary::from(&session);
                info!("Session of {} expired ({})", session.user, summary);
                OutboundMessage::direct(
                    session.user,
                    format!("You stopped {summary} after a period of inactivity."),
                )
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Command routing
    // -----------------------------------------------------------------------

    fn route(&self, cmd: Command, event: &InboundEvent, out: &mut Replies) {
        let user = event.user_id.as_str();
        let result = match cmd {
            Command::Predict { group } => self.start_predicting(&group, event, out),
            Command::Resolve { group } => self.start_resolving(&group, event, out),
            Command::Create { group } => self.start_creating(&group, event, out),
            Command::Submit { group, question } => self.submit(&group, &question, event, out),
            Command::List => {
                out.reply(event, render::group_list(&self.registry.summaries()));
                Ok(())
            }
            Command::Update {
                group,
                question,
                value,
            } => self.update_prediction(user, &group, &question, &value, out),
            Command::Status { group } => self.status(user, &group, out),
            Command::Help => {
                out.reply(
                    event,
                    render::help(
                        &self.settings.bot_name,
                        &self.settings.finish_keyword,
                        &self.settings.cancel_keyword,
                    ),
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            let text = self.describe_error(user, &e);
            if event.is_direct {
                out.direct(text);
            } else {
                out.channel(&event.channel_id, format!("{user}: {text}"));
            }
        }
    }

    /// Log an error and turn it into reply text.
    fn describe_error(&self, user: &str, e: &ForecastError) -> String {
        if e.is_user_error() {
            debug!("Rejected input from {}: {}", user, e);
            e.to_string()
        } else {
            error!("Command from {} failed: {}", user, e);
            GENERIC_FAILURE.to_string()
        }
    }

    fn ensure_idle(&self, user: &str) -> Result<()> {
        match self.session(user) {
            Some(summary) => Err(ForecastError::SessionInProgress(summary.to_string())),
            None => Ok(()),
        }
    }

    fn insert_session(&self, session: ConversationSession) {
        self.sessions().insert(session.user.clone(), session);
    }

    fn start_predicting(&self, group: &str, event: &InboundEvent, out: &mut Replies) -> Result<()> {
        let user = event.user_id.as_str();
        self.ensure_idle(user)?;
        let handle = self.registry.get(group)?;
        let question = self.registry.read(&handle, |g| {
            if g.is_resolved() {
                return Err(ForecastError::AlreadyResolved(group.to_string()));
            }
            g.next_unanswered_question(user)
                .map(str::to_string)
                .ok_or_else(|| ForecastError::NoUnansweredQuestions(group.to_string()))
        })?;

        out.direct(format!(
            "Predicting on `{group}`. Send `{}` to stop at any time.\n\n{}",
            self.settings.cancel_keyword,
            render::prediction_prompt(&question)
        ));
        self.insert_session(ConversationSession::new(
            user,
            &event.channel_id,
            SessionMode::Predicting {
                group: handle,
                group_name: group.to_string(),
                current_question: question,
            },
        ));
        info!("{} started predicting on `{}`", user, group);
        Ok(())
    }

    fn start_resolving(&self, group: &str, event: &InboundEvent, out: &mut Replies) -> Result<()> {
        let user = event.user_id.as_str();
        self.ensure_idle(user)?;
        let handle = self.registry.get(group)?;
        let question = self.registry.read(&handle, |g| {
            if g.is_resolved() {
                return Err(ForecastError::AlreadyResolved(group.to_string()));
            }
            g.questions()
                .first()
                .cloned()
                .ok_or_else(|| ForecastError::EmptyGroup(group.to_string()))
        })?;

        out.direct(format!(
            "Resolving `{group}`. Send `{}` to stop without resolving.\n\n{}",
            self.settings.cancel_keyword,
            render::truth_prompt(&question)
        ));
        self.insert_session(ConversationSession::new(
            user,
            &event.channel_id,
            SessionMode::Resolving {
                group: handle,
                group_name: group.to_string(),
                current_question: question,
                draft_truths: BTreeMap::new(),
            },
        ));
        info!("{} started resolving `{}`", user, group);
        Ok(())
    }

    fn start_creating(&self, group: &str, event: &InboundEvent, out: &mut Replies) -> Result<()> {
        let user = event.user_id.as_str();
        self.ensure_idle(user)?;
        PredictionGroup::validate_name(group)?;
        if self.registry.is_name_taken(group)? {
            return Err(ForecastError::GroupExists(group.to_string()));
        }

        out.direct(format!(
            "Creating `{group}`. Send one question per message, then `{}` to publish the group \
             (or `{}` to throw it away).",
            self.settings.finish_keyword, self.settings.cancel_keyword
        ));
        self.insert_session(ConversationSession::new(
            user,
            &event.channel_id,
            SessionMode::Creating {
                group: PredictionGroup::new(group),
            },
        ));
        info!("{} started creating `{}`", user, group);
        Ok(())
    }

    fn submit(&self, group: &str, question: &str, event: &InboundEvent, out: &mut Replies) -> Result<()> {
        let question = command::normalize_question(question);
        self.registry.add_question(group, &question)?;
        out.reply(event, format!("Added to `{group}`: {question}"));
        Ok(())
    }

    fn update_prediction(
        &self,
        user: &str,
        group: &str,
        question: &str,
        value: &str,
        out: &mut Replies,
    ) -> Result<()> {
        let probability = command::parse_probability(value)?;
        let handle = self.registry.get(group)?;
        let question = command::normalize_question(question);
        let entries = self.registry.update(&handle, |g| {
            g.set_prediction(user, &question, probability)?;
            Ok(owned_predictions(g, user))
        })?;
        info!("{} updated `{}` / {} to {}", user, group, question, probability);
        out.direct(render::overview(group, &entries));
        Ok(())
    }

    fn status(&self, user: &str, group: &str, out: &mut Replies) -> Result<()> {
        let handle = self.registry.get(group)?;
        let entries = self.registry.read(&handle, |g| owned_predictions(g, user));
        out.direct(render::overview(group, &entries));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session turns
    // -----------------------------------------------------------------------

    fn session_turn(&self, mut session: ConversationSession, text: &str, out: &mut Replies) {
        session.touch();
        let text = text.trim();

        if text == self.settings.cancel_keyword {
            let summary = SessionSummary::from(&session);
            info!("{} cancelled their session ({})", session.user, summary);
            out.direct(format!("You stopped {summary}."));
            return;
        }

        // `update` works mid-session without disturbing it, except while
        // authoring, where every line is a question.
        if session.mode.kind() != ModeKind::Creating {
            if let Some(Command::Update {
                group,
                question,
                value,
            }) = command::parse_update(text)
            {
                if let Err(e) = self.update_prediction(&session.user, &group, &question, &value, out) {
                    out.direct(self.describe_error(&session.user, &e));
                }
                self.insert_session(session);
                return;
            }
        }

        let user = session.user.as_str();
        let channel = session.public_channel.as_str();
        let outcome = match &mut session.mode {
            SessionMode::Predicting {
                group,
                group_name,
                current_question,
            } => self.predicting_turn(user, channel, group, group_name, current_question, text, out),
            SessionMode::Resolving {
                group,
                group_name,
                current_question,
                draft_truths,
            } => self.resolving_turn(
                channel,
                group,
                group_name,
                current_question,
                draft_truths,
                text,
                out,
            ),
            SessionMode::Creating { group } => self.creating_turn(user, channel, group, text, out),
        };

        match outcome {
            TurnOutcome::Continue => self.insert_session(session),
            TurnOutcome::Finished => debug!("Session of {} finished", session.user),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn predicting_turn(
        &self,
        user: &str,
        channel: &str,
        group: &GroupHandle,
        group_name: &str,
        current_question: &mut String,
        text: &str,
        out: &mut Replies,
    ) -> TurnOutcome {
        let probability = match command::parse_probability(text) {
            Ok(p) => p,
            Err(e) => {
                debug!("Rejected prediction from {}: {}", user, e);
                out.direct(format!("{e}\n\n{}", render::prediction_prompt(current_question)));
                return TurnOutcome::Continue;
            }
        };

        let question = current_question.clone();
        let result = self.registry.update(group, |g| {
            g.set_prediction(user, &question, probability)?;
            Ok((
                owned_predictions(g, user),
                g.next_unanswered_question(user).map(str::to_string),
            ))
        });

        match result {
            Ok((entries, next)) => {
                info!("{} predicted {} on `{}` / {}", user, probability, group_name, question);
                let overview = render::overview(group_name, &entries);
                match next {
                    Some(next) => {
                        out.direct(format!("{overview}\n\n{}", render::prediction_prompt(&next)));
                        *current_question = next;
                        TurnOutcome::Continue
                    }
                    None => {
                        out.direct(format!("{overview}\n\nThat was the last question. Thanks!"));
                        out.channel(
                            channel,
                            format!("{user} has completed their predictions for `{group_name}`."),
                        );
                        info!("{} completed `{}`", user, group_name);
                        TurnOutcome::Finished
                    }
                }
            }
            Err(e @ ForecastError::AlreadyResolved(_)) => {
                out.direct(e.to_string());
                TurnOutcome::Finished
            }
            Err(e) => {
                let text = self.describe_error(user, &e);
                out.direct(format!("{text}\n\n{}", render::prediction_prompt(current_question)));
                TurnOutcome::Continue
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resolving_turn(
        &self,
        channel: &str,
        group: &GroupHandle,
        group_name: &str,
        current_question: &mut String,
        draft_truths: &mut BTreeMap<String, TruthValue>,
        text: &str,
        out: &mut Replies,
    ) -> TurnOutcome {
        let truth: TruthValue = match text.parse() {
            Ok(t) => t,
            Err(e) => {
                debug!("Rejected truth value from {}: {}", out.user, e);
                out.direct(format!("{e}\n\n{}", render::truth_prompt(current_question)));
                return TurnOutcome::Continue;
            }
        };

        let mut drafted = draft_truths.clone();
        drafted.insert(current_question.clone(), truth);

        match self.registry.resolve_drafted(group, &drafted) {
            Ok(ResolveProgress::Pending { next_question }) => {
                *draft_truths = drafted;
                out.direct(render::truth_prompt(&next_question));
                *current_question = next_question;
                TurnOutcome::Continue
            }
            Ok(ResolveProgress::Resolved { group, resolution }) => {
                info!("{} resolved `{}`", out.user, group_name);
                self.export_scoreboard(&group, &resolution);
                out.direct(format!(
                    "`{group_name}` is resolved. The results are posted in the channel."
                ));
                out.channel(channel, render::results(group_name, &resolution));
                TurnOutcome::Finished
            }
            Err(e @ ForecastError::AlreadyResolved(_)) => {
                out.direct(e.to_string());
                TurnOutcome::Finished
            }
            Err(e) => {
                let text = self.describe_error(&out.user.clone(), &e);
                out.direct(format!("{text}\n\n{}", render::truth_prompt(current_question)));
                TurnOutcome::Continue
            }
        }
    }

    fn creating_turn(
        &self,
        user: &str,
        channel: &str,
        group: &mut PredictionGroup,
        text: &str,
        out: &mut Replies,
    ) -> TurnOutcome {
        let finish = self.settings.finish_keyword.as_str();

        if text == finish {
            if group.questions().is_empty() {
                out.direct(format!(
                    "{}. Send at least one question before `{finish}`.",
                    ForecastError::EmptyGroup(group.name().to_string())
                ));
                return TurnOutcome::Continue;
            }
            return match self.registry.publish(group.clone()) {
                Ok(_) => {
                    let name = group.name();
                    let count = group.questions().len();
                    out.direct(format!("`{name}` is now open for predictions."));
                    out.channel(
                        channel,
                        format!(
                            "{user} created the prediction group `{name}` with {count} question{}. \
                             Say `{} predict {name}` to take part.",
                            if count == 1 { "" } else { "s" },
                            self.settings.bot_name
                        ),
                    );
                    TurnOutcome::Finished
                }
                Err(e @ ForecastError::GroupExists(_)) => {
                    out.direct(format!("{e}. Your draft was discarded."));
                    TurnOutcome::Finished
                }
                Err(e) => {
                    out.direct(self.describe_error(user, &e));
                    TurnOutcome::Continue
                }
            };
        }

        let question = command::normalize_question(text);
        if question.is_empty() {
            out.direct(format!("Send a question, or `{finish}` when you are done."));
            return TurnOutcome::Continue;
        }

        match group.add_question(&question) {
            Ok(()) => {
                debug!("{} drafted question {} for `{}`", user, group.questions().len(), group.name());
                out.direct(format!(
                    "Added question {}: {question}\nSend the next question, or `{finish}` to publish.",
                    group.questions().len()
                ));
            }
            Err(e) => {
                debug!("Rejected draft question from {}: {}", user, e);
                out.direct(format!("{e}\nSend a different question, or `{finish}` to publish."));
            }
        }
        TurnOutcome::Continue
    }

    fn export_scoreboard(&self, group: &PredictionGroup, resolution: &Resolution) {
        let Some(dir) = &self.settings.export_dir else {
            return;
        };
        match export::write_scoreboard(dir, group.name(), resolution) {
            Ok(path) => info!("Scoreboard for `{}` written to {}", group.name(), path.display()),
            Err(e) => warn!("Failed to export scoreboard for `{}`: {:#}", group.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Target;
    use episteme_core::Store;

    fn manager() -> ConversationManager {
        let registry = GroupRegistry::load(Store::open(":memory:").unwrap()).unwrap();
        ConversationManager::new(Arc::new(registry), Settings::default())
    }

    fn public(user: &str, text: &str) -> InboundEvent {
        InboundEvent {
            user_id: user.into(),
            channel_id: "general".into(),
            is_direct: false,
            text: text.into(),
        }
    }

    fn direct(user: &str, text: &str) -> InboundEvent {
        InboundEvent {
            user_id: user.into(),
            channel_id: format!("dm-{user}"),
            is_direct: true,
            text: text.into(),
        }
    }

    fn texts(messages: &[OutboundMessage]) -> String {
        messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    #[test]
    fn unaddressed_chatter_is_ignored() {
        let m = manager();
        assert!(m.handle(&public("alice", "hello everyone")).is_empty());
    }

    #[test]
    fn creating_rejects_duplicates_without_advancing() {
        let m = manager();
        m.handle(&public("alice", "episteme create G"));
        m.handle(&direct("alice", "Q1"));

        let replies = m.handle(&direct("alice", "Q1"));
        assert!(texts(&replies).contains("already exists"));

        let session = m.session("alice").unwrap();
        assert_eq!(session.mode, ModeKind::Creating);
        let replies = m.handle(&direct("alice", "Q2"));
        assert!(texts(&replies).contains("Added question 2: Q2"));
    }

    #[test]
    fn finishing_empty_draft_is_refused() {
        let m = manager();
        m.handle(&public("alice", "episteme create G"));
        let replies = m.handle(&direct("alice", "finished"));
        assert!(texts(&replies).contains("has no questions"));
        assert!(m.session("alice").is_some());
    }

    #[test]
    fn cancel_discards_draft_group() {
        let m = manager();
        m.handle(&public("alice", "episteme create G"));
        m.handle(&direct("alice", "Q1"));
        let replies = m.handle(&direct("alice", "cancel"));
        assert!(texts(&replies).contains("You stopped creating `G`"));
        assert!(m.session("alice").is_none());
        assert!(matches!(m.registry().get("G"), Err(ForecastError::UnknownGroup(_))));
    }

    #[test]
    fn trigger_while_in_session_is_rejected() {
        let m = manager();
        m.handle(&public("alice", "episteme create G"));
        let replies = m.handle(&public("alice", "episteme create H"));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].target, Target::Channel("general".into()));
        assert!(replies[0].text.contains("already creating `G`"));
    }

    #[test]
    fn predicting_unknown_group_fails_and_stays_idle() {
        let m = manager();
        let replies = m.handle(&public("alice", "episteme predict nope"));
        assert!(texts(&replies).contains("no open prediction group named `nope`"));
        assert!(m.session("alice").is_none());
    }

    #[test]
    fn sessions_expire_after_idle_timeout() {
        let m = manager();
        m.handle(&public("alice", "episteme create G"));

        assert!(m.expire_idle(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(3600);
        let notices = m.expire_idle(later);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].target, Target::User("alice".into()));
        assert!(notices[0].text.contains("inactivity"));
        assert_eq!(m.active_sessions(), 0);
    }

    #[test]
    fn expiry_disabled_without_timeout() {
        let registry = GroupRegistry::load(Store::open(":memory:").unwrap()).unwrap();
        let settings = Settings {
            idle_timeout: None,
            ..Settings::default()
        };
        let m = ConversationManager::new(Arc::new(registry), settings);
        m.handle(&public("alice", "episteme create G"));
        assert!(m
            .expire_idle(Instant::now() + Duration::from_secs(86_400))
            .is_empty());
        assert_eq!(m.active_sessions(), 1);
    }

    #[test]
    fn direct_message_outside_session_gets_hint() {
        let m = manager();
        let replies = m.handle(&direct("alice", "70"));
        assert_eq!(replies[0].target, Target::User("alice".into()));
        assert!(replies[0].text.contains("don't know the command `70`"));
    }
}
