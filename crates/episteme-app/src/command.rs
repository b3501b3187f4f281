// Command grammar: turns raw chat text into typed commands.
//
// Public messages must address the bot by name first; direct messages
// outside a session are parsed without an address. Tokens are
// case-sensitive.

use thiserror::Error;

use episteme_core::ForecastError;

/// Everything a user can ask of the bot outside a session turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `predict <group>` (public): start answering a group's questions.
    Predict { group: String },
    /// `resolve <group>` (public): start entering a group's truths.
    Resolve { group: String },
    /// `create <group>` (public): start authoring a new group.
    Create { group: String },
    /// `submit <group> <question…>` (public): add one question to an open group.
    Submit { group: String, question: String },
    /// `list` (public): show the active groups.
    List,
    /// `update <group> <question…> <value>` (direct): change one prediction.
    Update {
        group: String,
        question: String,
        value: String,
    },
    /// `status <group>` (direct): show your predictions.
    Status { group: String },
    /// `help` (anywhere).
    Help,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("I don't know the command `{0}`; try `help`")]
    Unrecognized(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

const PREDICT_USAGE: &str = "predict <group>";
const RESOLVE_USAGE: &str = "resolve <group>";
const CREATE_USAGE: &str = "create <group>";
const SUBMIT_USAGE: &str = "submit <group> <question>";
const UPDATE_USAGE: &str = "update <group> <question> <percentage 0-100>";
const STATUS_USAGE: &str = "status <group>";

/// Strip the bot address from a public message.
///
/// Returns the remaining text when the first word is `name`, `@name`,
/// `!name` or `<@name>` (optionally followed by `:` or `,`), otherwise `None`.
pub fn strip_address<'a>(text: &'a str, bot_name: &str) -> Option<&'a str> {
    let trimmed = text.trim_start();
    let (first, rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    };
    let word = first.trim_end_matches([':', ',']);
    let word = word
        .strip_prefix("<@")
        .and_then(|w| w.strip_suffix('>'))
        .or_else(|| word.strip_prefix('@'))
        .or_else(|| word.strip_prefix('!'))
        .unwrap_or(word);
    (word == bot_name).then_some(rest.trim())
}

/// Parse a public-channel message. `None` when the bot was not addressed.
pub fn parse_public(text: &str, bot_name: &str) -> Option<Result<Command, CommandError>> {
    let body = strip_address(text, bot_name)?;
    let tokens: Vec<&str> = body.split_whitespace().collect();
    let Some((&head, args)) = tokens.split_first() else {
        return Some(Ok(Command::Help));
    };

    Some(match head {
        "predict" => single_group(args, PREDICT_USAGE).map(|group| Command::Predict { group }),
        "resolve" => single_group(args, RESOLVE_USAGE).map(|group| Command::Resolve { group }),
        "create" => single_group(args, CREATE_USAGE).map(|group| Command::Create { group }),
        "submit" => match args {
            [group, question @ ..] if !question.is_empty() => Ok(Command::Submit {
                group: group.to_string(),
                question: question.join(" "),
            }),
            _ => Err(CommandError::Usage(SUBMIT_USAGE)),
        },
        "list" => Ok(Command::List),
        "help" => Ok(Command::Help),
        other => Err(CommandError::Unrecognized(other.to_string())),
    })
}

/// Parse a direct message sent outside of any session.
pub fn parse_direct(text: &str) -> Result<Command, CommandError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some((&head, args)) = tokens.split_first() else {
        return Ok(Command::Help);
    };

    match head {
        "update" => match args {
            [group, question @ .., value] if !question.is_empty() => Ok(Command::Update {
                group: group.to_string(),
                question: question.join(" "),
                value: value.to_string(),
            }),
            _ => Err(CommandError::Usage(UPDATE_USAGE)),
        },
        "status" => single_group(args, STATUS_USAGE).map(|group| Command::Status { group }),
        "help" => Ok(Command::Help),
        other => Err(CommandError::Unrecognized(other.to_string())),
    }
}

/// Recognize an `update` command inside a predicting or resolving session.
pub fn parse_update(text: &str) -> Option<Command> {
    match parse_direct(text) {
        Ok(cmd @ Command::Update { .. }) => Some(cmd),
        _ => None,
    }
}

fn single_group(args: &[&str], usage: &'static str) -> Result<String, CommandError> {
    match args {
        [group] => Ok(group.to_string()),
        _ => Err(CommandError::Usage(usage)),
    }
}

// ---------------------------------------------------------------------------
// Turn input
// ---------------------------------------------------------------------------

/// Collapse runs of whitespace so questions typed in different places match.
pub fn normalize_question(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a percentage (`70`, `12.5`, `70%`) into a probability in `[0, 1]`.
pub fn parse_probability(text: &str) -> Result<f64, ForecastError> {
    let trimmed = text.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim_end();
    let percent: f64 = number
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| ForecastError::InvalidNumberFormat(trimmed.to_string()))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(ForecastError::OutOfRangeProbability(percent));
    }
    Ok(percent / 100.0)
}
