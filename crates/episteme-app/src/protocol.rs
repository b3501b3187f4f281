// Wire types exchanged with the chat bridge over the gateway.

use serde::{Deserialize, Serialize};

use episteme_core::UserId;

/// A chat message delivered by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub user_id: UserId,
    pub channel_id: String,
    /// `true` for private/direct messages, `false` for public channels.
    pub is_direct: bool,
    pub text: String,
}

impl InboundEvent {
    /// Parse one JSON text frame from the bridge.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// A public channel by id.
    Channel(String),
    /// A user's private/direct channel.
    User(UserId),
}

/// A message for the bridge to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target: Target,
    pub text: String,
}

impl OutboundMessage {
    pub fn channel(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        OutboundMessage {
            target: Target::Channel(channel_id.into()),
            text: text.into(),
        }
    }

    pub fn direct(user: impl Into<String>, text: impl Into<String>) -> Self {
        OutboundMessage {
            target: Target::User(user.into()),
            text: text.into(),
        }
    }
}

/// Split `text` into chunks the chat platform accepts.
///
/// While the remainder exceeds `limit` characters, cut at the last newline
/// at or before the `limit`-th character and drop that newline; when no
/// newline exists in range, cut hard at `limit`. The final remainder is
/// emitted as-is. No chunk is empty unless `text` itself is.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        // Byte offset just past the `limit`-th character.
        let window_end = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(idx, _)| idx);

        // A newline right at the boundary still counts: include one char more.
        let search_end = rest[window_end..]
            .chars()
            .next()
            .filter(|c| *c == '\n')
            .map_or(window_end, |c| window_end + c.len_utf8());

        match rest[..search_end].rfind('\n') {
            // A leading newline would make an empty chunk; just drop it.
            Some(0) => rest = &rest[1..],
            Some(nl) => {
                chunks.push(rest[..nl].to_string());
                rest = &rest[nl + 1..];
            }
            None => {
                chunks.push(rest[..window_end].to_string());
                rest = &rest[window_end..];
            }
        }
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
