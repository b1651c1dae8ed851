use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(ProfileId);
id_newtype!(SessionId);
id_newtype!(MatchupId);
id_newtype!(MessageId);

/// Opaque bearer token identifying an authenticated actor. Never logged;
/// only the auth middleware reads the inner value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque pagination resume-point for a message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_id: Option<i64>,
}

/// A pending login request awaiting out-of-band confirmation. `confirmed`
/// flips when the poll first resolves a profile for the session's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub description: String,
    pub confirmed: bool,
}

/// A directed sender -> recipient pairing that owns one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matchup {
    pub id: MatchupId,
    pub sender_id: ProfileId,
    pub recipient_id: ProfileId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub matchup_id: MatchupId,
    pub sender_id: ProfileId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Render order: timestamp ascending, id as the stable tie-break.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }
}

/// One row of the matchup listing: the pairing plus a one-message preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchupSummary {
    pub matchup: Matchup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}
