use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use shared::domain::{
    Cursor, Matchup, MatchupId, MatchupSummary, MessageId, Profile, ProfileId, SessionId,
};
use shared::graphql::{GraphqlRequest, GraphqlResponse, MessagePage};

use crate::error::TransportError;
use crate::router::Operation;

/// Decodes one operation result into its typed shell. An `errors` array
/// fails the operation; a shape mismatch is a malformed response.
pub(crate) fn decode<T: DeserializeOwned>(response: GraphqlResponse) -> Result<T, TransportError> {
    let data = response.into_data()?;
    serde_json::from_value(data).map_err(|err| TransportError::Malformed(err.to_string()))
}

const CREATE_SESSION: &str = "mutation CreateSession($description: String!) { createSession(input: { description: $description }) { jwtToken } }";

const LOGIN_POLL: &str =
    "query LoginPoll { currentProfileId currentSession { id description } }";

const CURRENT_PROFILE_ID: &str = "query CurrentProfileId { currentProfileId }";

const CURRENT_SESSION: &str = "query CurrentSession { currentSession { id description } }";

const SERVER_TIMESTAMP: &str = "query ServerTimestamp { getTimestamp }";

const PROFILE: &str = "query Profile($id: UUID!) { profile(id: $id) { id name bio address countryId } }";

const MATCHUP: &str = "query Matchup($id: UUID!) { matchup(id: $id) { senderId recipientId messages(orderBy: TIMESTAMP_ASC) { pageInfo { endCursor } nodes { id senderId text timestamp } } } }";

const MATCHUP_LISTING: &str = "query MatchupListing { matchups { nodes { id senderId recipientId messages(first: 1, orderBy: TIMESTAMP_DESC) { nodes { id senderId text timestamp } } } } }";

const CREATE_MESSAGE: &str = "mutation CreateMessage($senderId: UUID!, $matchupId: UUID!, $text: String!) { createMessage(input: { senderId: $senderId, matchupId: $matchupId, text: $text }) { id } }";

const MATCHUP_MESSAGES: &str = "subscription MatchupMessages($id: UUID!, $cursor: Cursor) { matchupMessages(id: $id, after: $cursor) { pageInfo { endCursor } nodes { id senderId text timestamp } } }";

pub fn create_session(description: &str) -> Operation {
    Operation::mutation(
        GraphqlRequest::new(CREATE_SESSION)
            .with_operation_name("CreateSession")
            .with_variables(json!({ "description": description })),
    )
}

/// The confirmation poll: one query answering both "who am I" and "which
/// session is pending".
pub fn login_poll() -> Operation {
    Operation::query(GraphqlRequest::new(LOGIN_POLL).with_operation_name("LoginPoll"))
}

pub fn current_profile_id() -> Operation {
    Operation::query(GraphqlRequest::new(CURRENT_PROFILE_ID).with_operation_name("CurrentProfileId"))
}

pub fn current_session() -> Operation {
    Operation::query(GraphqlRequest::new(CURRENT_SESSION).with_operation_name("CurrentSession"))
}

pub fn server_timestamp() -> Operation {
    Operation::query(GraphqlRequest::new(SERVER_TIMESTAMP).with_operation_name("ServerTimestamp"))
}

pub fn profile(id: ProfileId) -> Operation {
    Operation::query(
        GraphqlRequest::new(PROFILE)
            .with_operation_name("Profile")
            .with_variables(json!({ "id": id })),
    )
}

pub fn matchup(id: MatchupId) -> Operation {
    Operation::query(
        GraphqlRequest::new(MATCHUP)
            .with_operation_name("Matchup")
            .with_variables(json!({ "id": id })),
    )
}

pub fn matchup_listing() -> Operation {
    Operation::query(GraphqlRequest::new(MATCHUP_LISTING).with_operation_name("MatchupListing"))
}

pub fn create_message(sender_id: ProfileId, matchup_id: MatchupId, text: &str) -> Operation {
    Operation::mutation(
        GraphqlRequest::new(CREATE_MESSAGE)
            .with_operation_name("CreateMessage")
            .with_variables(json!({
                "senderId": sender_id,
                "matchupId": matchup_id,
                "text": text,
            })),
    )
}

/// The live tail of one conversation. `cursor` resumes after the last
/// historical page so already-fetched messages are not re-sent.
pub fn matchup_messages(id: MatchupId, cursor: Option<&Cursor>) -> Operation {
    Operation::subscription(
        GraphqlRequest::new(MATCHUP_MESSAGES)
            .with_operation_name("MatchupMessages")
            .with_variables(json!({ "id": id, "cursor": cursor })),
    )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionData {
    pub create_session: Option<CreateSessionPayload>,
}

impl CreateSessionData {
    pub fn token(self) -> Option<String> {
        self.create_session.and_then(|payload| payload.jwt_token)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionPayload {
    pub jwt_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNode {
    pub id: SessionId,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPollData {
    pub current_profile_id: Option<ProfileId>,
    pub current_session: Option<SessionNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentProfileIdData {
    pub current_profile_id: Option<ProfileId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSessionData {
    pub current_session: Option<SessionNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimestampData {
    pub get_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNode {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub country_id: Option<i64>,
}

impl From<ProfileNode> for Profile {
    fn from(node: ProfileNode) -> Self {
        Self {
            id: node.id,
            name: node.name,
            bio: node.bio,
            address: node.address,
            country_id: node.country_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileData {
    pub profile: Option<ProfileNode>,
}

/// The matchup body without its id; the caller already holds the id it
/// asked for.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchupBody {
    pub sender_id: ProfileId,
    pub recipient_id: ProfileId,
    #[serde(default)]
    pub messages: MessagePage,
}

impl MatchupBody {
    pub fn into_parts(self, id: MatchupId) -> (Matchup, MessagePage) {
        (
            Matchup {
                id,
                sender_id: self.sender_id,
                recipient_id: self.recipient_id,
            },
            self.messages,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchupData {
    pub matchup: Option<MatchupBody>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchupListingNode {
    pub id: MatchupId,
    pub sender_id: ProfileId,
    pub recipient_id: ProfileId,
    #[serde(default)]
    pub messages: MessagePage,
}

impl MatchupListingNode {
    pub fn into_summary(self) -> MatchupSummary {
        let matchup = Matchup {
            id: self.id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
        };
        let last_message = self
            .messages
            .nodes
            .into_iter()
            .map(|node| node.into_message(matchup.id))
            .max_by_key(|message| message.order_key());
        MatchupSummary {
            matchup,
            last_message,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchupConnection {
    #[serde(default)]
    pub nodes: Vec<MatchupListingNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchupListingData {
    pub matchups: Option<MatchupConnection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedMessage {
    pub id: MessageId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageData {
    pub create_message: Option<CreatedMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchupMessagesData {
    #[serde(default)]
    pub matchup_messages: MessagePage,
}
