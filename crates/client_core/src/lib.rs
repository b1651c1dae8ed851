use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Matchup, MatchupId, MatchupSummary, MessageId, Profile, ProfileId, Session, SessionId,
    },
    graphql::MessagePage,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::warn;

pub mod auth;
pub mod batch;
pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod error;
pub mod operations;
pub mod router;
pub mod streaming;
pub mod sync;

pub use bootstrap::SessionPhase;
pub use config::{ClientConfig, ConfirmationTimeout, StreamingTuning};
pub use credentials::{CredentialSink, FileCredentialSink, MemoryCredentialSink};
pub use error::TransportError;
pub use operations::SessionNode;
pub use sync::{RenderedMessage, TimelineState};

use crate::{
    auth::AuthMiddleware, bootstrap::SessionBootstrap, credentials::CredentialStore,
    operations as ops, router::EpochCoordinator, sync::MessageSynchronizer,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications fanned out to every subscriber of
/// [`MatchupClient::subscribe_events`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    PhaseChanged(SessionPhase),
    SessionAwaitingConfirmation { session_id: SessionId },
    CredentialRotated { epoch: u64 },
    StreamingStatus { connected: bool, epoch: u64 },
    Error(String),
}

/// Facade over the whole client: transports, login lifecycle, and live
/// matchup timelines.
pub struct MatchupClient {
    config: ClientConfig,
    coordinator: Arc<EpochCoordinator>,
    bootstrap: Arc<SessionBootstrap>,
    events: broadcast::Sender<ClientEvent>,
    status_task: Option<JoinHandle<()>>,
}

impl MatchupClient {
    /// A client whose credential lives only in memory.
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Self::new_with_sink(config, Arc::new(MemoryCredentialSink::new()))
    }

    /// A client that persists its credential through the given sink. Must
    /// be called from within a Tokio runtime.
    pub fn new_with_sink(config: ClientConfig, sink: Arc<dyn CredentialSink>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let credentials = Arc::new(CredentialStore::new());
        let auth = Arc::new(AuthMiddleware::new(Arc::clone(&credentials)));
        let coordinator = EpochCoordinator::new(reqwest::Client::new(), &config, auth);
        let bootstrap = SessionBootstrap::new(
            config.clone(),
            credentials,
            sink,
            Arc::clone(&coordinator),
            events.clone(),
        );

        let status_task = coordinator.router().streaming().map(|streaming| {
            let mut connected = streaming.connected();
            let events = events.clone();
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let mut last = *connected.borrow();
                while connected.changed().await.is_ok() {
                    let current = *connected.borrow();
                    if current != last {
                        last = current;
                        let _ = events.send(ClientEvent::StreamingStatus {
                            connected: current,
                            epoch: coordinator.current_epoch(),
                        });
                    }
                }
            })
        });

        Arc::new(Self {
            config,
            coordinator,
            bootstrap,
            events,
            status_task,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Restores a persisted credential, if any, and reports the resulting
    /// phase.
    pub async fn start(&self) -> Result<SessionPhase> {
        self.bootstrap.start().await
    }

    /// Creates a login session and polls until it is confirmed out of
    /// band. Repeated calls while a login is pending are no-ops.
    pub async fn begin_login(&self) -> Result<SessionPhase> {
        self.bootstrap.begin_login().await
    }

    pub async fn logout(&self) -> Result<()> {
        self.bootstrap.logout().await
    }

    pub async fn phase(&self) -> SessionPhase {
        self.bootstrap.phase().await
    }

    pub async fn session(&self) -> Option<Session> {
        self.bootstrap.session().await
    }

    pub fn streaming_connected(&self) -> bool {
        self.coordinator
            .router()
            .streaming()
            .map(|streaming| *streaming.connected().borrow())
            .unwrap_or(false)
    }

    pub async fn current_profile_id(&self) -> Result<Option<ProfileId>> {
        let response = self
            .coordinator
            .router()
            .execute(ops::current_profile_id())
            .await?;
        let data: ops::CurrentProfileIdData = ops::decode(response)?;
        Ok(data.current_profile_id)
    }

    pub async fn current_session(&self) -> Result<Option<SessionNode>> {
        let response = self
            .coordinator
            .router()
            .execute(ops::current_session())
            .await?;
        let data: ops::CurrentSessionData = ops::decode(response)?;
        Ok(data.current_session)
    }

    pub async fn server_timestamp(&self) -> Result<DateTime<Utc>> {
        let response = self
            .coordinator
            .router()
            .execute(ops::server_timestamp())
            .await?;
        let data: ops::ServerTimestampData = ops::decode(response)?;
        Ok(data.get_timestamp)
    }

    pub async fn profile(&self, id: ProfileId) -> Result<Option<Profile>> {
        let response = self.coordinator.router().execute(ops::profile(id)).await?;
        let data: ops::ProfileData = ops::decode(response)?;
        Ok(data.profile.map(Profile::from))
    }

    /// A matchup and its full message history, oldest first.
    pub async fn matchup(&self, id: MatchupId) -> Result<Option<(Matchup, MessagePage)>> {
        let response = self.coordinator.router().execute(ops::matchup(id)).await?;
        let data: ops::MatchupData = ops::decode(response)?;
        Ok(data.matchup.map(|body| body.into_parts(id)))
    }

    /// Every matchup visible to the current profile, each with its latest
    /// message as a preview.
    pub async fn matchups(&self) -> Result<Vec<MatchupSummary>> {
        let response = self
            .coordinator
            .router()
            .execute(ops::matchup_listing())
            .await?;
        let data: ops::MatchupListingData = ops::decode(response)?;
        Ok(data
            .matchups
            .map(|connection| {
                connection
                    .nodes
                    .into_iter()
                    .map(ops::MatchupListingNode::into_summary)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn send_message(&self, matchup_id: MatchupId, text: &str) -> Result<MessageId> {
        let sender_id = self.require_profile_id().await?;
        let response = self
            .coordinator
            .router()
            .execute(ops::create_message(sender_id, matchup_id, text))
            .await?;
        let data: ops::CreateMessageData = ops::decode(response)?;
        let created = data
            .create_message
            .ok_or_else(|| anyhow!("message was not created"))?;
        Ok(created.id)
    }

    /// Fetches the history of a matchup and keeps it current through the
    /// streaming transport. When live updates cannot be established the
    /// watch still carries the historical timeline.
    pub async fn watch_matchup(&self, matchup_id: MatchupId) -> MatchupWatch {
        let mut synchronizer = MessageSynchronizer::new(matchup_id);
        match self.matchup(matchup_id).await {
            Ok(Some((_, page))) => synchronizer.apply_history(page),
            Ok(None) => synchronizer.mark_unavailable("matchup not found"),
            Err(err) => {
                warn!(%matchup_id, error = %err, "history fetch failed");
                synchronizer.mark_unavailable(format!("history unavailable: {err:#}"));
            }
        }

        let cursor = synchronizer.resume_cursor().cloned();
        let (timeline_tx, timeline_rx) = watch::channel(synchronizer.timeline());

        let subscription = match self
            .coordinator
            .router()
            .subscribe(ops::matchup_messages(matchup_id, cursor.as_ref()))
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(%matchup_id, error = %err, "live updates unavailable");
                None
            }
        };

        // Without a subscription the sender drops here, which ends the
        // watch stream after its initial value.
        let pump = subscription.map(|mut subscription| {
            tokio::spawn(async move {
                while let Some(result) = subscription.next().await {
                    match result {
                        Ok(response) => match ops::decode::<ops::MatchupMessagesData>(response) {
                            Ok(data) => {
                                synchronizer.apply_live(data.matchup_messages);
                                timeline_tx.send_replace(synchronizer.timeline());
                            }
                            Err(err) => {
                                warn!(%matchup_id, error = %err, "discarding malformed live payload");
                            }
                        },
                        Err(err) => {
                            warn!(%matchup_id, error = %err, "live update stream ended");
                            break;
                        }
                    }
                }
            })
        });

        MatchupWatch {
            matchup_id,
            timeline: timeline_rx,
            pump,
        }
    }

    /// Stops background activity: the login poller and streaming status
    /// forwarding. Outstanding watches keep their own lifecycles.
    pub async fn shutdown(&self) {
        self.bootstrap.stop_polling().await;
        if let Some(task) = &self.status_task {
            task.abort();
        }
    }

    async fn require_profile_id(&self) -> Result<ProfileId> {
        if let Some(profile_id) = self.bootstrap.profile_id().await {
            return Ok(profile_id);
        }
        // A restored credential skips the login flow, so the profile id
        // may not be known locally yet.
        self.current_profile_id()
            .await?
            .ok_or_else(|| anyhow!("not logged in"))
    }
}

/// A live view of one matchup's conversation.
pub struct MatchupWatch {
    matchup_id: MatchupId,
    timeline: watch::Receiver<TimelineState>,
    pump: Option<JoinHandle<()>>,
}

impl MatchupWatch {
    pub fn matchup_id(&self) -> MatchupId {
        self.matchup_id
    }

    /// The latest rendering of the conversation.
    pub fn timeline(&self) -> TimelineState {
        self.timeline.borrow().clone()
    }

    /// Waits for the timeline to change. Returns false once no further
    /// updates can arrive.
    pub async fn changed(&mut self) -> bool {
        self.timeline.changed().await.is_ok()
    }

    /// The timeline as an async stream, starting from the current state.
    pub fn updates(&self) -> WatchStream<TimelineState> {
        WatchStream::new(self.timeline.clone())
    }

    /// Whether live updates are still flowing into this watch.
    pub fn live(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }
}

impl Drop for MatchupWatch {
    fn drop(&mut self) {
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
