use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use shared::domain::{Credential, ProfileId, Session};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ClientConfig, ConfirmationTimeout};
use crate::credentials::{parse_credential, serialize_credential, CredentialSink, CredentialStore};
use crate::operations::{self as ops, CreateSessionData, LoginPollData};
use crate::router::EpochCoordinator;
use crate::ClientEvent;

/// Lifecycle of the login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No credential anywhere.
    Unauthenticated,
    /// A session exists and its token is installed in memory.
    SessionCreated,
    /// Waiting for an out-of-band actor to confirm the session.
    PollingConfirmation,
    /// Confirmation observed; the credential is persisted.
    Authenticated,
    /// Steady state.
    Idle,
}

struct BootstrapState {
    phase: SessionPhase,
    session: Option<Session>,
    profile_id: Option<ProfileId>,
    creation_attempted: bool,
    poller: Option<JoinHandle<()>>,
}

/// Drives the client from cold start to an authenticated steady state.
///
/// At most one session creation is issued per unauthenticated lifecycle; a
/// failed attempt re-arms the guard, and so does logging out. The freshly
/// minted token is installed in memory immediately so the confirmation
/// poll authenticates with it, but it reaches the sink only once
/// confirmation is observed. A persisted credential therefore always
/// denotes a confirmed session.
pub struct SessionBootstrap {
    config: ClientConfig,
    credentials: Arc<CredentialStore>,
    sink: Arc<dyn CredentialSink>,
    coordinator: Arc<EpochCoordinator>,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<BootstrapState>,
}

impl SessionBootstrap {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<CredentialStore>,
        sink: Arc<dyn CredentialSink>,
        coordinator: Arc<EpochCoordinator>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            sink,
            coordinator,
            events,
            inner: Mutex::new(BootstrapState {
                phase: SessionPhase::Unauthenticated,
                session: None,
                profile_id: None,
                creation_attempted: false,
                poller: None,
            }),
        })
    }

    /// Cold start: restores a persisted credential when the sink has one.
    pub async fn start(&self) -> Result<SessionPhase> {
        let line = self.sink.load().await.context("load persisted credential")?;
        let phase = match line.as_deref().and_then(parse_credential) {
            Some(credential) => {
                self.credentials.install(credential).await;
                info!("restored a persisted credential");
                SessionPhase::Idle
            }
            None => SessionPhase::Unauthenticated,
        };
        self.set_phase(phase).await;
        Ok(phase)
    }

    /// Starts the login handshake. Safe to call repeatedly: while a login
    /// is pending or already complete this returns the current phase
    /// without creating another session.
    pub async fn begin_login(self: &Arc<Self>) -> Result<SessionPhase> {
        {
            let mut state = self.inner.lock().await;
            match state.phase {
                SessionPhase::Unauthenticated => {
                    if state.creation_attempted {
                        return Ok(state.phase);
                    }
                    state.creation_attempted = true;
                }
                other => return Ok(other),
            }
        }

        info!(description = %self.config.login_description, "creating login session");
        let token = match self.create_session().await {
            Ok(token) => token,
            Err(err) => {
                // Re-arm the guard so a later attempt may retry.
                self.inner.lock().await.creation_attempted = false;
                return Err(err);
            }
        };

        // Installed in memory right away: the confirmation poll must
        // authenticate as this pending session.
        self.credentials.install(Credential::new(token)).await;
        self.set_phase(SessionPhase::SessionCreated).await;

        {
            let mut state = self.inner.lock().await;
            state.poller = Some(self.spawn_poller());
        }
        self.set_phase(SessionPhase::PollingConfirmation).await;
        Ok(SessionPhase::PollingConfirmation)
    }

    /// Drops the credential everywhere and returns to the unauthenticated
    /// phase. A confirmation poll in flight is stopped.
    pub async fn logout(&self) -> Result<()> {
        let poller = {
            let mut state = self.inner.lock().await;
            state.session = None;
            state.profile_id = None;
            state.creation_attempted = false;
            state.poller.take()
        };
        if let Some(poller) = poller {
            poller.abort();
        }
        self.credentials.clear().await;
        self.sink
            .clear()
            .await
            .context("clear persisted credential")?;
        let epoch = self.coordinator.rotate();
        info!("logged out");
        self.emit(ClientEvent::CredentialRotated { epoch });
        self.set_phase(SessionPhase::Unauthenticated).await;
        Ok(())
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    pub async fn profile_id(&self) -> Option<ProfileId> {
        self.inner.lock().await.profile_id
    }

    pub(crate) async fn stop_polling(&self) {
        let poller = self.inner.lock().await.poller.take();
        if let Some(poller) = poller {
            poller.abort();
        }
    }

    async fn create_session(&self) -> Result<String> {
        let operation = ops::create_session(&self.config.login_description);
        let response = self
            .coordinator
            .router()
            .execute(operation)
            .await
            .context("create session")?;
        let data: CreateSessionData = ops::decode(response).context("decode create session")?;
        data.token()
            .ok_or_else(|| anyhow!("session was created without a token"))
    }

    fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let bootstrap = Arc::clone(self);
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(bootstrap.config.poll_interval);
            loop {
                ticker.tick().await;
                if let ConfirmationTimeout::GiveUpAfter(limit) =
                    bootstrap.config.confirmation_timeout
                {
                    if started.elapsed() >= limit {
                        bootstrap.abandon_pending().await;
                        return;
                    }
                }
                match bootstrap.poll_once().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(error = %err, "confirmation poll failed");
                        bootstrap.emit(ClientEvent::Error(format!(
                            "confirmation poll failed: {err:#}"
                        )));
                    }
                }
            }
        })
    }

    /// One confirmation poll. Returns true once confirmed, which also ends
    /// the polling loop.
    async fn poll_once(&self) -> Result<bool> {
        let response = self.coordinator.router().execute(ops::login_poll()).await?;
        let data: LoginPollData = ops::decode(response)?;

        if let Some(node) = data.current_session {
            let mut state = self.inner.lock().await;
            if state.session.is_none() {
                let session = Session {
                    id: node.id,
                    description: node.description,
                    confirmed: false,
                };
                let session_id = session.id;
                state.session = Some(session);
                drop(state);
                info!(%session_id, "session awaiting confirmation");
                self.emit(ClientEvent::SessionAwaitingConfirmation { session_id });
            }
        }

        match data.current_profile_id {
            Some(profile_id) => {
                self.complete_confirmation(profile_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Confirmation observed: persist the credential, rotate the transport
    /// epoch, and settle into the steady state.
    async fn complete_confirmation(&self, profile_id: ProfileId) -> Result<()> {
        let credential = self
            .credentials
            .current()
            .await
            .ok_or_else(|| anyhow!("confirmation observed without a credential"))?;
        self.sink
            .store(&serialize_credential(&credential))
            .await
            .context("persist credential")?;
        let epoch = self.coordinator.rotate();

        {
            let mut state = self.inner.lock().await;
            state.profile_id = Some(profile_id);
            if let Some(session) = state.session.as_mut() {
                session.confirmed = true;
            }
            // The poll task exits on its own after confirmation.
            state.poller = None;
        }
        info!(%profile_id, epoch, "login confirmed; credential persisted");
        self.emit(ClientEvent::CredentialRotated { epoch });
        self.set_phase(SessionPhase::Authenticated).await;
        self.set_phase(SessionPhase::Idle).await;
        Ok(())
    }

    /// The confirmation window elapsed without a confirmation.
    async fn abandon_pending(&self) {
        self.credentials.clear().await;
        {
            let mut state = self.inner.lock().await;
            state.session = None;
            state.creation_attempted = false;
            state.poller = None;
        }
        info!("confirmation window elapsed; abandoning the pending session");
        self.set_phase(SessionPhase::Unauthenticated).await;
    }

    async fn set_phase(&self, phase: SessionPhase) {
        let mut state = self.inner.lock().await;
        if state.phase != phase {
            state.phase = phase;
            drop(state);
            self.emit(ClientEvent::PhaseChanged(phase));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use shared::graphql::{GraphqlRequest, GraphqlResponse};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use super::*;
    use crate::auth::AuthMiddleware;
    use crate::credentials::MemoryCredentialSink;

    const MINTED_TOKEN: &str = "minted-token";
    const SESSION_ID: Uuid = Uuid::from_u128(0x5e55_1011);
    const PROFILE_ID: Uuid = Uuid::from_u128(0x9501_f11e);

    #[derive(Clone)]
    struct GraphqlMockState {
        create_sessions: Arc<AtomicUsize>,
        polls: Arc<AtomicUsize>,
        confirmed: Arc<AtomicBool>,
        fail_next_creation: Arc<AtomicBool>,
    }

    impl GraphqlMockState {
        fn new() -> Self {
            Self {
                create_sessions: Arc::new(AtomicUsize::new(0)),
                polls: Arc::new(AtomicUsize::new(0)),
                confirmed: Arc::new(AtomicBool::new(false)),
                fail_next_creation: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    async fn handle_graphql(
        State(state): State<GraphqlMockState>,
        headers: axum::http::HeaderMap,
        Json(requests): Json<Vec<GraphqlRequest>>,
    ) -> Json<Vec<GraphqlResponse>> {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let session_bearer = bearer.as_deref() == Some(format!("Bearer {MINTED_TOKEN}").as_str());

        let responses = requests
            .iter()
            .map(|request| match request.operation_name.as_deref() {
                Some("CreateSession") => {
                    state.create_sessions.fetch_add(1, Ordering::SeqCst);
                    if state.fail_next_creation.swap(false, Ordering::SeqCst) {
                        return GraphqlResponse {
                            data: None,
                            errors: vec![shared::error::GraphqlError::new("database is down")],
                        };
                    }
                    GraphqlResponse {
                        data: Some(json!({
                            "createSession": { "jwtToken": MINTED_TOKEN },
                        })),
                        errors: Vec::new(),
                    }
                }
                Some("LoginPoll") => {
                    state.polls.fetch_add(1, Ordering::SeqCst);
                    let profile_id = (session_bearer
                        && state.confirmed.load(Ordering::SeqCst))
                    .then_some(PROFILE_ID);
                    let session = session_bearer.then(|| {
                        json!({ "id": SESSION_ID, "description": "test client" })
                    });
                    GraphqlResponse {
                        data: Some(json!({
                            "currentProfileId": profile_id,
                            "currentSession": session,
                        })),
                        errors: Vec::new(),
                    }
                }
                _ => GraphqlResponse {
                    data: Some(Value::Null),
                    errors: Vec::new(),
                },
            })
            .collect();
        Json(responses)
    }

    async fn spawn_graphql_server(state: GraphqlMockState) -> anyhow::Result<String> {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .route("/graphql", post(handle_graphql))
            .with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{addr}/graphql"))
    }

    struct Harness {
        bootstrap: Arc<SessionBootstrap>,
        events: broadcast::Receiver<ClientEvent>,
        credentials: Arc<CredentialStore>,
        sink: Arc<MemoryCredentialSink>,
    }

    fn harness(endpoint: String, timeout: ConfirmationTimeout) -> Harness {
        let mut config = ClientConfig::new(endpoint).expect("config");
        config.streaming = false;
        config.poll_interval = Duration::from_millis(50);
        config.confirmation_timeout = timeout;
        config.login_description = "test client".into();

        let (events_tx, events_rx) = broadcast::channel(64);
        let credentials = Arc::new(CredentialStore::new());
        let auth = Arc::new(AuthMiddleware::new(Arc::clone(&credentials)));
        let coordinator = EpochCoordinator::new(reqwest::Client::new(), &config, auth);
        let sink = Arc::new(MemoryCredentialSink::new());
        let bootstrap = SessionBootstrap::new(
            config,
            Arc::clone(&credentials),
            Arc::clone(&sink) as Arc<dyn CredentialSink>,
            coordinator,
            events_tx,
        );
        Harness {
            bootstrap,
            events: events_rx,
            credentials,
            sink,
        }
    }

    async fn wait_for_phase(events: &mut broadcast::Receiver<ClientEvent>, phase: SessionPhase) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::PhaseChanged(current)) if current == phase => return,
                    Ok(_) => {}
                    Err(err) => panic!("event stream ended: {err}"),
                }
            }
        })
        .await
        .expect("phase within five seconds");
    }

    #[tokio::test]
    async fn repeated_begin_login_creates_exactly_one_session() {
        let state = GraphqlMockState::new();
        let endpoint = spawn_graphql_server(state.clone()).await.expect("server");
        let mut h = harness(endpoint, ConfirmationTimeout::WaitForever);
        h.bootstrap.start().await.expect("start");

        let (first, second) =
            tokio::join!(h.bootstrap.begin_login(), h.bootstrap.begin_login());
        first.expect("first begin_login");
        second.expect("second begin_login");
        let third = h.bootstrap.begin_login().await.expect("third begin_login");
        assert_eq!(third, SessionPhase::PollingConfirmation);

        assert_eq!(state.create_sessions.load(Ordering::SeqCst), 1);

        // The poll authenticates with the installed token, so the pending
        // session becomes observable.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match h.events.recv().await {
                    Ok(ClientEvent::SessionAwaitingConfirmation { session_id }) => {
                        assert_eq!(session_id.0, SESSION_ID);
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => panic!("event stream ended: {err}"),
                }
            }
        })
        .await
        .expect("session observed within five seconds");
        assert_eq!(state.create_sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn confirmation_persists_the_credential_and_stops_the_poll() {
        let state = GraphqlMockState::new();
        let endpoint = spawn_graphql_server(state.clone()).await.expect("server");
        let mut h = harness(endpoint, ConfirmationTimeout::WaitForever);
        h.bootstrap.start().await.expect("start");
        h.bootstrap.begin_login().await.expect("begin_login");

        // Nothing persisted while unconfirmed, even though polls are
        // already authenticating with the pending token.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.sink.load().await.expect("load").is_none());

        state.confirmed.store(true, Ordering::SeqCst);
        wait_for_phase(&mut h.events, SessionPhase::Idle).await;

        let line = h.sink.load().await.expect("load").expect("persisted");
        let persisted = parse_credential(&line).expect("parse persisted");
        assert_eq!(persisted.as_str(), MINTED_TOKEN);
        assert_eq!(
            h.bootstrap.profile_id().await.expect("profile").0,
            PROFILE_ID
        );
        assert!(h.bootstrap.session().await.expect("session").confirmed);

        // No further poll requests once confirmed.
        let settled = state.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(state.polls.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn a_failed_creation_re_arms_the_guard() {
        let state = GraphqlMockState::new();
        state.fail_next_creation.store(true, Ordering::SeqCst);
        let endpoint = spawn_graphql_server(state.clone()).await.expect("server");
        let h = harness(endpoint, ConfirmationTimeout::WaitForever);
        h.bootstrap.start().await.expect("start");

        assert!(h.bootstrap.begin_login().await.is_err());
        assert_eq!(h.bootstrap.phase().await, SessionPhase::Unauthenticated);

        let retried = h.bootstrap.begin_login().await.expect("retry");
        assert_eq!(retried, SessionPhase::PollingConfirmation);
        assert_eq!(state.create_sessions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn the_confirmation_window_abandons_an_unconfirmed_session() {
        let state = GraphqlMockState::new();
        let endpoint = spawn_graphql_server(state.clone()).await.expect("server");
        let mut h = harness(
            endpoint,
            ConfirmationTimeout::GiveUpAfter(Duration::from_millis(200)),
        );
        h.bootstrap.start().await.expect("start");
        h.bootstrap.begin_login().await.expect("begin_login");

        wait_for_phase(&mut h.events, SessionPhase::Unauthenticated).await;
        assert!(!h.credentials.is_present().await);
        assert!(h.sink.load().await.expect("load").is_none());

        // The guard is re-armed: a new login may create a fresh session.
        h.bootstrap.begin_login().await.expect("second login");
        assert_eq!(state.create_sessions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_persisted_credential_skips_straight_to_idle() {
        let state = GraphqlMockState::new();
        let endpoint = spawn_graphql_server(state.clone()).await.expect("server");
        let h = harness(endpoint, ConfirmationTimeout::WaitForever);

        h.sink
            .store(&serialize_credential(&Credential::new(MINTED_TOKEN)))
            .await
            .expect("preload sink");

        let phase = h.bootstrap.start().await.expect("start");
        assert_eq!(phase, SessionPhase::Idle);
        assert_eq!(
            h.credentials.current().await.expect("installed").as_str(),
            MINTED_TOKEN
        );
        assert_eq!(state.create_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logout_clears_everything_and_allows_a_new_login() {
        let state = GraphqlMockState::new();
        let endpoint = spawn_graphql_server(state.clone()).await.expect("server");
        let mut h = harness(endpoint, ConfirmationTimeout::WaitForever);
        h.bootstrap.start().await.expect("start");
        h.bootstrap.begin_login().await.expect("begin_login");
        state.confirmed.store(true, Ordering::SeqCst);
        wait_for_phase(&mut h.events, SessionPhase::Idle).await;

        h.bootstrap.logout().await.expect("logout");
        assert_eq!(h.bootstrap.phase().await, SessionPhase::Unauthenticated);
        assert!(!h.credentials.is_present().await);
        assert!(h.sink.load().await.expect("load").is_none());
        assert!(h.bootstrap.profile_id().await.is_none());

        h.bootstrap.begin_login().await.expect("login again");
        assert_eq!(state.create_sessions.load(Ordering::SeqCst), 2);
    }
}
