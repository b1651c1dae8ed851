use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shared::graphql::{GraphqlRequest, GraphqlResponse};
use tracing::info;

use crate::auth::AuthMiddleware;
use crate::batch::BatchedTransport;
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::streaming::{StreamingTransport, Subscription};

/// The declared kind of an authored operation. Carried alongside the
/// document so routing never has to introspect query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// An operation ready to dispatch: its declared kind plus the wire request.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub request: GraphqlRequest,
}

impl Operation {
    pub fn query(request: GraphqlRequest) -> Self {
        Self {
            kind: OperationKind::Query,
            request,
        }
    }

    pub fn mutation(request: GraphqlRequest) -> Self {
        Self {
            kind: OperationKind::Mutation,
            request,
        }
    }

    pub fn subscription(request: GraphqlRequest) -> Self {
        Self {
            kind: OperationKind::Subscription,
            request,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Batched,
    Streaming,
}

/// Sends every operation to exactly one transport, decided purely by its
/// declared kind. When no streaming transport exists, subscriptions fail
/// with an explicit error instead of silently falling back to polling.
pub struct TransportRouter {
    batched: Arc<BatchedTransport>,
    streaming: Option<Arc<StreamingTransport>>,
}

impl TransportRouter {
    pub fn new(batched: Arc<BatchedTransport>, streaming: Option<Arc<StreamingTransport>>) -> Self {
        Self { batched, streaming }
    }

    /// Pure classification. Subscriptions stream; everything else batches.
    pub fn select(kind: OperationKind) -> Route {
        match kind {
            OperationKind::Subscription => Route::Streaming,
            OperationKind::Query | OperationKind::Mutation => Route::Batched,
        }
    }

    pub fn streaming(&self) -> Option<&Arc<StreamingTransport>> {
        self.streaming.as_ref()
    }

    pub async fn execute(&self, operation: Operation) -> Result<GraphqlResponse, TransportError> {
        match Self::select(operation.kind) {
            Route::Batched => self.batched.execute(operation.request).await,
            Route::Streaming => Err(TransportError::Malformed(
                "subscription operations must use subscribe".into(),
            )),
        }
    }

    pub async fn subscribe(&self, operation: Operation) -> Result<Subscription, TransportError> {
        match Self::select(operation.kind) {
            Route::Streaming => match &self.streaming {
                Some(streaming) => streaming.subscribe(operation.request).await,
                None => Err(TransportError::StreamingUnsupported),
            },
            Route::Batched => Err(TransportError::Malformed(
                "queries and mutations must use execute".into(),
            )),
        }
    }
}

/// Owns the transport stack for the lifetime of a credential epoch.
///
/// Rotation is cheap by construction: the batched transport reads auth at
/// flush time and the streaming transport recomputes its handshake
/// parameters on every dial, so rotating means bumping the epoch counter
/// and cycling the persistent connection.
pub struct EpochCoordinator {
    epoch: AtomicU64,
    router: Arc<TransportRouter>,
}

impl EpochCoordinator {
    pub fn new(http: reqwest::Client, config: &ClientConfig, auth: Arc<AuthMiddleware>) -> Arc<Self> {
        let batched = BatchedTransport::new(
            http,
            config.endpoint.clone(),
            Arc::clone(&auth),
            config.batch_window,
            config.batch_max,
        );
        let streaming = config
            .streaming
            .then(|| StreamingTransport::new(config.ws_endpoint(), auth, config.streaming_tuning));
        Arc::new(Self {
            epoch: AtomicU64::new(0),
            router: Arc::new(TransportRouter::new(batched, streaming)),
        })
    }

    pub fn router(&self) -> Arc<TransportRouter> {
        Arc::clone(&self.router)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Called after a credential rotation. The next streaming handshake and
    /// the next batch flush both pick up the new credential.
    pub fn rotate(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(streaming) = self.router.streaming() {
            streaming.cycle();
        }
        info!(epoch, "transport epoch rotated");
        epoch
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::credentials::CredentialStore;

    fn batched_only_router() -> TransportRouter {
        let store = Arc::new(CredentialStore::new());
        let auth = Arc::new(AuthMiddleware::new(store));
        let batched = BatchedTransport::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/graphql",
            auth,
            Duration::from_millis(1),
            10,
        );
        TransportRouter::new(batched, None)
    }

    #[test]
    fn routing_depends_only_on_the_declared_kind() {
        assert_eq!(
            TransportRouter::select(OperationKind::Query),
            Route::Batched
        );
        assert_eq!(
            TransportRouter::select(OperationKind::Mutation),
            Route::Batched
        );
        assert_eq!(
            TransportRouter::select(OperationKind::Subscription),
            Route::Streaming
        );
    }

    #[tokio::test]
    async fn subscribing_without_a_streaming_transport_fails_closed() {
        let router = batched_only_router();
        let result = router
            .subscribe(Operation::subscription(GraphqlRequest::new(
                "subscription { ticks }",
            )))
            .await;
        assert!(matches!(result, Err(TransportError::StreamingUnsupported)));
    }

    #[tokio::test]
    async fn kind_mismatches_are_rejected() {
        let router = batched_only_router();

        let executed = router
            .execute(Operation::subscription(GraphqlRequest::new(
                "subscription { ticks }",
            )))
            .await;
        assert!(matches!(executed, Err(TransportError::Malformed(_))));

        let subscribed = router
            .subscribe(Operation::query(GraphqlRequest::new("query { x }")))
            .await;
        assert!(matches!(subscribed, Err(TransportError::Malformed(_))));
    }

    #[tokio::test]
    async fn rotation_bumps_the_epoch() {
        let store = Arc::new(CredentialStore::new());
        let auth = Arc::new(AuthMiddleware::new(store));
        let mut config = ClientConfig::new("http://127.0.0.1:9/graphql").expect("config");
        config.streaming = false;
        let coordinator = EpochCoordinator::new(reqwest::Client::new(), &config, auth);

        assert_eq!(coordinator.current_epoch(), 0);
        assert_eq!(coordinator.rotate(), 1);
        assert_eq!(coordinator.rotate(), 2);
        assert_eq!(coordinator.current_epoch(), 2);
    }
}
