use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use shared::graphql::{GraphqlRequest, GraphqlResponse};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::auth::AuthMiddleware;
use crate::error::TransportError;

type Waiter = oneshot::Sender<Result<GraphqlResponse, TransportError>>;

struct PendingBatch {
    generation: u64,
    requests: Vec<GraphqlRequest>,
    waiters: Vec<Waiter>,
}

struct BatchQueue {
    next_generation: u64,
    pending: Option<PendingBatch>,
}

/// Coalesces queries and mutations into array-envelope HTTP posts.
///
/// The first operation to arrive opens a batch and arms the flush timer;
/// everything arriving within the window joins it. A batch that reaches
/// `max_batch` flushes immediately. The request body is always a JSON
/// array, even for a single operation, and the response array is matched
/// back to callers by index.
pub struct BatchedTransport {
    http: reqwest::Client,
    endpoint: String,
    auth: Arc<AuthMiddleware>,
    window: Duration,
    max_batch: usize,
    queue: Mutex<BatchQueue>,
}

impl BatchedTransport {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        auth: Arc<AuthMiddleware>,
        window: Duration,
        max_batch: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            endpoint: endpoint.into(),
            auth,
            window,
            max_batch,
            queue: Mutex::new(BatchQueue {
                next_generation: 0,
                pending: None,
            }),
        })
    }

    /// Enqueues one operation and resolves when its slot of the batch
    /// response arrives. A transport-level failure rejects every operation
    /// in the batch with the same error.
    pub async fn execute(
        self: &Arc<Self>,
        request: GraphqlRequest,
    ) -> Result<GraphqlResponse, TransportError> {
        let (tx, rx) = oneshot::channel();
        let full_batch = {
            let mut queue = self.queue.lock().await;
            match queue.pending.as_mut() {
                Some(batch) => {
                    batch.requests.push(request);
                    batch.waiters.push(tx);
                    if batch.requests.len() >= self.max_batch {
                        queue.pending.take()
                    } else {
                        None
                    }
                }
                None => {
                    let generation = queue.next_generation;
                    queue.next_generation += 1;
                    queue.pending = Some(PendingBatch {
                        generation,
                        requests: vec![request],
                        waiters: vec![tx],
                    });
                    let transport = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(transport.window).await;
                        transport.flush_generation(generation).await;
                    });
                    None
                }
            }
        };
        if let Some(batch) = full_batch {
            self.dispatch(batch).await;
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Network(
                "batched operation was dropped before completion".into(),
            )),
        }
    }

    /// Window expiry for one batch generation. A no-op when that batch
    /// already flushed early, so a newer batch is never cut short.
    async fn flush_generation(&self, generation: u64) {
        let batch = {
            let mut queue = self.queue.lock().await;
            match queue.pending.as_ref() {
                Some(pending) if pending.generation == generation => queue.pending.take(),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, batch: PendingBatch) {
        let PendingBatch {
            requests, waiters, ..
        } = batch;
        debug!(operations = requests.len(), "flushing batch");
        match self.send(&requests).await {
            Ok(responses) if responses.len() == waiters.len() => {
                for (waiter, response) in waiters.into_iter().zip(responses) {
                    let _ = waiter.send(Ok(response));
                }
            }
            Ok(responses) => {
                let err = TransportError::Malformed(format!(
                    "batch of {} operations got {} responses",
                    waiters.len(),
                    responses.len()
                ));
                warn!(error = %err, "rejecting batch");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
            Err(err) => {
                warn!(error = %err, "batch request failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    async fn send(
        &self,
        requests: &[GraphqlRequest],
    ) -> Result<Vec<GraphqlResponse>, TransportError> {
        let mut headers = HeaderMap::new();
        self.auth.apply(&mut headers).await;
        let response = self
            .http
            .post(&self.endpoint)
            .headers(headers)
            .json(requests)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Vec<GraphqlResponse>>()
            .await
            .map_err(|err| TransportError::Malformed(err.to_string()))
    }
}
