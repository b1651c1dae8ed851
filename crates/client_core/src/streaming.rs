use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::error::GraphqlException;
use shared::graphql::{GraphqlRequest, GraphqlResponse, WsClientFrame, WsServerFrame};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::AuthMiddleware;
use crate::config::StreamingTuning;
use crate::error::TransportError;

const SUBSCRIPTION_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

enum DriverCommand {
    Subscribe { id: u64 },
    Unsubscribe { id: u64 },
    Cycle,
}

struct ActiveSubscription {
    /// Kept so the driver can replay the subscribe frame on a fresh
    /// connection.
    request: GraphqlRequest,
    payloads: mpsc::Sender<Result<GraphqlResponse, TransportError>>,
}

type Registry = Arc<Mutex<HashMap<u64, ActiveSubscription>>>;

/// The persistent subscription transport.
///
/// One driver task owns the websocket. It dials lazily when the first
/// subscription appears, performs the connection_init/connection_ack
/// handshake with freshly computed auth parameters, and replays every
/// active subscription after a reconnect. The driver exits once the
/// transport and all subscription handles are gone.
pub struct StreamingTransport {
    subscriptions: Registry,
    commands: mpsc::UnboundedSender<DriverCommand>,
    connected: watch::Receiver<bool>,
    next_subscription_id: AtomicU64,
}

impl StreamingTransport {
    pub fn new(ws_url: String, auth: Arc<AuthMiddleware>, tuning: StreamingTuning) -> Arc<Self> {
        let subscriptions: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let driver = Driver {
            ws_url,
            auth,
            tuning,
            subscriptions: Arc::clone(&subscriptions),
            commands: commands_rx,
            connected: connected_tx,
        };
        tokio::spawn(driver.run());
        Arc::new(Self {
            subscriptions,
            commands: commands_tx,
            connected: connected_rx,
            next_subscription_id: AtomicU64::new(1),
        })
    }

    /// Registers a subscription and returns the stream of its payloads.
    /// The stream survives reconnects; it ends when the server completes
    /// the subscription or fails it with an error frame.
    pub async fn subscribe(&self, request: GraphqlRequest) -> Result<Subscription, TransportError> {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (payloads_tx, payloads_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions.lock().await.insert(
            id,
            ActiveSubscription {
                request,
                payloads: payloads_tx,
            },
        );
        if self.commands.send(DriverCommand::Subscribe { id }).is_err() {
            self.subscriptions.lock().await.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(Subscription {
            id,
            payloads: payloads_rx,
            commands: self.commands.clone(),
        })
    }

    /// Tears the current connection down and dials again, recomputing the
    /// auth parameters. Active subscriptions are replayed on the new
    /// connection. A no-op while disconnected.
    pub fn cycle(&self) {
        let _ = self.commands.send(DriverCommand::Cycle);
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

/// A live subscription. Dropping it sends a complete frame and removes the
/// registration, so no payloads outlive the consumer.
pub struct Subscription {
    id: u64,
    payloads: mpsc::Receiver<Result<GraphqlResponse, TransportError>>,
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next(&mut self) -> Option<Result<GraphqlResponse, TransportError>> {
        self.payloads.recv().await
    }
}

impl futures::Stream for Subscription {
    type Item = Result<GraphqlResponse, TransportError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.payloads.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(DriverCommand::Unsubscribe { id: self.id });
    }
}

enum ConnectionEnd {
    /// The socket failed or the server closed it; redial after a delay.
    Lost,
    /// A deliberate cycle; redial immediately.
    Cycled,
    /// Every handle is gone; the driver exits.
    Shutdown,
}

struct Driver {
    ws_url: String,
    auth: Arc<AuthMiddleware>,
    tuning: StreamingTuning,
    subscriptions: Registry,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    connected: watch::Sender<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut delay = self.tuning.reconnect_initial_delay;
        loop {
            // Idle until a subscription needs a live connection.
            while self.subscriptions.lock().await.is_empty() {
                match self.commands.recv().await {
                    None => return,
                    Some(DriverCommand::Unsubscribe { id }) => {
                        self.subscriptions.lock().await.remove(&id);
                    }
                    Some(DriverCommand::Subscribe { .. }) | Some(DriverCommand::Cycle) => {}
                }
            }

            // Auth parameters are recomputed for every attempt, so a dial
            // after a credential rotation carries the new value.
            let params = self.auth.connection_params().await;
            let handshake =
                connect_and_handshake(&self.ws_url, params, &self.tuning).await;
            let (mut write, mut read) = match handshake {
                Ok(halves) => halves,
                Err(err) => {
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "streaming connect failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.tuning.reconnect_max_delay);
                    continue;
                }
            };
            delay = self.tuning.reconnect_initial_delay;
            let _ = self.connected.send(true);

            let end = self.drive_connection(&mut write, &mut read).await;
            let _ = self.connected.send(false);
            match end {
                ConnectionEnd::Shutdown => return,
                ConnectionEnd::Cycled => continue,
                ConnectionEnd::Lost => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.tuning.reconnect_max_delay);
                }
            }
        }
    }

    async fn drive_connection(&mut self, write: &mut WsWrite, read: &mut WsRead) -> ConnectionEnd {
        // Replay every registered subscription on the fresh connection.
        let mut on_wire: HashSet<u64> = HashSet::new();
        let entries: Vec<(u64, GraphqlRequest)> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .map(|(id, sub)| (*id, sub.request.clone()))
                .collect()
        };
        for (id, request) in entries {
            let frame = WsClientFrame::Subscribe {
                id: id.to_string(),
                payload: request,
            };
            if send_frame(write, &frame).await.is_err() {
                return ConnectionEnd::Lost;
            }
            on_wire.insert(id);
        }
        info!(subscriptions = on_wire.len(), "streaming connection established");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return ConnectionEnd::Shutdown;
                    }
                    Some(DriverCommand::Subscribe { id }) => {
                        if on_wire.contains(&id) {
                            continue;
                        }
                        let request = {
                            let subscriptions = self.subscriptions.lock().await;
                            subscriptions.get(&id).map(|sub| sub.request.clone())
                        };
                        let Some(request) = request else { continue };
                        let frame = WsClientFrame::Subscribe {
                            id: id.to_string(),
                            payload: request,
                        };
                        if send_frame(write, &frame).await.is_err() {
                            return ConnectionEnd::Lost;
                        }
                        on_wire.insert(id);
                    }
                    Some(DriverCommand::Unsubscribe { id }) => {
                        self.subscriptions.lock().await.remove(&id);
                        if on_wire.remove(&id) {
                            let frame = WsClientFrame::Complete { id: id.to_string() };
                            let _ = send_frame(write, &frame).await;
                        }
                    }
                    Some(DriverCommand::Cycle) => {
                        info!("cycling streaming connection");
                        let _ = write.send(Message::Close(None)).await;
                        return ConnectionEnd::Cycled;
                    }
                },
                frame = read.next() => match frame {
                    None => {
                        warn!("streaming connection ended");
                        return ConnectionEnd::Lost;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "streaming read failed");
                        return ConnectionEnd::Lost;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_server_frame(&text, write, &mut on_wire).await.is_err() {
                            return ConnectionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return ConnectionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return ConnectionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn handle_server_frame(
        &self,
        text: &str,
        write: &mut WsWrite,
        on_wire: &mut HashSet<u64>,
    ) -> Result<(), TransportError> {
        let frame = match serde_json::from_str::<WsServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "discarding unparseable streaming frame");
                return Ok(());
            }
        };
        match frame {
            WsServerFrame::Next { id, payload } => {
                let Ok(id) = id.parse::<u64>() else {
                    warn!(%id, "next frame with an unrecognized subscription id");
                    return Ok(());
                };
                let sender = {
                    let subscriptions = self.subscriptions.lock().await;
                    subscriptions.get(&id).map(|sub| sub.payloads.clone())
                };
                match sender {
                    Some(sender) => {
                        if sender.send(Ok(payload)).await.is_err() {
                            // The consumer went away without unsubscribing.
                            self.subscriptions.lock().await.remove(&id);
                            if on_wire.remove(&id) {
                                let frame = WsClientFrame::Complete { id: id.to_string() };
                                send_frame(write, &frame).await?;
                            }
                        }
                    }
                    None => debug!(id, "payload for an inactive subscription"),
                }
            }
            WsServerFrame::Error { id, payload } => {
                let Ok(id) = id.parse::<u64>() else {
                    return Ok(());
                };
                on_wire.remove(&id);
                if let Some(sub) = self.subscriptions.lock().await.remove(&id) {
                    let failure = TransportError::Graphql(GraphqlException::new(payload));
                    let _ = sub.payloads.send(Err(failure)).await;
                }
            }
            WsServerFrame::Complete { id } => {
                let Ok(id) = id.parse::<u64>() else {
                    return Ok(());
                };
                on_wire.remove(&id);
                self.subscriptions.lock().await.remove(&id);
            }
            WsServerFrame::Ping { payload } => {
                send_frame(write, &WsClientFrame::Pong { payload }).await?;
            }
            WsServerFrame::Pong { .. } | WsServerFrame::ConnectionAck { .. } => {}
        }
        Ok(())
    }
}

async fn connect_and_handshake(
    ws_url: &str,
    params: Option<Value>,
    tuning: &StreamingTuning,
) -> Result<(WsWrite, WsRead), TransportError> {
    let (stream, _response) = tokio::time::timeout(tuning.handshake_timeout, connect_async(ws_url))
        .await
        .map_err(|_| TransportError::Network("websocket connect timed out".into()))?
        .map_err(|err| TransportError::Network(err.to_string()))?;
    let (mut write, mut read) = stream.split();

    send_frame(&mut write, &WsClientFrame::ConnectionInit { payload: params }).await?;

    match tokio::time::timeout(tuning.handshake_timeout, await_ack(&mut write, &mut read)).await {
        Ok(Ok(())) => Ok((write, read)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(TransportError::Network("connection_ack timed out".into())),
    }
}

async fn await_ack(write: &mut WsWrite, read: &mut WsRead) -> Result<(), TransportError> {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsServerFrame>(&text) {
                Ok(WsServerFrame::ConnectionAck { .. }) => return Ok(()),
                Ok(WsServerFrame::Ping { payload }) => {
                    send_frame(write, &WsClientFrame::Pong { payload }).await?;
                }
                Ok(other) => {
                    return Err(TransportError::Malformed(format!(
                        "expected connection_ack, got {other:?}"
                    )));
                }
                Err(err) => return Err(TransportError::Malformed(err.to_string())),
            },
            Ok(Message::Ping(data)) => {
                write
                    .send(Message::Pong(data))
                    .await
                    .map_err(|err| TransportError::Network(err.to_string()))?;
            }
            Ok(Message::Close(_)) => return Err(TransportError::ConnectionClosed),
            Ok(_) => {}
            Err(err) => return Err(TransportError::Network(err.to_string())),
        }
    }
    Err(TransportError::ConnectionClosed)
}

async fn send_frame(write: &mut WsWrite, frame: &WsClientFrame) -> Result<(), TransportError> {
    let text =
        serde_json::to_string(frame).map_err(|err| TransportError::Malformed(err.to_string()))?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|err| TransportError::Network(err.to_string()))
}
