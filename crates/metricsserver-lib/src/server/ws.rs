//! WebSocket envelope ingestion
//!
//! Each binary frame carries one protobuf envelope. Envelopes are routed to
//! the processor owning their source id; a full processor queue blocks the
//! read loop and so pushes back on the sender. A keep-alive loop pings the
//! peer and closes the connection when no pong arrives in time.

use crate::observability::{MetricsServerMetrics, StructuredLogger};
use crate::proto::Envelope;
use crate::shard;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Route accepting envelope streams
pub const ENVELOPES_PATH: &str = "/v1/envelopes";

/// Close reason sent when the peer stops answering pings
pub const KEEP_ALIVE_EXPIRED_REASON: &str = "websocket keep-alive expired";

/// Shared state of the ingestion router
pub struct IngestionState {
    channels: Vec<mpsc::Sender<Envelope>>,
    keep_alive: Duration,
    metrics: MetricsServerMetrics,
    logger: StructuredLogger,
    next_connection_id: AtomicU64,
}

impl IngestionState {
    /// `channels` holds one input queue per envelope processor, in worker order
    pub fn new(
        channels: Vec<mpsc::Sender<Envelope>>,
        keep_alive: Duration,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            channels,
            keep_alive,
            metrics: MetricsServerMetrics::new(),
            logger,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Queue of the processor owning `source_id`
    fn route(&self, source_id: &str) -> Option<&mpsc::Sender<Envelope>> {
        self.channels.get(shard::owner(source_id, self.channels.len()))
    }
}

/// Build the ingestion router
pub fn ingestion_router(state: Arc<IngestionState>) -> Router {
    Router::new()
        .route(ENVELOPES_PATH, get(upgrade))
        .with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<IngestionState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disconnect {
    ClientClosed,
    ReadError(String),
    WriteError(String),
    KeepAliveExpired,
    ProcessorsStopped,
}

impl Disconnect {
    fn reason(&self) -> String {
        match self {
            Disconnect::ClientClosed => "client closed connection".to_string(),
            Disconnect::ReadError(e) => format!("read error: {}", e),
            Disconnect::WriteError(e) => format!("write error: {}", e),
            Disconnect::KeepAliveExpired => KEEP_ALIVE_EXPIRED_REASON.to_string(),
            Disconnect::ProcessorsStopped => "envelope processors stopped".to_string(),
        }
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<IngestionState>) {
    let connection = format!(
        "conn-{}",
        state.next_connection_id.fetch_add(1, Ordering::Relaxed)
    );
    state.logger.log_ws_opened(&connection);
    state.metrics.inc_ws_connections();

    let (mut sink, stream) = socket.split();
    let (pong_tx, mut pong_rx) = mpsc::channel::<()>(1);

    let disconnect = tokio::select! {
        d = read_loop(stream, &state, pong_tx) => d,
        d = keep_alive_loop(&mut sink, &mut pong_rx, state.keep_alive) => d,
    };

    if disconnect == Disconnect::KeepAliveExpired {
        warn!(connection = %connection, "Keep-alive expired, closing connection");
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: KEEP_ALIVE_EXPIRED_REASON.into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(connection = %connection, error = %e, "Failed to send close frame");
        }
    }
    if let Err(e) = sink.close().await {
        debug!(connection = %connection, error = %e, "Failed to close websocket");
    }

    state.metrics.dec_ws_connections();
    state.logger.log_ws_closed(&connection, &disconnect.reason());
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &IngestionState,
    pong_tx: mpsc::Sender<()>,
) -> Disconnect {
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => return Disconnect::ReadError(e.to_string()),
        };

        match message {
            Message::Binary(data) => {
                let envelope = match Envelope::decode(data.as_slice()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, bytes = data.len(), "Failed to decode envelope, skipping");
                        continue;
                    }
                };
                state.metrics.inc_envelopes_received();

                let Some(channel) = state.route(&envelope.source_id) else {
                    return Disconnect::ProcessorsStopped;
                };
                if channel.send(envelope).await.is_err() {
                    return Disconnect::ProcessorsStopped;
                }
            }
            Message::Pong(_) => {
                // A pending notification already resets the timer
                let _ = pong_tx.try_send(());
            }
            Message::Text(_) => {
                warn!("Received text frame on envelope stream, skipping");
            }
            Message::Ping(_) => {}
            Message::Close(_) => return Disconnect::ClientClosed,
        }
    }

    Disconnect::ClientClosed
}

async fn keep_alive_loop(
    sink: &mut SplitSink<WebSocket, Message>,
    pong_rx: &mut mpsc::Receiver<()>,
    interval: Duration,
) -> Disconnect {
    tokio::time::sleep(interval).await;

    loop {
        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
            return Disconnect::WriteError(e.to_string());
        }

        match tokio::time::timeout(interval, pong_rx.recv()).await {
            Ok(Some(())) => tokio::time::sleep(interval / 2).await,
            // Read loop finished first
            Ok(None) => return Disconnect::ClientClosed,
            Err(_) => return Disconnect::KeepAliveExpired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(workers: usize) -> (IngestionState, Vec<mpsc::Receiver<Envelope>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| mpsc::channel(4)).unzip();
        (
            IngestionState::new(
                senders,
                Duration::from_secs(1),
                StructuredLogger::new(0),
            ),
            receivers,
        )
    }

    #[tokio::test]
    async fn test_route_uses_source_id_shard() {
        // "app-a" maps to worker 0 and "app-b" to worker 1 of 2
        let (state, mut receivers) = state(2);

        for source in ["app-a", "app-b"] {
            let envelope = Envelope::custom_metric(source, "0", "queue", "jobs", 1.0, 1);
            state.route(source).unwrap().send(envelope).await.unwrap();
        }

        assert_eq!(receivers[0].recv().await.unwrap().source_id, "app-a");
        assert_eq!(receivers[1].recv().await.unwrap().source_id, "app-b");
    }

    #[test]
    fn test_route_without_processors() {
        let (state, _receivers) = state(0);
        assert!(state.route("app-a").is_none());
    }

    #[test]
    fn test_disconnect_reasons() {
        assert_eq!(
            Disconnect::KeepAliveExpired.reason(),
            KEEP_ALIVE_EXPIRED_REASON
        );
        assert!(Disconnect::ReadError("reset".to_string())
            .reason()
            .contains("reset"));
    }
}
