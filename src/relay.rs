use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast, watch},
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};

type ConnectionId = u64;

/// Startup failures that are fatal to the process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub async fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self::new(listener))
    }

    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &Arc<RelayState>) {
    info!("relay shutting down");
    state.begin_shutdown();
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

struct RelayState {
    registry: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
    broadcaster: broadcast::Sender<String>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct ConnectionInfo {
    peer: Option<SocketAddr>,
}

impl RelayState {
    fn new() -> Self {
        // Fan-out buffers a modest number of frames before lagging connections start dropping.
        let (broadcaster, _) = broadcast::channel(128);
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Mutex::new(HashMap::new()),
            broadcaster,
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(&self, id: ConnectionId, info: ConnectionInfo) {
        let mut registry = self.registry.lock().await;
        registry.insert(id, info);
    }

    async fn deregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let mut registry = self.registry.lock().await;
        registry.remove(&id)
    }

    async fn connection_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    fn broadcast(&self, frame: String) {
        if let Err(error) = self.broadcaster.send(frame) {
            warn!(?error, "failed to broadcast frame");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcaster.subscribe()
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let websocket = accept_async(stream).await?;
    let (mut sink, mut frames) = websocket.split();

    let id = state.next_id();
    // Subscribe before joining the registry so a frame fanned out right
    // after registration cannot slip past this connection.
    let inbox = state.subscribe();
    let shutdown = state.shutdown_signal();
    state.register(id, ConnectionInfo { peer }).await;
    let connections = state.connection_count().await;
    info!(?peer, id, connections, "client connected");

    let result = run_session(&state, &mut sink, &mut frames, inbox, shutdown).await;

    if let Some(ConnectionInfo { peer }) = state.deregister(id).await {
        let connections = state.connection_count().await;
        info!(?peer, id, connections, "client disconnected");
    }

    result
}

async fn run_session<S, R>(
    state: &RelayState,
    sink: &mut S,
    frames: &mut R,
    mut inbox: broadcast::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        select! {
            frame = frames.next() => {
                if !handle_client_frame(frame, state)? {
                    break;
                }
            }
            delivery = inbox.recv() => {
                if !handle_delivery(delivery, sink).await? {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                break;
            }
        }
    }

    Ok(())
}

fn handle_client_frame(
    frame: Option<Result<Message, WsError>>,
    state: &RelayState,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            state.broadcast(text);
            Ok(true)
        }
        Some(Ok(Message::Close(_))) => Ok(false),
        // Binary and control frames are not relayed.
        Some(Ok(_)) => Ok(true),
        Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Ok(false),
        Some(Err(err)) => Err(err.into()),
        None => Ok(false),
    }
}

async fn handle_delivery<S>(
    delivery: Result<String, broadcast::error::RecvError>,
    sink: &mut S,
) -> Result<bool>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match delivery {
        Ok(frame) => {
            if let Err(err) = sink.send(Message::Text(frame)).await {
                debug!(?err, "failed to deliver frame to connection");
                return Ok(false);
            }
            Ok(true)
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "connection lagging behind fan-out; frames dropped");
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let state = RelayState::new();
        let mut rx_one = state.subscribe();
        let mut rx_two = state.subscribe();

        state.broadcast("hello".to_string());

        assert_eq!(rx_one.recv().await.expect("first receiver"), "hello");
        assert_eq!(rx_two.recv().await.expect("second receiver"), "hello");
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_frames() {
        let state = RelayState::new();
        let mut early = state.subscribe();

        state.broadcast("first".to_string());
        let mut late = state.subscribe();
        state.broadcast("second".to_string());

        assert_eq!(early.recv().await.expect("early first"), "first");
        assert_eq!(early.recv().await.expect("early second"), "second");
        assert_eq!(late.recv().await.expect("late"), "second");
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_overflows_to_lag() {
        let state = RelayState::new();
        let mut slow = state.subscribe();

        // Push well past the channel capacity of 128 without reading.
        for i in 0..200 {
            state.broadcast(format!("frame-{i}"));
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // The subscriber recovers on the retained tail rather than stalling.
        assert_eq!(slow.recv().await.expect("retained frame"), "frame-72");
    }

    #[tokio::test]
    async fn registry_tracks_connections() {
        let state = RelayState::new();
        let id_a = state.next_id();
        let id_b = state.next_id();
        assert_ne!(id_a, id_b);

        state.register(id_a, ConnectionInfo { peer: None }).await;
        state.register(id_b, ConnectionInfo { peer: None }).await;
        assert_eq!(state.connection_count().await, 2);

        assert!(state.deregister(id_a).await.is_some());
        assert!(state.deregister(id_a).await.is_none());
        assert_eq!(state.connection_count().await, 1);
    }
}
