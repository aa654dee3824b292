//! # Transport Layer
//!
//! Binary WebSocket transport: one encoded packet per frame.
//!
//! ## Design
//!
//! - Socket I/O lives on tokio tasks; the simulation thread never awaits
//! - Inbound frames are decoded on the socket task and delivered as
//!   [`NetEvent`]s over a bounded crossbeam channel, drained between frames
//! - Outbound [`NetCommand`]s go the other way over an unbounded tokio
//!   channel to a router task that fans out to per-socket writers
//! - A socket that keeps sending malformed frames is closed (bounded strike
//!   window per the protocol contract)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender as EventSender;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use atrium_shared::constants::{MALFORMED_CLOSE_THRESHOLD, MALFORMED_WINDOW_SECS};
use atrium_shared::{decode, MalformedWindow, PacketName, Value};

use crate::session::SessionId;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Could not bind or connect.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// WebSocket handshake or framing failure.
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Network event delivered to the simulation thread.
#[derive(Debug)]
pub enum NetEvent {
    /// A socket finished its handshake.
    Connected {
        /// Assigned session id.
        session: SessionId,
        /// Peer address.
        remote: SocketAddr,
    },
    /// A decoded packet arrived.
    Packet {
        /// Originating session.
        session: SessionId,
        /// Packet name.
        name: PacketName,
        /// Packet payload.
        payload: Value,
    },
    /// A socket closed (peer hangup, kick, or malformed-strike close).
    Disconnected {
        /// The session that went away.
        session: SessionId,
    },
}

/// Command from the simulation thread to the socket stack.
#[derive(Debug)]
pub enum NetCommand {
    /// Send encoded bytes to one session.
    Send {
        /// Target session.
        session: SessionId,
        /// Encoded packet.
        bytes: Vec<u8>,
    },
    /// Send encoded bytes to every session, optionally skipping one (the
    /// originator of the mutation being re-broadcast).
    Broadcast {
        /// Session to skip.
        except: Option<SessionId>,
        /// Encoded packet.
        bytes: Vec<u8>,
    },
    /// Close one session's socket.
    Kick {
        /// Session to close.
        session: SessionId,
    },
    /// Stop the listener and every socket task.
    Shutdown,
}

type SocketWriters = Arc<Mutex<HashMap<SessionId, mpsc::UnboundedSender<OutFrame>>>>;

enum OutFrame {
    Packet(Vec<u8>),
    Close,
}

/// Capacity of the event channel into the simulation thread.
const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// The server side of the transport: accept loop + router.
pub struct WsServer {
    command_tx: mpsc::UnboundedSender<NetCommand>,
    local_addr: SocketAddr,
}

impl WsServer {
    /// Binds `addr` and spawns the accept loop and the command router onto
    /// the given tokio runtime. Returns the server handle and the event
    /// receiver for the simulation thread.
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        addr: SocketAddr,
    ) -> Result<(Self, crossbeam_channel::Receiver<NetEvent>), NetError> {
        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let writers: SocketWriters = Arc::new(Mutex::new(HashMap::new()));

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let accept_writers = Arc::clone(&writers);
        let accept_events = event_tx.clone();
        runtime.spawn(async move {
            let listener = match TcpListener::from_std(std_listener) {
                Ok(l) => l,
                Err(err) => {
                    tracing::error!(%err, "listener registration failed");
                    return;
                }
            };
            accept_loop(listener, accept_writers, accept_events).await;
        });

        runtime.spawn(route_commands(command_rx, writers));

        Ok((Self { command_tx, local_addr }, event_rx))
    }

    /// The address the listener actually bound.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues a command for the socket stack.
    pub fn send(&self, command: NetCommand) {
        // The router task only dies at shutdown; a failed send then is moot.
        let _ = self.command_tx.send(command);
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

async fn accept_loop(listener: TcpListener, writers: SocketWriters, events: EventSender<NetEvent>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        let session = SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        let writers = Arc::clone(&writers);
        let events = events.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    socket_task(ws, session, remote, writers, events).await;
                }
                Err(err) => {
                    tracing::debug!(%remote, %err, "websocket handshake failed");
                }
            }
        });
    }
}

async fn route_commands(mut command_rx: mpsc::UnboundedReceiver<NetCommand>, writers: SocketWriters) {
    while let Some(command) = command_rx.recv().await {
        match command {
            NetCommand::Send { session, bytes } => {
                if let Some(tx) = writers.lock().get(&session) {
                    let _ = tx.send(OutFrame::Packet(bytes));
                }
            }
            NetCommand::Broadcast { except, bytes } => {
                let guard = writers.lock();
                for (session, tx) in guard.iter() {
                    if Some(*session) == except {
                        continue;
                    }
                    let _ = tx.send(OutFrame::Packet(bytes.clone()));
                }
            }
            NetCommand::Kick { session } => {
                if let Some(tx) = writers.lock().get(&session) {
                    let _ = tx.send(OutFrame::Close);
                }
            }
            NetCommand::Shutdown => {
                let guard = writers.lock();
                for tx in guard.values() {
                    let _ = tx.send(OutFrame::Close);
                }
                break;
            }
        }
    }
}

async fn socket_task<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    session: SessionId,
    remote: SocketAddr,
    writers: SocketWriters,
    events: EventSender<NetEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutFrame>();
    writers.lock().insert(session, out_tx);

    if events
        .try_send(NetEvent::Connected { session, remote })
        .is_err()
    {
        tracing::warn!(%remote, "event channel full, refusing connection");
        writers.lock().remove(&session);
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                OutFrame::Packet(bytes) => {
                    if sink.send(Message::binary(bytes)).await.is_err() {
                        break;
                    }
                }
                OutFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut strikes = MalformedWindow::new(
        Duration::from_secs(MALFORMED_WINDOW_SECS),
        MALFORMED_CLOSE_THRESHOLD,
    );

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%session, %err, "socket read failed");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_binary() {
            // Text and other frame kinds are not part of the protocol.
            continue;
        }
        let data = msg.into_data();
        match decode(data.as_ref()) {
            Ok((name, payload)) => {
                if events
                    .try_send(NetEvent::Packet { session, name, payload })
                    .is_err()
                {
                    tracing::warn!(%session, "event channel full, dropping packet");
                }
            }
            Err(err) => {
                tracing::warn!(%session, %err, "malformed packet");
                if strikes.record(Instant::now()) {
                    tracing::warn!(%session, "closing socket after repeated malformed packets");
                    break;
                }
            }
        }
    }

    writers.lock().remove(&session);
    writer.abort();
    let _ = events.try_send(NetEvent::Disconnected { session });
}

/// The client side of the transport: one socket, same channel discipline.
pub struct WsClient {
    out_tx: mpsc::UnboundedSender<OutFrame>,
}

impl WsClient {
    /// Connects to `url` and spawns the socket task. Returns the client
    /// handle and the event receiver for the simulation thread. The server
    /// end of the conversation is surfaced as [`SessionId::SERVER`].
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, crossbeam_channel::Receiver<NetEvent>), NetError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutFrame>();

        let (mut sink, mut stream) = ws.split();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutFrame::Packet(bytes) => {
                        if sink.send(Message::binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    OutFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let Ok(msg) = frame else { break };
                if msg.is_close() {
                    break;
                }
                if !msg.is_binary() {
                    continue;
                }
                match decode(msg.into_data().as_ref()) {
                    Ok((name, payload)) => {
                        let _ = event_tx.try_send(NetEvent::Packet {
                            session: SessionId::SERVER,
                            name,
                            payload,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "malformed packet from server");
                    }
                }
            }
            let _ = event_tx.try_send(NetEvent::Disconnected {
                session: SessionId::SERVER,
            });
        });

        Ok((Self { out_tx }, event_rx))
    }

    /// Queues encoded bytes toward the server.
    pub fn send(&self, bytes: Vec<u8>) {
        let _ = self.out_tx.send(OutFrame::Packet(bytes));
    }

    /// Closes the socket.
    pub fn close(&self) {
        let _ = self.out_tx.send(OutFrame::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_shared::encode;

    #[test]
    fn test_event_variants_carry_session() {
        let ev = NetEvent::Packet {
            session: SessionId(7),
            name: PacketName::Ping,
            payload: Value::Null,
        };
        match ev {
            NetEvent::Packet { session, name, .. } => {
                assert_eq!(session, SessionId(7));
                assert_eq!(name, PacketName::Ping);
            }
            _ => unreachable!(),
        }
    }

    // The test thread blocks on the crossbeam side of the bridge, so the
    // socket tasks need their own workers.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_client_roundtrip() {
        let runtime = tokio::runtime::Handle::current();
        let (server, server_rx) =
            WsServer::spawn(&runtime, "127.0.0.1:0".parse().unwrap()).unwrap();
        let url = format!("ws://{}", server.local_addr());
        let (client, client_rx) = WsClient::connect(&url).await.unwrap();

        // Wait for the connect event on the server side.
        let session = loop {
            match server_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                NetEvent::Connected { session, .. } => break session,
                other => panic!("unexpected event {other:?}"),
            }
        };

        // Client -> server.
        client.send(encode(PacketName::Ping, &Value::Int(1)).unwrap());
        match server_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            NetEvent::Packet { name, payload, .. } => {
                assert_eq!(name, PacketName::Ping);
                assert_eq!(payload, Value::Int(1));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Server -> client.
        server.send(NetCommand::Send {
            session,
            bytes: encode(PacketName::Pong, &Value::Int(2)).unwrap(),
        });
        match client_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            NetEvent::Packet { name, payload, .. } => {
                assert_eq!(name, PacketName::Pong);
                assert_eq!(payload, Value::Int(2));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Kick closes the socket and the client observes the hangup.
        server.send(NetCommand::Kick { session });
        loop {
            match client_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                NetEvent::Disconnected { .. } => break,
                NetEvent::Packet { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
