//! Mergeline operation relay.
//!
//! Clients join a document, receive a consistent bootstrap view, submit
//! operations, and receive every operation of the document in the total order
//! the durable log assigned.
//!
//! # Architecture
//!
//! ```text
//! client ──Submit──▶ Gateway ──▶ OpIngress ──append──▶ DurableLog
//!                                                          │ output
//!                                                          ▼
//! client ◀──Push──── Room ◀──subscribe── PubSub ◀──── FanoutBroadcaster
//! ```
//!
//! # Components
//!
//! - [`Gateway`]: sessions, rooms, join/submit/leave
//! - [`Bootstrapper`]: snapshot plus trailing deltas for a joining session
//! - [`OpIngress`]: validates operations and hands them to the log
//! - [`FanoutBroadcaster`]: republishes log output to pub/sub channels
//! - [`Dispatcher`]: maps wire requests onto the gateway
//! - [`Server`]: QUIC runtime tying it together
//! - [`storage`]: collaborator traits and implementations

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bootstrap;
mod dispatch;
mod error;
mod fanout;
mod gateway;
mod ingress;
mod registry;
mod room;
pub mod storage;
mod system_env;
mod transport;

use std::{path::PathBuf, sync::Arc, time::Duration};

pub use bootstrap::{BootstrapError, Bootstrapper};
use bytes::BytesMut;
pub use dispatch::{Dispatch, Dispatcher, OwnedSessions, error_response};
pub use error::ServerError;
pub use fanout::{FanoutBroadcaster, FanoutError, FanoutOutcome};
pub use gateway::{Gateway, GatewayConfig, GatewayError, Joined, SessionStream};
pub use ingress::{IngressError, OpIngress};
use mergeline_core::Environment;
use mergeline_proto::{ErrorBody, Frame, FrameHeader, Message, Push, Response, status};
pub use registry::{RoomRegistry, SessionEntry};
pub use room::{Evicted, RoomClient, RoomClosed, RoomCommand, RoomHandle};
use storage::{DurableLog, PubSub, SnapshotStore, Subscription};
pub use system_env::SystemEnv;
use tokio::sync::Mutex;
pub use transport::{QuinnConnection, QuinnTransport};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Directory for the persistent log and snapshots. In-memory when `None`.
    pub data_dir: Option<PathBuf>,
    /// Gateway limits
    pub gateway: GatewayConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            data_dir: None,
            gateway: GatewayConfig::default(),
        }
    }
}

/// Production Mergeline server.
pub struct Server<L, S, P> {
    dispatcher: Dispatcher<L, S, P, SystemEnv>,
    env: SystemEnv,
    log: L,
    pubsub: P,
    output: Subscription,
    transport: QuinnTransport,
}

impl<L: DurableLog, S: SnapshotStore, P: PubSub> Server<L, S, P> {
    /// Create and bind a server over the given collaborators.
    ///
    /// The log output is subscribed here so nothing appended after binding
    /// escapes the fanout.
    pub fn bind(
        config: ServerRuntimeConfig,
        log: L,
        snapshots: S,
        pubsub: P,
    ) -> Result<Self, ServerError> {
        let output = log.subscribe_output();
        let gateway = Gateway::new(config.gateway, log.clone(), snapshots, pubsub.clone());
        let env = SystemEnv::new();
        let dispatcher = Dispatcher::new(gateway, env.clone());

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;

        Ok(Self { dispatcher, env, log, pubsub, output, transport })
    }

    /// Run the fanout and accept connections until the endpoint closes.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.transport.local_addr()?, "server starting");

        let fanout = FanoutBroadcaster::new(self.log, self.pubsub);
        tokio::spawn(fanout.run(self.output));

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, dispatcher).await {
                            tracing::error!(error = %e, "connection error");
                        }
                    });
                },
                Err(ServerError::Transport(reason)) if reason == "endpoint closed" => {
                    tracing::info!("endpoint closed, server stopping");
                    return Ok(());
                },
                Err(e) => {
                    tracing::error!(error = %e, "accept error");
                    self.env.sleep(ACCEPT_BACKOFF).await;
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

/// Per-connection state shared by its stream tasks.
struct Connection<L, S, P> {
    conn: QuinnConnection,
    dispatcher: Dispatcher<L, S, P, SystemEnv>,
    /// Sessions joined over this connection
    owned: OwnedSessions,
    /// Server-to-client push stream
    push: Mutex<quinn::SendStream>,
}

async fn handle_connection<L: DurableLog, S: SnapshotStore, P: PubSub>(
    conn: QuinnConnection,
    dispatcher: Dispatcher<L, S, P, SystemEnv>,
) -> Result<(), ServerError> {
    tracing::debug!(remote = %conn.remote_addr(), "new connection");

    let push = conn.open_uni().await?;
    let connection = Arc::new(Connection {
        conn: conn.clone(),
        dispatcher,
        owned: OwnedSessions::new(),
        push: Mutex::new(push),
    });

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(&connection, send, recv).await {
                        tracing::debug!(error = %e, "stream error");
                    }
                });
            },
            Err(e) => {
                tracing::debug!(error = %e, "connection closed");
                break;
            },
        }
    }

    connection.dispatcher.disconnect(&connection.owned).await;

    Ok(())
}

/// Serve request frames on one bidirectional stream.
async fn handle_stream<L: DurableLog, S: SnapshotStore, P: PubSub>(
    connection: &Arc<Connection<L, S, P>>,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) -> Result<(), ServerError> {
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE);

    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);

        if let Err(e) = recv.read_exact(&mut buf[..FrameHeader::SIZE]).await {
            tracing::debug!(error = %e, "read error");
            return Ok(());
        }

        let payload_size = FrameHeader::from_bytes(&buf)?.payload_size() as usize;
        if payload_size > 0 {
            buf.resize(FrameHeader::SIZE + payload_size, 0);
            if let Err(e) = recv.read_exact(&mut buf[FrameHeader::SIZE..]).await {
                tracing::debug!(error = %e, "payload read error");
                return Ok(());
            }
        }

        let frame = Frame::decode(&buf)?;
        let request_id = frame.header.request_id();

        let response = match Message::from_frame(&frame) {
            Ok(Message::Request(request)) => {
                let dispatch = connection.dispatcher.handle(&connection.owned, request).await;
                if let Some(stream) = dispatch.joined {
                    tokio::spawn(forward_pushes(Arc::clone(connection), stream));
                }
                dispatch.response
            },
            Ok(other) => {
                tracing::warn!(kind = ?other.kind(), "client sent a non-request frame");
                invalid_request("expected a request frame")
            },
            Err(e) => {
                tracing::warn!(error = %e, "request body decode failed");
                invalid_request(&e.to_string())
            },
        };

        let bytes = Message::Response(response).into_frame(request_id)?.to_vec()?;
        send.write_all(&bytes).await.map_err(|e| ServerError::Transport(e.to_string()))?;
    }
}

/// Forward a session's live stream onto the connection's push stream.
///
/// If the stream ends, or a push cannot be encoded, while the connection
/// still owns the session, the session is over: the gateway drops it and the
/// client sees the connection close. Skipping a push would leave a gap the
/// client cannot detect.
async fn forward_pushes<L: DurableLog, S: SnapshotStore, P: PubSub>(
    connection: Arc<Connection<L, S, P>>,
    mut stream: SessionStream,
) {
    let session_id = stream.session_id();

    while let Some(operation) = stream.next().await {
        let sequence_number = operation.sequence_number;
        let bytes = match Message::Push(Push { session_id, operation })
            .into_frame(0)
            .and_then(|frame| frame.to_vec())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(session_id, sequence_number, error = %e, "push encode failed");
                break;
            },
        };

        let mut push = connection.push.lock().await;
        if let Err(e) = push.write_all(&bytes).await {
            tracing::debug!(session_id, error = %e, "push write failed");
            break;
        }
    }

    if connection.dispatcher.release(&connection.owned, session_id).await {
        tracing::info!(session_id, "session stream ended, closing connection");
        connection.conn.close(1, b"session evicted");
    }
}

fn invalid_request(message: &str) -> Response {
    Response::error(status::BAD_REQUEST, ErrorBody::new(ErrorBody::INVALID_REQUEST, message))
}
