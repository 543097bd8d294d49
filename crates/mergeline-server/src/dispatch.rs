//! Request dispatch.
//!
//! Turns decoded client requests into gateway calls and every outcome into a
//! [`Response`]. Each connection owns the sessions it joined; a submit or
//! leave naming a session the connection doesn't own is answered as if the
//! session didn't exist.

use std::{collections::HashSet, sync::Arc};

use mergeline_core::Environment;
use mergeline_proto::{ErrorBody, Request, Response, ResponseData, SessionId, status};
use tokio::sync::Mutex;

use crate::{
    gateway::{Gateway, GatewayError, SessionStream},
    storage::{DurableLog, PubSub, SnapshotStore},
};

/// Outcome of one request.
#[derive(Debug)]
pub struct Dispatch {
    /// Response to send back
    pub response: Response,
    /// Live stream of a session created by a successful join
    pub joined: Option<SessionStream>,
}

impl Dispatch {
    fn reply(response: Response) -> Self {
        Self { response, joined: None }
    }
}

/// Sessions joined over one connection.
///
/// Each method takes the lock for a single set operation, so requests on
/// different streams of a connection never wait on each other's gateway
/// calls.
#[derive(Debug, Default)]
pub struct OwnedSessions {
    sessions: Mutex<HashSet<SessionId>>,
}

impl OwnedSessions {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a joined session.
    pub async fn insert(&self, session_id: SessionId) {
        self.sessions.lock().await.insert(session_id);
    }

    /// Whether the connection owns `session_id`.
    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.lock().await.contains(&session_id)
    }

    /// Give up ownership. Returns `false` if the session wasn't owned, so of
    /// two racing removals exactly one wins.
    pub async fn remove(&self, session_id: SessionId) -> bool {
        self.sessions.lock().await.remove(&session_id)
    }

    /// Take every owned session.
    pub async fn drain(&self) -> Vec<SessionId> {
        self.sessions.lock().await.drain().collect()
    }

    /// Number of owned sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the connection owns no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

/// Dispatches requests against a shared gateway.
pub struct Dispatcher<L, S, P, E> {
    gateway: Arc<Gateway<L, S, P>>,
    env: E,
}

impl<L, S, P, E: Clone> Clone for Dispatcher<L, S, P, E> {
    fn clone(&self) -> Self {
        Self { gateway: Arc::clone(&self.gateway), env: self.env.clone() }
    }
}

impl<L, S, P, E> Dispatcher<L, S, P, E>
where
    L: DurableLog,
    S: SnapshotStore,
    P: PubSub,
    E: Environment,
{
    /// Dispatcher over a gateway; `env` supplies session ids and join timing.
    pub fn new(gateway: Gateway<L, S, P>, env: E) -> Self {
        Self { gateway: Arc::new(gateway), env }
    }

    /// Shared gateway.
    pub fn gateway(&self) -> &Gateway<L, S, P> {
        &self.gateway
    }

    /// Handle one request on behalf of a connection owning `owned`.
    pub async fn handle(&self, owned: &OwnedSessions, request: Request) -> Dispatch {
        match request {
            Request::Join { document_id } => {
                let session_id = self.env.random_u64();
                let started = self.env.now();
                let joined = self.gateway.join(document_id, session_id).await;
                let elapsed = self.env.now() - started;
                match joined {
                    Ok(joined) => {
                        owned.insert(session_id).await;
                        tracing::debug!(
                            session_id,
                            elapsed_us = elapsed.as_micros() as u64,
                            "join dispatched"
                        );
                        Dispatch {
                            response: Response::ok(ResponseData::Joined {
                                session_id,
                                view: joined.view,
                            }),
                            joined: Some(joined.stream),
                        }
                    },
                    Err(e) => Dispatch::reply(error_response(&e)),
                }
            },
            Request::Submit { session_id, operation } => {
                if !owned.contains(session_id).await {
                    return Dispatch::reply(error_response(&GatewayError::SessionNotFound(
                        session_id,
                    )));
                }
                let document_id = operation.document_id.clone();
                match self.gateway.submit(&document_id, session_id, operation) {
                    Ok(ack) => Dispatch::reply(Response::ok(ResponseData::Submitted(ack))),
                    Err(e) => Dispatch::reply(error_response(&e)),
                }
            },
            Request::Leave { session_id } => {
                if !owned.remove(session_id).await {
                    return Dispatch::reply(error_response(&GatewayError::SessionNotFound(
                        session_id,
                    )));
                }
                match self.gateway.leave(session_id).await {
                    Ok(()) => Dispatch::reply(Response::ok(ResponseData::Left { session_id })),
                    Err(e) => Dispatch::reply(error_response(&e)),
                }
            },
        }
    }

    /// Leave one session on the connection's behalf, if it still owns it.
    ///
    /// Returns `false` when the client already left the session itself.
    pub async fn release(&self, owned: &OwnedSessions, session_id: SessionId) -> bool {
        if !owned.remove(session_id).await {
            return false;
        }
        // Already gone if its room evicted it and the gateway reaped it.
        if let Err(e) = self.gateway.leave(session_id).await {
            tracing::debug!(session_id, error = %e, "release cleanup");
        }
        true
    }

    /// Leave every session a closed connection still owns.
    pub async fn disconnect(&self, owned: &OwnedSessions) {
        for session_id in owned.drain().await {
            if let Err(e) = self.gateway.leave(session_id).await {
                tracing::debug!(session_id, error = %e, "disconnect cleanup");
            }
        }
    }
}

/// Map a gateway error to a response with status and code.
pub fn error_response(error: &GatewayError) -> Response {
    let (status, code) = match error {
        GatewayError::DocumentUnavailable { .. } => {
            (status::SERVICE_UNAVAILABLE, ErrorBody::DOCUMENT_UNAVAILABLE)
        },
        GatewayError::LogUnavailable { .. } => {
            (status::SERVICE_UNAVAILABLE, ErrorBody::LOG_UNAVAILABLE)
        },
        GatewayError::SessionNotFound(_) => (status::NOT_FOUND, ErrorBody::SESSION_NOT_FOUND),
        GatewayError::SessionAlreadyJoined(_) => {
            (status::CONFLICT, ErrorBody::SESSION_ALREADY_JOINED)
        },
        GatewayError::DocumentMismatch { .. } => (status::BAD_REQUEST, ErrorBody::DOCUMENT_MISMATCH),
        GatewayError::CapacityExceeded { .. } => {
            (status::TOO_MANY_REQUESTS, ErrorBody::CAPACITY_EXCEEDED)
        },
        GatewayError::InvalidOperation { .. } => {
            (status::BAD_REQUEST, ErrorBody::INVALID_OPERATION)
        },
        GatewayError::OutOfOrderDelivery { .. } => {
            (status::SERVICE_UNAVAILABLE, ErrorBody::OUT_OF_ORDER)
        },
    };
    Response::error(status, ErrorBody::new(code, error.to_string()))
}

#[cfg(test)]
mod tests {
    use mergeline_proto::{DocumentId, Operation};

    use super::*;
    use crate::{
        SystemEnv,
        gateway::GatewayConfig,
        storage::{MemoryLog, MemoryPubSub, MemorySnapshotStore},
    };

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    fn dispatcher() -> Dispatcher<MemoryLog, MemorySnapshotStore, MemoryPubSub, SystemEnv> {
        Dispatcher::new(
            Gateway::new(
                GatewayConfig::default(),
                MemoryLog::new(),
                MemorySnapshotStore::new(),
                MemoryPubSub::new(),
            ),
            SystemEnv::new(),
        )
    }

    fn joined_session(dispatch: &Dispatch) -> SessionId {
        match &dispatch.response.data {
            Some(ResponseData::Joined { session_id, .. }) => *session_id,
            other => panic!("expected join data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_submit_leave() {
        let dispatcher = dispatcher();
        let owned = OwnedSessions::new();

        let joined = dispatcher.handle(&owned, Request::Join { document_id: doc("doc-1") }).await;
        assert!(joined.response.is_ok());
        let session_id = joined_session(&joined);
        let mut stream = joined.joined.unwrap();
        assert!(owned.contains(session_id).await);

        let operation = Operation::new(doc("doc-1"), 9, 1, b"x".to_vec());
        let submitted = dispatcher.handle(&owned, Request::Submit { session_id, operation }).await;
        assert_eq!(submitted.response.status, status::OK);
        assert!(matches!(submitted.response.data, Some(ResponseData::Submitted(_))));

        let left = dispatcher.handle(&owned, Request::Leave { session_id }).await;
        assert_eq!(left.response.data, Some(ResponseData::Left { session_id }));
        assert!(owned.is_empty().await);

        // Leaving closes the stream.
        while stream.next().await.is_some() {}
    }

    #[tokio::test]
    async fn foreign_session_is_not_found() {
        let dispatcher = dispatcher();
        let owner = OwnedSessions::new();
        let other = OwnedSessions::new();

        let joined = dispatcher.handle(&owner, Request::Join { document_id: doc("doc-1") }).await;
        let session_id = joined_session(&joined);

        let response = dispatcher.handle(&other, Request::Leave { session_id }).await.response;
        assert_eq!(response.status, status::NOT_FOUND);
        assert_eq!(response.error.map(|e| e.code), Some(ErrorBody::SESSION_NOT_FOUND));
        assert_eq!(dispatcher.gateway().session_count(), 1);

        dispatcher.disconnect(&owner).await;
        assert_eq!(dispatcher.gateway().session_count(), 0);
    }

    #[tokio::test]
    async fn release_loses_to_client_leave() {
        let dispatcher = dispatcher();
        let owned = OwnedSessions::new();

        let joined = dispatcher.handle(&owned, Request::Join { document_id: doc("doc-1") }).await;
        let session_id = joined_session(&joined);

        let left = dispatcher.handle(&owned, Request::Leave { session_id }).await;
        assert!(left.response.is_ok());
        assert!(!dispatcher.release(&owned, session_id).await);
        assert_eq!(owned.len().await, 0);
    }

    #[test]
    fn errors_map_to_status() {
        let response = error_response(&GatewayError::CapacityExceeded { max: 3 });
        assert_eq!(response.status, status::TOO_MANY_REQUESTS);
        assert_eq!(
            response.error,
            Some(ErrorBody::new(ErrorBody::CAPACITY_EXCEEDED, "session capacity of 3 reached"))
        );

        let response = error_response(&GatewayError::DocumentUnavailable {
            document_id: doc("doc-1"),
            reason: "I/O error: disk".to_string(),
        });
        assert_eq!(response.status, status::SERVICE_UNAVAILABLE);
        assert!(response.error.unwrap().message.contains("doc-1"));
    }
}
