//! End-to-end tests over QUIC: a real client talks to a bound [`Server`]
//! through request frames on a bidirectional stream and reads pushes from the
//! server's unidirectional stream.

use std::{sync::Arc, time::Duration};

use mergeline_proto::{
    ALPN_PROTOCOL, DocumentId, ErrorBody, Frame, FrameHeader, Message, Operation, Push, Request,
    Response, ResponseData, SequencedOperation, SessionId, message::mime, status,
};
use mergeline_server::{
    GatewayConfig, Server, ServerRuntimeConfig,
    storage::{MemoryLog, MemoryPubSub, MemorySnapshotStore},
};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};

const TIMEOUT: Duration = Duration::from_secs(5);

fn doc() -> DocumentId {
    DocumentId::new("doc-1").unwrap()
}

async fn start_server(gateway: GatewayConfig) -> std::net::SocketAddr {
    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        gateway,
        ..ServerRuntimeConfig::default()
    };
    let server =
        Server::bind(config, MemoryLog::new(), MemorySnapshotStore::new(), MemoryPubSub::new())
            .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn connect(addr: std::net::SocketAddr, stream_window: Option<u32>) -> Connection {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap(),
    ));
    if let Some(window) = stream_window {
        let mut transport = quinn::TransportConfig::default();
        transport.stream_receive_window(VarInt::from_u32(window));
        config.transport_config(Arc::new(transport));
    }

    let mut endpoint = Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(config);
    endpoint.connect(addr, "localhost").unwrap().await.unwrap()
}

async fn read_frame(recv: &mut RecvStream) -> Option<Frame> {
    let mut buf = vec![0u8; FrameHeader::SIZE];
    recv.read_exact(&mut buf).await.ok()?;
    let payload_size = FrameHeader::from_bytes(&buf).unwrap().payload_size() as usize;
    buf.resize(FrameHeader::SIZE + payload_size, 0);
    recv.read_exact(&mut buf[FrameHeader::SIZE..]).await.ok()?;
    Some(Frame::decode(&buf).unwrap())
}

/// Send one message and wait for the response with the same request id.
async fn call(
    send: &mut SendStream,
    recv: &mut RecvStream,
    request_id: u32,
    message: Message,
) -> Response {
    let bytes = message.into_frame(request_id).unwrap().to_vec().unwrap();
    send.write_all(&bytes).await.unwrap();

    let frame = tokio::time::timeout(TIMEOUT, read_frame(recv))
        .await
        .expect("timed out waiting for response")
        .expect("request stream closed");
    assert_eq!(frame.header.request_id(), request_id);
    match Message::from_frame(&frame).unwrap() {
        Message::Response(response) => response,
        other => panic!("expected response, got {other:?}"),
    }
}

async fn read_push(recv: &mut RecvStream) -> Option<Push> {
    let frame = tokio::time::timeout(TIMEOUT, read_frame(recv)).await.ok()??;
    match Message::from_frame(&frame).unwrap() {
        Message::Push(push) => Some(push),
        other => panic!("expected push, got {other:?}"),
    }
}

fn joined_session(response: &Response) -> SessionId {
    match &response.data {
        Some(ResponseData::Joined { session_id, .. }) => *session_id,
        other => panic!("expected join data, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_submit_push_leave() {
    let addr = start_server(GatewayConfig::default()).await;
    let conn = connect(addr, None).await;
    let (mut send, mut recv) = conn.open_bi().await.unwrap();

    let joined =
        call(&mut send, &mut recv, 1, Message::Request(Request::Join { document_id: doc() }))
            .await;
    assert_eq!(joined.status, status::OK);
    assert_eq!(joined.mime_type, mime::BOOTSTRAP);
    let session_id = joined_session(&joined);
    match &joined.data {
        Some(ResponseData::Joined { view, .. }) => {
            assert!(view.snapshot.is_empty());
            assert!(view.deltas.is_empty());
        },
        other => panic!("expected join data, got {other:?}"),
    }

    for client_seq in 1..=3 {
        let operation = Operation::new(doc(), 7, client_seq, vec![client_seq as u8]);
        let submitted = call(
            &mut send,
            &mut recv,
            10 + client_seq as u32,
            Message::Request(Request::Submit { session_id, operation }),
        )
        .await;
        assert_eq!(submitted.status, status::OK);
        assert_eq!(submitted.mime_type, mime::ACK);
        match submitted.data {
            Some(ResponseData::Submitted(ack)) => assert_eq!(ack.client_seq, client_seq),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    let mut pushes = tokio::time::timeout(TIMEOUT, conn.accept_uni()).await.unwrap().unwrap();
    for expected in 1..=3u64 {
        let push = read_push(&mut pushes).await.expect("push stream ended early");
        assert_eq!(push.session_id, session_id);
        assert_eq!(push.operation.sequence_number, expected);
        assert_eq!(push.operation.operation.client_seq, expected);
    }

    let left =
        call(&mut send, &mut recv, 20, Message::Request(Request::Leave { session_id })).await;
    assert_eq!(left.status, status::OK);
    assert_eq!(left.mime_type, mime::LEFT);
    assert_eq!(left.data, Some(ResponseData::Left { session_id }));

    let again =
        call(&mut send, &mut recv, 21, Message::Request(Request::Leave { session_id })).await;
    assert_eq!(again.status, status::NOT_FOUND);
    assert_eq!(again.mime_type, mime::ERROR);
    assert_eq!(again.error.map(|e| e.code), Some(ErrorBody::SESSION_NOT_FOUND));
}

#[tokio::test]
async fn test_foreign_session_and_bad_frames_rejected() {
    let addr = start_server(GatewayConfig::default()).await;
    let owner = connect(addr, None).await;
    let intruder = connect(addr, None).await;

    let (mut send, mut recv) = owner.open_bi().await.unwrap();
    let joined =
        call(&mut send, &mut recv, 1, Message::Request(Request::Join { document_id: doc() }))
            .await;
    let session_id = joined_session(&joined);

    let (mut other_send, mut other_recv) = intruder.open_bi().await.unwrap();
    let operation = Operation::new(doc(), 9, 1, b"x".to_vec());
    let response = call(
        &mut other_send,
        &mut other_recv,
        2,
        Message::Request(Request::Submit { session_id, operation }),
    )
    .await;
    assert_eq!(response.status, status::NOT_FOUND);
    assert_eq!(response.error.map(|e| e.code), Some(ErrorBody::SESSION_NOT_FOUND));

    // A push frame is not a request.
    let operation = Operation::new(doc(), 9, 1, Vec::new());
    let stray = Message::Push(Push {
        session_id,
        operation: SequencedOperation::new(1, operation),
    });
    let response = call(&mut other_send, &mut other_recv, 3, stray).await;
    assert_eq!(response.status, status::BAD_REQUEST);
    assert_eq!(response.mime_type, mime::ERROR);
    assert_eq!(response.error.map(|e| e.code), Some(ErrorBody::INVALID_REQUEST));

    let wrong_document = Operation::new(DocumentId::new("doc-2").unwrap(), 9, 1, Vec::new());
    let response = call(
        &mut send,
        &mut recv,
        4,
        Message::Request(Request::Submit { session_id, operation: wrong_document }),
    )
    .await;
    assert_eq!(response.status, status::BAD_REQUEST);
    assert_eq!(response.error.map(|e| e.code), Some(ErrorBody::DOCUMENT_MISMATCH));
}

#[tokio::test]
async fn test_slow_reader_is_evicted_and_disconnected() {
    const TOTAL: u64 = 40;

    let addr = start_server(GatewayConfig {
        session_inbox_capacity: 1,
        ..GatewayConfig::default()
    })
    .await;
    // A small receive window stalls the server's push writes while the
    // client is not reading.
    let conn = connect(addr, Some(16 * 1024)).await;
    let (mut send, mut recv) = conn.open_bi().await.unwrap();

    let joined =
        call(&mut send, &mut recv, 1, Message::Request(Request::Join { document_id: doc() }))
            .await;
    let session_id = joined_session(&joined);

    for client_seq in 1..=TOTAL {
        let operation = Operation::new(doc(), 7, client_seq, vec![0u8; 8 * 1024]);
        let submitted = call(
            &mut send,
            &mut recv,
            1 + client_seq as u32,
            Message::Request(Request::Submit { session_id, operation }),
        )
        .await;
        assert_eq!(submitted.status, status::OK);
    }

    let mut pushes = tokio::time::timeout(TIMEOUT, conn.accept_uni()).await.unwrap().unwrap();
    let mut received = Vec::new();
    while let Some(push) = read_push(&mut pushes).await {
        received.push(push.operation.sequence_number);
    }

    assert!((received.len() as u64) < TOTAL, "evicted session received everything");
    let expected: Vec<u64> = (1..=received.len() as u64).collect();
    assert_eq!(received, expected, "pushes before eviction are gap-free");

    let reason = tokio::time::timeout(TIMEOUT, conn.closed()).await.unwrap();
    match reason {
        quinn::ConnectionError::ApplicationClosed(close) => {
            assert_eq!(close.error_code, VarInt::from_u32(1));
            assert_eq!(&close.reason[..], b"session evicted");
        },
        other => panic!("expected application close, got {other:?}"),
    }
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}
