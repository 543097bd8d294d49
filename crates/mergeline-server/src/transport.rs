//! Quinn-based QUIC transport.
//!
//! Clients open one bidirectional stream per request batch and receive
//! pushed operations on a unidirectional stream the server opens. ALPN is
//! set to [`ALPN_PROTOCOL`]. Without certificate paths a self-signed
//! certificate is generated, which is only suitable for local testing.

use std::{net::SocketAddr, sync::Arc};

use mergeline_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};

use crate::error::ServerError;

/// QUIC endpoint accepting client connections.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Create and bind a new QUIC transport.
    ///
    /// If `cert_path` and `key_path` are provided, they will be used for TLS.
    /// Otherwise, a self-signed certificate will be generated.
    pub fn bind(
        address: &str,
        cert_path: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address.parse().map_err(config_error("bind address"))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(cert, key)?,
            _ => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr).map_err(transport_error("bind"))?;

        tracing::info!(%addr, "QUIC transport bound");

        Ok(Self { endpoint })
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<QuinnConnection, ServerError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| ServerError::Transport("endpoint closed".to_string()))?;

        let connection = incoming.await.map_err(transport_error("handshake"))?;

        Ok(QuinnConnection { connection })
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint.local_addr().map_err(transport_error("local address"))
    }
}

/// A client connection. Clones share the underlying QUIC connection.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accept a client-opened bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection.accept_bi().await.map_err(transport_error("request stream"))
    }

    /// Open the server-to-client push stream.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection.open_uni().await.map_err(transport_error("push stream"))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection with an error code and reason.
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.connection.close(error_code.into(), reason);
    }
}

fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ServerError> {
    let cert_pem = std::fs::read(cert_path).map_err(config_error(cert_path))?;
    let key_pem = std::fs::read(key_path).map_err(config_error(key_path))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(config_error("certificate chain"))?;
    if certs.is_empty() {
        return Err(ServerError::Config(format!("{cert_path}: no certificates")));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(config_error("private key"))?
        .ok_or_else(|| ServerError::Config(format!("{key_path}: no private key")))?;

    quic_config(certs, key)
}

fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(config_error("self-signed certificate"))?;

    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    tracing::warn!("using self-signed certificate, not for production use");

    quic_config(vec![cert.cert.der().clone()], key.into())
}

fn quic_config(
    certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
) -> Result<ServerConfig, ServerError> {
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(config_error("TLS"))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(config_error("QUIC"))?;

    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}

fn config_error<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> ServerError + '_ {
    move |e| ServerError::Config(format!("{what}: {e}"))
}

fn transport_error<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> ServerError {
    move |e| ServerError::Transport(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_binds_with_self_signed() {
        let transport = QuinnTransport::bind("127.0.0.1:0", None, None).unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0, "Should have assigned a port");
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        let result = QuinnTransport::bind("invalid:address:format", None, None);
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn transport_rejects_missing_cert_file() {
        let result = QuinnTransport::bind(
            "127.0.0.1:0",
            Some("/nonexistent/cert.pem"),
            Some("/nonexistent/key.pem"),
        );
        match result {
            Err(ServerError::Config(reason)) => assert!(reason.starts_with("/nonexistent/cert.pem")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn transport_rejects_empty_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, b"").unwrap();
        std::fs::write(&key, b"").unwrap();

        let result = QuinnTransport::bind("127.0.0.1:0", cert.to_str(), key.to_str());
        assert!(matches!(
            result,
            Err(ServerError::Config(reason)) if reason.ends_with("no certificates")
        ));
    }
}
