//! RPC-with-TLS session setup (RFC 9289).
//!
//! The server answers an AUTH_TLS probe on the NULL procedure with a
//! `STARTTLS` verifier and then runs a TLS 1.3 handshake on the same
//! socket. ALPN must select the `sunrpc` protocol (RFC 9289 §5.1); the
//! rustls config enforces both.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use rustls::pki_types::PrivateKeyDer;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Verifier body of the STARTTLS reply (RFC 9289 §4.1).
pub const STARTTLS_VERIFIER: &[u8; 8] = b"STARTTLS";

/// ALPN protocol identifier for ONC RPC (RFC 9289 §5.1).
pub const ALPN_SUNRPC: &[u8] = b"sunrpc";

/// Long-lived server-side TLS context built at startup from a PEM
/// certificate chain and an unencrypted PEM private key.
#[derive(Clone)]
pub struct RpcTlsContext {
    acceptor: TlsAcceptor,
}

impl RpcTlsContext {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(
            File::open(cert_path)
                .with_context(|| format!("open certificate {}", cert_path.display()))?,
        ))
        .collect::<Result<Vec<_>, _>>()
        .context("parse certificate chain")?;
        if certs.is_empty() {
            bail!("no certificates found in {}", cert_path.display());
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(
            File::open(key_path).with_context(|| format!("open key {}", key_path.display()))?,
        ))
        .context("parse private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

        // TLS 1.3 minimum per RFC 9289 §5.2.1.
        let mut config = rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
        ])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and private key do not match")?;
        config.alpn_protocols = vec![ALPN_SUNRPC.to_vec()];

        Ok(Self { acceptor: TlsAcceptor::from(Arc::new(config)) })
    }

    /// Run the server-side handshake on an upgraded connection.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> std::io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
        self.acceptor.accept(stream).await
    }
}
