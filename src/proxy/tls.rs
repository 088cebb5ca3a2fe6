//! TLS termination for the inbound listener.

use std::{fs::File, io, io::BufReader, sync::Arc};

use axum_server::{accept::Accept, tls_rustls::RustlsConfig};
use futures::future::BoxFuture;
use rustls::{ServerConfig, crypto::aws_lc_rs::default_provider};

use crate::{
    config::{ConfigError, TlsConfig},
    pipeline::PepError,
};

/// Load the certificate chain and key and build the rustls server config.
pub fn rustls_config(tls: &TlsConfig) -> Result<RustlsConfig, ConfigError> {
    let cert_file = File::open(&tls.cert_path).map_err(|e| {
        ConfigError::Tls(format!("Failed to open certificate {}: {e}", tls.cert_path))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("Invalid certificate {}: {e}", tls.cert_path)))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "No certificates found in {}",
            tls.cert_path
        )));
    }

    let key_file = File::open(&tls.key_path)
        .map_err(|e| ConfigError::Tls(format!("Failed to open key {}: {e}", tls.key_path)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ConfigError::Tls(format!("Invalid key {}: {e}", tls.key_path)))?
        .ok_or_else(|| ConfigError::Tls(format!("No private key found in {}", tls.key_path)))?;

    let mut server_config = ServerConfig::builder_with_provider(default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(format!("Unsupported TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(format!("Certificate and key do not match: {e}")))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

/// Wraps an acceptor so failed handshakes are logged before the connection is dropped.
#[derive(Debug, Clone)]
pub struct HandshakeLogger<A> {
    inner: A,
}

impl<A> HandshakeLogger<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

impl<A, I, S> Accept<I, S> for HandshakeLogger<A>
where
    A: Accept<I, S>,
    A::Future: Send + 'static,
{
    type Stream = A::Stream;
    type Service = A::Service;
    type Future = BoxFuture<'static, io::Result<(A::Stream, A::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let handshake = self.inner.accept(stream, service);
        Box::pin(async move {
            handshake.await.inspect_err(|e| {
                let err = PepError::TlsHandshake(e.to_string());
                tracing::debug!(error = %err, "Dropping connection");
            })
        })
    }
}
