//! Inbound listener.
//!
//! [`ProxyServer::start`] binds the configured address (plain HTTP, or HTTPS
//! when `server.tls` is set), plus the optional admin listener, and hands every
//! request to the [`Pipeline`]. The returned [`ProxyHandle`] stops them.

mod admin;
mod handler;
mod request_id;
#[cfg(feature = "tls")]
mod tls;

use std::{net::SocketAddr, sync::Arc, time::Duration};

pub use admin::admin_router;
use axum::{Router, middleware};
use axum_server::Handle;
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
use tokio::{net::TcpListener, task::AbortHandle};
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

use crate::{
    config::{ConfigError, PepConfig},
    pipeline::Pipeline,
};

/// Extra time after the grace deadline for listener tasks to unwind before
/// they are aborted.
const FORCE_CLOSE_MARGIN: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct ProxyState {
    pipeline: Pipeline,
    body_limit: usize,
}

/// Router that sends every method and path through the pipeline.
pub fn proxy_router(pipeline: Pipeline, body_limit: usize) -> Router {
    Router::new()
        .fallback(handler::handle_request)
        .with_state(ProxyState {
            pipeline,
            body_limit,
        })
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
}

pub struct ProxyServer;

impl ProxyServer {
    /// Bind the listeners and start serving in background tasks.
    ///
    /// Bind failures and unusable TLS material are reported here, before any
    /// request is accepted.
    pub async fn start(
        config: Arc<PepConfig>,
        pipeline: Pipeline,
    ) -> Result<ProxyHandle, ConfigError> {
        let server = &config.server;
        let listener = bind(SocketAddr::new(server.host, server.port)).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ConfigError::Bind {
                addr: format!("{}:{}", server.host, server.port),
                source,
            })?;

        let app = proxy_router(pipeline, server.body_limit_bytes);
        let tracker = TaskTracker::new();
        let mut listeners = Vec::new();

        match &server.tls {
            None => {
                tracing::info!(address = %local_addr, "Proxy listening (HTTP)");
                listeners.push(spawn_http(&tracker, listener, app, "proxy")?);
            }
            #[cfg(feature = "tls")]
            Some(tls_config) => {
                use axum_server::tls_rustls::RustlsAcceptor;

                let rustls = tls::rustls_config(tls_config)?;
                let handle = Handle::new();
                let tls_server = axum_server::from_tcp(into_std(listener, local_addr)?)
                    .map_err(|source| ConfigError::Bind {
                        addr: local_addr.to_string(),
                        source,
                    })?
                    .acceptor(tls::HandshakeLogger::new(RustlsAcceptor::new(rustls)))
                    .handle(handle.clone());

                tracing::info!(address = %local_addr, "Proxy listening (HTTPS)");
                let task = tracker.spawn(async move {
                    if let Err(e) = tls_server.serve(app.into_make_service()).await {
                        tracing::error!(listener = "proxy", error = %e, "Listener failed");
                    }
                });
                listeners.push(RunningListener {
                    handle,
                    task: task.abort_handle(),
                });
            }
            #[cfg(not(feature = "tls"))]
            Some(_) => {
                return Err(ConfigError::Tls(
                    "server.tls is set but this build has no TLS support".into(),
                ));
            }
        }

        let admin_addr = match server.admin_port {
            Some(port) => {
                let admin_listener = bind(SocketAddr::new(server.host, port)).await?;
                let addr = admin_listener
                    .local_addr()
                    .map_err(|source| ConfigError::Bind {
                        addr: format!("{}:{port}", server.host),
                        source,
                    })?;
                tracing::info!(address = %addr, "Admin listening");
                listeners.push(spawn_http(&tracker, admin_listener, admin_router(), "admin")?);
                Some(addr)
            }
            None => None,
        };

        tracker.close();

        Ok(ProxyHandle {
            local_addr,
            admin_addr,
            tracker,
            listeners,
            grace: server.shutdown_grace(),
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ConfigError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ConfigError::Bind {
            addr: addr.to_string(),
            source,
        })
}

fn into_std(listener: TcpListener, addr: SocketAddr) -> Result<std::net::TcpListener, ConfigError> {
    listener.into_std().map_err(|source| ConfigError::Bind {
        addr: addr.to_string(),
        source,
    })
}

struct RunningListener {
    handle: Handle<SocketAddr>,
    task: AbortHandle,
}

fn spawn_http(
    tracker: &TaskTracker,
    listener: TcpListener,
    app: Router,
    name: &'static str,
) -> Result<RunningListener, ConfigError> {
    let addr = listener
        .local_addr()
        .map_err(|source| ConfigError::Bind {
            addr: name.to_string(),
            source,
        })?;
    let handle = Handle::new();
    let server = axum_server::from_tcp(into_std(listener, addr)?)
        .map_err(|source| ConfigError::Bind {
            addr: addr.to_string(),
            source,
        })?
        .handle(handle.clone());

    let task = tracker.spawn(async move {
        if let Err(e) = server.serve(app.into_make_service()).await {
            tracing::error!(listener = name, error = %e, "Listener failed");
        }
    });
    Ok(RunningListener {
        handle,
        task: task.abort_handle(),
    })
}

/// Running listeners.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    tracker: TaskTracker,
    listeners: Vec<RunningListener>,
    grace: Duration,
}

impl ProxyHandle {
    /// Address the proxy listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    ///
    /// Connections still open when the grace period ends are closed, which
    /// drops the requests running on them.
    pub async fn stop(self) {
        tracing::info!(grace_secs = self.grace.as_secs(), "Shutting down listeners");
        for listener in &self.listeners {
            listener.handle.graceful_shutdown(Some(self.grace));
        }

        if tokio::time::timeout(self.grace + FORCE_CLOSE_MARGIN, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = self.grace.as_secs(),
                "Listeners did not stop after the grace period, aborting"
            );
            for listener in &self.listeners {
                listener.task.abort();
            }
        }
        tracing::info!("Listeners stopped");
    }
}
