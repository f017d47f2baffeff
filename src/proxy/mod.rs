// Proxy engine - loopback HTTP/1.1 forward proxy with observable TLS
//
// Plain requests are inspected and forwarded. CONNECT tunnels are terminated
// with a per-host leaf certificate signed by the session CA, so the decrypted
// exchanges flow through the same capture path; when termination is not
// possible the tunnel degrades to blind byte relay and only connection
// metadata is recorded. Forwarded traffic is never blocked or dropped on
// behalf of event delivery.

pub mod http;
pub mod sse;
pub mod tls;
pub mod ws;

use crate::config::Config;
use crate::error::TraceError;
use crate::events::EventPayload;
use crate::pipeline::PipelineHandle;
use crate::pricing::PricingTable;
use http::{empty_body, full_body, ProxyBody, ProxyShared, RequestOrigin};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Running proxy, returned by [`start`].
pub struct ProxyHandle {
    pub port: u16,
    pub ca_cert_pem: String,
    shutdown: watch::Sender<Option<Duration>>,
    join: JoinHandle<()>,
}

impl ProxyHandle {
    /// Stop accepting, give in-flight connections `grace` to drain, then
    /// force-close the rest. Always succeeds.
    pub async fn stop(mut self, grace: Duration) {
        let _ = self.shutdown.send(Some(grace));
        // The accept loop itself enforces the drain budget; the margin here
        // only covers a wedged loop
        if tokio::time::timeout(grace + Duration::from_secs(1), &mut self.join)
            .await
            .is_err()
        {
            tracing::warn!("proxy shutdown exceeded its grace period");
            self.join.abort();
        }
    }
}

/// Bind the loopback listener and start serving.
///
/// A pinned port that cannot be bound falls back to an ephemeral port once;
/// if that also fails startup aborts with ProxyBindError.
pub async fn start(
    config: Arc<Config>,
    pricing: Arc<PricingTable>,
    events: PipelineHandle,
) -> Result<ProxyHandle, TraceError> {
    let listener = match TcpListener::bind(("127.0.0.1", config.proxy_port)).await {
        Ok(listener) => listener,
        Err(first_error) if config.proxy_port != 0 => {
            tracing::warn!(
                "port {} unavailable ({first_error}), retrying with an ephemeral port",
                config.proxy_port
            );
            TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|source| TraceError::ProxyBind {
                    addr: "127.0.0.1:0".into(),
                    source,
                })?
        }
        Err(source) => {
            return Err(TraceError::ProxyBind {
                addr: format!("127.0.0.1:{}", config.proxy_port),
                source,
            })
        }
    };
    let port = listener
        .local_addr()
        .map_err(|source| TraceError::ProxyBind {
            addr: "127.0.0.1".into(),
            source,
        })?
        .port();

    let ca = Arc::new(
        tls::CertAuthority::generate(config.leaf_cache_size).map_err(|e| {
            TraceError::TlsTermination {
                host: "session CA".into(),
                reason: e.to_string(),
            }
        })?,
    );
    let ca_cert_pem = ca.ca_cert_pem().to_string();

    let default_grace = Duration::from_millis(config.grace_ms);
    // Proxy-side drops report as EventBufferOverflow, per the engine's
    // never-block-traffic contract
    let events = events.with_overflow_code(crate::error::ErrorCode::EventBufferOverflow);
    let shared = Arc::new(
        ProxyShared::new(config, pricing, events, ca)
            .map_err(|e| TraceError::ConfigInvalid(format!("proxy client: {e}")))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(None);
    let join = tokio::spawn(accept_loop(listener, shared, shutdown_rx, default_grace));

    tracing::debug!("proxy listening on 127.0.0.1:{port}");
    Ok(ProxyHandle {
        port,
        ca_cert_pem,
        shutdown: shutdown_tx,
        join,
    })
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ProxyShared>,
    mut shutdown_rx: watch::Receiver<Option<Duration>>,
    default_grace: Duration,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!("accepted connection from {peer}");
                    let conn_shared = shared.clone();
                    shared.spawn_task(async move {
                        if let Err(e) = serve_connection(stream, conn_shared).await {
                            tracing::debug!("connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);
    let grace = (*shutdown_rx.borrow()).unwrap_or(default_grace);

    // In-flight work gets the grace budget, then the axe. Tunnels and
    // relays spawned during the drain land in a fresh set and are swept
    // after it.
    let mut tasks = shared.take_tasks();
    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!("force-closing {} proxy task(s) after grace", tasks.len());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    let mut late = shared.take_tasks();
    late.abort_all();
    while late.join_next().await.is_some() {}
}

async fn serve_connection(stream: TcpStream, shared: Arc<ProxyShared>) -> hyper::Result<()> {
    let idle = Duration::from_millis(shared.config.idle_tunnel_timeout_ms);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let shared = shared.clone();
        async move { Ok::<_, Infallible>(route(shared, req).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .timer(TokioTimer::new())
        // Keep-alive connections that go quiet get reaped
        .header_read_timeout(idle)
        .serve_connection(io, service)
        .with_upgrades()
        .await
}

async fn route(
    shared: Arc<ProxyShared>,
    req: Request<hyper::body::Incoming>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        handle_connect(shared, req)
    } else {
        http::handle(shared, req, RequestOrigin::PlainHttp).await
    }
}

/// Accept the CONNECT, then continue on the upgraded byte stream: TLS
/// termination when we can, blind relay when we cannot.
fn handle_connect(
    shared: Arc<ProxyShared>,
    req: Request<hyper::body::Incoming>,
) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        tracing::debug!("CONNECT without authority");
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body("CONNECT requires host:port"))
            .expect("static response");
    };

    let on_upgrade = hyper::upgrade::on(req);
    let task_shared = shared.clone();
    task_shared.spawn_task(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                tunnel(shared, TokioIo::new(upgraded), authority.as_str()).await;
            }
            Err(e) => tracing::debug!("CONNECT upgrade failed for {authority}: {e}"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static response")
}

async fn tunnel<S>(shared: Arc<ProxyShared>, client: S, authority: &str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let host = authority.split(':').next().unwrap_or(authority).to_string();
    let port: u16 = authority
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(443);

    if shared.ca.is_pinned(&host) {
        blind_tunnel(shared, client, host, port, started, None).await;
        return;
    }

    // Leaf generation happens before any client byte is consumed, so this
    // failure can still fall back to relaying
    let server_config = match shared.ca.server_config_for(&host) {
        Ok(config) => config,
        Err(e) => {
            tracing::debug!("leaf generation failed for {host}: {e}");
            shared.ca.pin(&host);
            blind_tunnel(
                shared,
                client,
                host,
                port,
                started,
                Some("tls_termination_failed".into()),
            )
            .await;
            return;
        }
    };

    let tls_stream = match TlsAcceptor::from(server_config).accept(client).await {
        Ok(stream) => stream,
        Err(e) => {
            // Handshake already consumed client bytes; this connection is
            // unsalvageable. Pin the host so the client's retry tunnels
            // blindly instead of failing again.
            tracing::debug!("TLS termination failed for {host}: {e}");
            shared.ca.pin(&host);
            let events = shared.events.clone();
            events.emit_payload(EventPayload::HttpsConnect {
                host,
                port,
                duration_ms: Some(started.elapsed().as_millis() as i64),
                error: Some("tls_termination_failed".into()),
            });
            return;
        }
    };

    // Decrypted stream: serve inner HTTP/1.1 requests through the normal
    // capture path
    let inner_shared = shared.clone();
    let authority = authority.to_string();
    let service = service_fn(move |req| {
        let shared = inner_shared.clone();
        let origin = RequestOrigin::Tunnel {
            authority: authority.clone(),
        };
        async move { Ok::<_, Infallible>(http::handle(shared, req, origin).await) }
    });

    let idle = Duration::from_millis(shared.config.idle_tunnel_timeout_ms);
    let result = http1::Builder::new()
        .preserve_header_case(true)
        .timer(TokioTimer::new())
        .header_read_timeout(idle)
        .serve_connection(TokioIo::new(tls_stream), service)
        .with_upgrades()
        .await;
    if let Err(e) = result {
        tracing::debug!("tunnel session for {host} ended: {e}");
    }
}

/// CONNECT-level relay without termination; only metadata is observable.
async fn blind_tunnel<S>(
    shared: Arc<ProxyShared>,
    client: S,
    host: String,
    port: u16,
    started: Instant,
    error: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            shared.events.emit_payload(EventPayload::HttpsConnect {
                host,
                port,
                duration_ms: Some(started.elapsed().as_millis() as i64),
                error: Some(format!("upstream connect failed: {e}")),
            });
            return;
        }
    };

    let idle = Duration::from_millis(shared.config.idle_tunnel_timeout_ms);
    relay(client, upstream, idle).await;

    shared.events.emit_payload(EventPayload::HttpsConnect {
        host,
        port,
        duration_ms: Some(started.elapsed().as_millis() as i64),
        error,
    });
}

/// Bidirectional byte relay with an idle cutoff.
async fn relay<A, B>(a: A, b: B, idle: Duration)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_buf = vec![0u8; 16 * 1024];
    let mut b_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = a_read.read(&mut a_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if b_write.write_all(&a_buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            read = b_read.read(&mut b_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if a_write.write_all(&b_buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            _ = tokio::time::sleep(idle) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;

    async fn started_proxy(dir: &std::path::Path) -> (ProxyHandle, crate::pipeline::PipelineHandle) {
        let config = Arc::new(Config::default());
        let store = FileStore::create(dir).unwrap();
        let log = store.open_session_log("proxy-test").unwrap();
        let (events, _join) = crate::pipeline::spawn(config.clone(), log, "s1".into());
        let pricing = Arc::new(PricingTable::default());
        let handle = start(config, pricing, events.clone()).await.unwrap();
        (handle, events)
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_loopback_port() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events) = started_proxy(dir.path()).await;
        assert_ne!(handle.port, 0);
        assert!(handle.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        handle.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_stop_completes_with_open_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events) = started_proxy(dir.path()).await;

        // A connection that never sends anything must not block shutdown
        let _stalled = TcpStream::connect(("127.0.0.1", handle.port)).await.unwrap();
        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_connect_to_unknown_authority_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events) = started_proxy(dir.path()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", handle.port)).await.unwrap();
        stream
            .write_all(b"CONNECT  HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(head.contains("400") || head.is_empty());

        handle.stop(Duration::from_millis(200)).await;
    }
}
