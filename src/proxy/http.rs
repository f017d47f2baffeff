// Request lifecycle: capture, forward, account, emit
//
// One code path serves plain proxy requests and requests decrypted inside a
// CONNECT tunnel. Bodies stream through unmodified in both directions while
// a bounded tee captures up to `max_body_size` bytes for the event. Event
// delivery is non-blocking; losing an event never stalls the wire.

use crate::classifier::{self, Classification};
use crate::config::Config;
use crate::error::ErrorCode;
use crate::events::{
    EventPayload, Headers, RateLimitInfo, RequestRecord, ResponseRecord, TokenMethod, TokenUsage,
    TraceEvent, WsDirection, WsState,
};
use crate::pipeline::PipelineHandle;
use crate::pricing::PricingTable;
use crate::proxy::tls::CertAuthority;
use crate::proxy::{sse, ws};
use crate::tokens;
use crate::util::{cap_body, now_millis};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Body type returned to the client on every path.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Where a request came from, deciding how its absolute URL is built.
#[derive(Debug, Clone)]
pub enum RequestOrigin {
    /// Absolute-form request straight at the proxy port.
    PlainHttp,
    /// Decrypted request inside a CONNECT tunnel to `authority`.
    Tunnel { authority: String },
}

/// State shared by every connection of one session.
pub struct ProxyShared {
    pub config: Arc<Config>,
    pub pricing: Arc<PricingTable>,
    pub events: PipelineHandle,
    pub client: reqwest::Client,
    pub ca: Arc<CertAuthority>,
    /// Every task the proxy spawns (connections, tunnels, relays) lands
    /// here so shutdown can drain and then force-close the stragglers.
    tasks: Mutex<tokio::task::JoinSet<()>>,
}

impl ProxyShared {
    pub fn new(
        config: Arc<Config>,
        pricing: Arc<PricingTable>,
        events: PipelineHandle,
        ca: Arc<CertAuthority>,
    ) -> anyhow::Result<Self> {
        // No global timeout: streamed responses may legitimately outlive any
        // fixed budget. The per-request header timeout is applied at send.
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.upstream_timeout_ms.min(30_000)))
            .pool_max_idle_per_host(10)
            // HTTP/1.1 end to end keeps framing symmetrical with the client side
            .http1_only();
        for (host, addr) in &config.resolve_overrides {
            builder = builder.resolve(host, *addr);
        }
        let client = builder.build()?;
        Ok(Self {
            config,
            pricing,
            events,
            client,
            ca,
            tasks: Mutex::new(tokio::task::JoinSet::new()),
        })
    }

    pub(crate) fn spawn_task<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap().spawn(future);
    }

    pub(crate) fn take_tasks(&self) -> tokio::task::JoinSet<()> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }

    fn emit(&self, correlation_id: String, payload: EventPayload) {
        self.events.emit(TraceEvent {
            timestamp: now_millis(),
            session_id: self.events.session_id().to_string(),
            correlation_id,
            payload,
        });
    }
}

/// Serve one proxied request end to end. Infallible: every failure maps to
/// an HTTP error response plus events.
pub async fn handle(
    shared: Arc<ProxyShared>,
    req: Request<Incoming>,
    origin: RequestOrigin,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let method = req.method().to_string();

    let Some((url, host, path)) = absolute_url(&req, &origin) else {
        return error_response(StatusCode::BAD_REQUEST, "malformed proxy request");
    };

    let classification = classifier::classify(&host, &path);
    let correlation_id = crate::events::generate_correlation_id();
    let request_headers = header_map(req.headers());

    if is_websocket_upgrade(req.headers()) {
        return handle_websocket(shared, req, url, correlation_id, started).await;
    }

    let capture_request = shared.config.capture_request_bodies
        && (classification.is_ai() || shared.config.capture_all_requests);
    let capture_limit = if capture_request {
        shared.config.max_body_size
    } else {
        0
    };

    // Tee the request body: bytes stream upstream in full while the capture
    // buffer keeps at most `max_body_size`
    let capture = Arc::new(Mutex::new(CaptureBuffer::new(capture_limit)));
    let body_is_empty = req.body().size_hint().exact() == Some(0);
    let (parts, body) = req.into_parts();

    let mut upstream = shared
        .client
        .request(
            reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET),
            &url,
        )
        .headers(forwardable_headers(&parts.headers));
    if !body_is_empty {
        upstream = upstream.body(reqwest::Body::wrap_stream(TeeRequestBody {
            incoming: body,
            capture: capture.clone(),
        }));
    }

    let response = tokio::time::timeout(
        Duration::from_millis(shared.config.upstream_timeout_ms),
        upstream.send(),
    )
    .await;

    // Request event first, whatever happened to the upstream: by now the
    // body has either been streamed or the attempt is over
    let (request_payload, request_model) = {
        let capture = capture.lock().unwrap();
        build_request_event(&classification, &method, &url, request_headers, &capture)
    };
    let request_body_capture = capture.lock().unwrap().contents();
    shared.emit(correlation_id.clone(), request_payload);

    let response = match response {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            emit_failed_response(
                &shared,
                &classification,
                &correlation_id,
                request_model,
                started,
                &error.to_string(),
            );
            return error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
        Err(_) => {
            emit_failed_response(
                &shared,
                &classification,
                &correlation_id,
                request_model,
                started,
                "upstream timeout",
            );
            return error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timeout");
        }
    };

    let status = response.status();
    let response_headers = header_map_reqwest(response.headers());
    let rate_limit = parse_rate_limits(&response_headers);
    let content_type = response_headers
        .get("content-type")
        .cloned()
        .unwrap_or_default();

    let capture_response = shared.config.capture_response_bodies
        && (classification.is_ai() || shared.config.capture_all_requests);
    let response_capture_limit = if capture_response {
        shared.config.max_body_size
    } else {
        0
    };

    let finalizer = ResponseFinalizer {
        shared: shared.clone(),
        classification,
        parent_correlation_id: correlation_id,
        request_model,
        request_body: request_body_capture,
        status: status.as_u16(),
        headers: response_headers.clone(),
        rate_limit,
        is_sse: sse::is_sse_content_type(&content_type),
        started,
        capture: CaptureBuffer::new(response_capture_limit),
        done: false,
    };

    let stream = CaptureStream {
        inner: response.bytes_stream().boxed(),
        finalizer: Some(finalizer),
    };

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in &response_headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = StreamBody::new(stream.map(|result| result.map(Frame::data)));
    builder
        .body(UnsyncBoxBody::new(body))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build"))
}

// ---------------------------------------------------------------------------
// Capture plumbing
// ---------------------------------------------------------------------------

/// Bounded capture of one body direction; counts the full size regardless.
pub struct CaptureBuffer {
    limit: usize,
    data: Vec<u8>,
    total: u64,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.data.len());
        if room > 0 {
            self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn contents(&self) -> Option<String> {
        if self.limit == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&self.data).into_owned())
    }

    /// Capture fields for the event: (body, truncated, original_size).
    fn record_fields(&self) -> (Option<String>, Option<bool>, Option<u64>) {
        if self.limit == 0 {
            return (None, None, None);
        }
        let capped = cap_body(&self.data, self.limit);
        (
            Some(capped.text),
            Some(self.total > self.limit as u64),
            Some(self.total),
        )
    }
}

/// Streams the client's request body upstream, tee-ing into the capture.
struct TeeRequestBody {
    incoming: Incoming,
    capture: Arc<Mutex<CaptureBuffer>>,
}

impl Stream for TeeRequestBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.incoming).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        self.capture.lock().unwrap().push(&data);
                        return Poll::Ready(Some(Ok(data)));
                    }
                    // Trailers: nothing to forward through reqwest
                }
                Poll::Ready(Some(Err(error))) => {
                    return Poll::Ready(Some(Err(std::io::Error::other(error))))
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Streams the upstream response to the client, tee-ing into the capture and
/// emitting the response event exactly once at stream end (or on abandonment
/// when the client disconnects mid-body).
struct CaptureStream {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    finalizer: Option<ResponseFinalizer>,
}

impl Stream for CaptureStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(finalizer) = self.finalizer.as_mut() {
                    finalizer.capture.push(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                if let Some(mut finalizer) = self.finalizer.take() {
                    finalizer.finish(false, Some(error.to_string()));
                }
                Poll::Ready(Some(Err(std::io::Error::other(error))))
            }
            Poll::Ready(None) => {
                if let Some(mut finalizer) = self.finalizer.take() {
                    finalizer.finish(true, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        // Client went away before the body completed
        if let Some(mut finalizer) = self.finalizer.take() {
            finalizer.finish(false, None);
        }
    }
}

/// Everything needed to emit the response event when the stream settles.
struct ResponseFinalizer {
    shared: Arc<ProxyShared>,
    classification: Classification,
    parent_correlation_id: String,
    request_model: Option<String>,
    request_body: Option<String>,
    status: u16,
    headers: Headers,
    rate_limit: Option<RateLimitInfo>,
    is_sse: bool,
    started: Instant,
    capture: CaptureBuffer,
    done: bool,
}

impl ResponseFinalizer {
    fn finish(&mut self, complete: bool, error: Option<String>) {
        if self.done {
            return;
        }
        self.done = true;

        let duration_ms = self.started.elapsed().as_millis() as i64;
        let (raw_body, body_truncated, body_original_size) = self.capture.record_fields();

        let payload = match self.classification {
            Classification::Ai { provider } => {
                let (body, response_json) = self.interpret_ai_body(raw_body);
                let model = self
                    .request_model
                    .clone()
                    .or_else(|| {
                        response_json
                            .as_ref()
                            .and_then(classifier::model_from_response)
                    })
                    .unwrap_or_default();
                let usage = self.account_tokens(provider, response_json.as_ref(), body.as_deref());
                let cost = if model.is_empty() {
                    None
                } else {
                    self.shared.pricing.cost(provider, &model, &usage)
                };

                EventPayload::AiResponse {
                    provider: provider.to_string(),
                    model,
                    usage,
                    cost,
                    rate_limit: self.rate_limit.clone(),
                    response: ResponseRecord {
                        parent_correlation_id: Some(self.parent_correlation_id.clone()),
                        status: self.status,
                        headers: std::mem::take(&mut self.headers),
                        body,
                        body_truncated,
                        body_original_size,
                        truncated: (!complete).then_some(true),
                        duration_ms: Some(duration_ms),
                        error,
                    },
                }
            }
            Classification::Other => EventPayload::HttpResponse {
                response: ResponseRecord {
                    parent_correlation_id: Some(self.parent_correlation_id.clone()),
                    status: self.status,
                    headers: std::mem::take(&mut self.headers),
                    body: raw_body,
                    body_truncated,
                    body_original_size,
                    truncated: (!complete).then_some(true),
                    duration_ms: Some(duration_ms),
                    error,
                },
            },
        };

        self.shared
            .emit(crate::events::generate_correlation_id(), payload);
    }

    /// For SSE streams, assemble the logical message; otherwise parse the
    /// captured body as JSON. Returns (event body, parsed response JSON).
    fn interpret_ai_body(
        &self,
        raw_body: Option<String>,
    ) -> (Option<String>, Option<serde_json::Value>) {
        let Some(raw) = raw_body else {
            return (None, None);
        };
        if self.is_sse {
            let assembly = sse::assemble(&raw);
            if assembly.event_count > 0 {
                let json = assembly.to_response_json();
                // The event carries the concatenated assistant message, not
                // the wire chunks
                let body = cap_body(assembly.text.as_bytes(), self.shared.config.max_body_size);
                return (Some(body.text), Some(json));
            }
        }
        let json = serde_json::from_str(&raw).ok();
        (Some(raw), json)
    }

    /// §4.3 strategy: exact from the body, else approximate via the
    /// estimator, else chars/4 fallback.
    fn account_tokens(
        &self,
        provider: &str,
        response_json: Option<&serde_json::Value>,
        response_body: Option<&str>,
    ) -> TokenUsage {
        if let Some(json) = response_json {
            if let Some(usage) = classifier::usage_from_response(provider, json) {
                return usage;
            }
        }

        let response_text = response_json
            .map(classifier::response_text)
            .filter(|text| !text.is_empty())
            .or_else(|| response_body.map(String::from))
            .unwrap_or_default();

        match self
            .request_body
            .as_deref()
            .and_then(|body| serde_json::from_str::<serde_json::Value>(body).ok())
        {
            Some(request_json) => {
                let input = tokens::estimate_tokens(&tokens::request_text(&request_json));
                let output = tokens::estimate_tokens(&response_text);
                TokenUsage::new(input, output, TokenMethod::Approximate)
            }
            None => {
                let input = tokens::fallback_tokens(self.request_body.as_deref().unwrap_or(""));
                let output = tokens::fallback_tokens(&response_text);
                TokenUsage::new(input, output, TokenMethod::Fallback)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event construction helpers
// ---------------------------------------------------------------------------

/// Build the request event; returns (payload, extracted model).
fn build_request_event(
    classification: &Classification,
    method: &str,
    url: &str,
    headers: Headers,
    capture: &CaptureBuffer,
) -> (EventPayload, Option<String>) {
    let (body, body_truncated, body_original_size) = capture.record_fields();

    let record = RequestRecord {
        method: method.to_string(),
        url: url.to_string(),
        headers: headers.clone(),
        body,
        body_truncated,
        body_original_size,
    };

    match classification {
        Classification::Ai { provider } => {
            // Bounded parse: the capture never exceeds max_body_size
            let model = record
                .body
                .as_deref()
                .and_then(|body| serde_json::from_str::<serde_json::Value>(body).ok())
                .as_ref()
                .and_then(classifier::model_from_request);
            let api_key_hash = api_key_hash(&headers);
            (
                EventPayload::AiRequest {
                    provider: provider.to_string(),
                    model: model.clone(),
                    api_key_hash,
                    request: record,
                },
                model,
            )
        }
        Classification::Other => (EventPayload::HttpRequest { request: record }, None),
    }
}

fn emit_failed_response(
    shared: &ProxyShared,
    classification: &Classification,
    parent: &str,
    request_model: Option<String>,
    started: Instant,
    error: &str,
) {
    let record = ResponseRecord {
        parent_correlation_id: Some(parent.to_string()),
        status: 502,
        headers: Headers::new(),
        body: None,
        body_truncated: None,
        body_original_size: None,
        truncated: None,
        duration_ms: Some(started.elapsed().as_millis() as i64),
        error: Some(error.to_string()),
    };
    let payload = match classification {
        Classification::Ai { provider } => EventPayload::AiResponse {
            provider: provider.to_string(),
            model: request_model.unwrap_or_default(),
            usage: TokenUsage::new(0, 0, TokenMethod::Fallback),
            cost: None,
            rate_limit: None,
            response: record,
        },
        Classification::Other => EventPayload::HttpResponse { response: record },
    };
    shared.emit(crate::events::generate_correlation_id(), payload);
}

// ---------------------------------------------------------------------------
// WebSocket relay
// ---------------------------------------------------------------------------

fn is_websocket_upgrade(headers: &hyper::HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Forward a WebSocket handshake and, on 101, relay frames both ways while
/// scanning them into `ws_message` events.
async fn handle_websocket(
    shared: Arc<ProxyShared>,
    mut req: Request<Incoming>,
    url: String,
    correlation_id: String,
    started: Instant,
) -> Response<ProxyBody> {
    shared.emit(
        correlation_id.clone(),
        EventPayload::WsConnection {
            url: url.clone(),
            state: WsState::Connecting,
            duration_ms: None,
        },
    );

    let on_upgrade = hyper::upgrade::on(&mut req);
    let mut headers = forwardable_headers(req.headers());
    // The upgrade negotiation headers must survive forwarding
    for name in ["connection", "upgrade"] {
        if let Some(value) = req.headers().get(name) {
            headers.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.clone(),
            );
        }
    }

    let upstream = shared
        .client
        .get(&url.replace("wss://", "https://").replace("ws://", "http://"))
        .headers(headers)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(error) => {
            shared.emit(
                correlation_id.clone(),
                EventPayload::WsConnection {
                    url,
                    state: WsState::Error,
                    duration_ms: Some(started.elapsed().as_millis() as i64),
                },
            );
            shared.emit(
                crate::events::generate_correlation_id(),
                EventPayload::Error {
                    code: ErrorCode::UpstreamConnectFailed,
                    message: error.to_string(),
                    context: Some("websocket handshake".into()),
                },
            );
            return error_response(StatusCode::BAD_GATEWAY, "websocket handshake failed");
        }
    };

    if upstream.status() != reqwest::StatusCode::SWITCHING_PROTOCOLS {
        let status = upstream.status().as_u16();
        shared.emit(
            correlation_id,
            EventPayload::WsConnection {
                url,
                state: WsState::Error,
                duration_ms: Some(started.elapsed().as_millis() as i64),
            },
        );
        let body = upstream.bytes().await.unwrap_or_default();
        return Response::builder()
            .status(status)
            .body(full_body(body))
            .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "websocket refusal"));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream.headers() {
        response = response.header(name, value);
    }
    let response = response
        .body(empty_body())
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "websocket response"));

    // Relay in the background once both sides have switched protocols
    let task_shared = shared.clone();
    task_shared.spawn_task(async move {
        let client_io = match on_upgrade.await {
            Ok(upgraded) => hyper_util::rt::TokioIo::new(upgraded),
            Err(error) => {
                tracing::debug!("client websocket upgrade failed: {error}");
                return;
            }
        };
        let upstream_io = match upstream.upgrade().await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                tracing::debug!("upstream websocket upgrade failed: {error}");
                return;
            }
        };

        shared.emit(
            correlation_id.clone(),
            EventPayload::WsConnection {
                url: url.clone(),
                state: WsState::Open,
                duration_ms: None,
            },
        );

        relay_websocket(&shared, client_io, upstream_io).await;

        shared.emit(
            correlation_id,
            EventPayload::WsConnection {
                url,
                state: WsState::Closed,
                duration_ms: Some(started.elapsed().as_millis() as i64),
            },
        );
    });

    response
}

/// Copy bytes both ways, scanning each direction for complete frames.
async fn relay_websocket<A, B>(shared: &Arc<ProxyShared>, client: A, upstream: B)
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let idle = Duration::from_millis(shared.config.idle_tunnel_timeout_ms);
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut sent_scanner = ws::FrameScanner::new(shared.config.max_body_size);
    let mut recv_scanner = ws::FrameScanner::new(shared.config.max_body_size);
    let mut client_buf = vec![0u8; 16 * 1024];
    let mut upstream_buf = vec![0u8; 16 * 1024];

    loop {
        let frames = tokio::select! {
            read = client_read.read(&mut client_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if upstream_write.write_all(&client_buf[..n]).await.is_err() {
                        break;
                    }
                    sent_scanner
                        .feed(&client_buf[..n])
                        .into_iter()
                        .map(|frame| (WsDirection::Sent, frame))
                        .collect::<Vec<_>>()
                }
            },
            read = upstream_read.read(&mut upstream_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&upstream_buf[..n]).await.is_err() {
                        break;
                    }
                    recv_scanner
                        .feed(&upstream_buf[..n])
                        .into_iter()
                        .map(|frame| (WsDirection::Received, frame))
                        .collect::<Vec<_>>()
                }
            },
            _ = tokio::time::sleep(idle) => break,
        };

        for (direction, frame) in frames {
            if !frame.is_data() {
                continue;
            }
            let body = frame.text();
            let body_truncated = body.as_ref().map(|_| frame.capture_truncated);
            shared.emit(
                crate::events::generate_correlation_id(),
                EventPayload::WsMessage {
                    direction,
                    size_bytes: frame.payload_len,
                    body,
                    body_truncated,
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Header and URL helpers
// ---------------------------------------------------------------------------

/// Build the absolute URL plus (host, path) for classification.
fn absolute_url(
    req: &Request<Incoming>,
    origin: &RequestOrigin,
) -> Option<(String, String, String)> {
    match origin {
        RequestOrigin::Tunnel { authority } => {
            let host = authority
                .strip_suffix(":443")
                .unwrap_or(authority)
                .to_string();
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            Some((
                format!("https://{host}{path_and_query}"),
                host,
                req.uri().path().to_string(),
            ))
        }
        RequestOrigin::PlainHttp => {
            if req.uri().scheme().is_some() {
                let host = req.uri().authority()?.host().to_string();
                Some((req.uri().to_string(), host, req.uri().path().to_string()))
            } else {
                // Origin-form fallback: reconstruct from the Host header
                let host = req.headers().get("host")?.to_str().ok()?.to_string();
                let path_and_query = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                let bare_host = host.split(':').next().unwrap_or(&host).to_string();
                Some((
                    format!("http://{host}{path_and_query}"),
                    bare_host,
                    req.uri().path().to_string(),
                ))
            }
        }
    }
}

/// Capture every header into the sorted event map; repeats join with ", ".
fn header_map(headers: &hyper::HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

fn header_map_reqwest(headers: &reqwest::header::HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// Headers safe to forward upstream (hop-by-hop and proxy headers dropped).
fn forwardable_headers(headers: &hyper::HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name == "host" {
            continue;
        }
        if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) {
            out.append(name, value.clone());
        }
    }
    out
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "proxy-authorization"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// First 16 hex chars of SHA-256 over the API key header, if one exists.
/// The hash lets multiple sessions with the same key be grouped without the
/// key itself ever being stored.
fn api_key_hash(headers: &Headers) -> Option<String> {
    let key = headers
        .get("x-api-key")
        .or_else(|| headers.get("authorization"))?;
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    Some(format!("{hash:x}")[..16].to_string())
}

/// Rate limit headers across providers: anthropic-ratelimit-* and the
/// x-ratelimit-* family.
fn parse_rate_limits(headers: &Headers) -> Option<RateLimitInfo> {
    let get = |names: &[&str]| -> Option<u64> {
        names
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|value| value.parse().ok())
    };

    let info = RateLimitInfo {
        requests_remaining: get(&[
            "anthropic-ratelimit-requests-remaining",
            "x-ratelimit-remaining-requests",
        ]),
        requests_limit: get(&[
            "anthropic-ratelimit-requests-limit",
            "x-ratelimit-limit-requests",
        ]),
        tokens_remaining: get(&[
            "anthropic-ratelimit-tokens-remaining",
            "x-ratelimit-remaining-tokens",
        ]),
        tokens_limit: get(&[
            "anthropic-ratelimit-tokens-limit",
            "x-ratelimit-limit-tokens",
        ]),
    };
    (!info.is_empty()).then_some(info)
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(message.to_string()))
        .expect("static error response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_buffer_counts_full_size() {
        let mut capture = CaptureBuffer::new(10);
        capture.push(b"0123456789ABCDEF");
        assert_eq!(capture.total(), 16);
        let (body, truncated, original) = capture.record_fields();
        assert_eq!(body.as_deref(), Some("0123456789"));
        assert_eq!(truncated, Some(true));
        assert_eq!(original, Some(16));
    }

    #[test]
    fn test_capture_buffer_exact_limit_not_truncated() {
        let mut capture = CaptureBuffer::new(4);
        capture.push(b"abcd");
        let (body, truncated, original) = capture.record_fields();
        assert_eq!(body.as_deref(), Some("abcd"));
        assert_eq!(truncated, Some(false));
        assert_eq!(original, Some(4));
    }

    #[test]
    fn test_zero_limit_captures_nothing() {
        let mut capture = CaptureBuffer::new(0);
        capture.push(b"data");
        assert_eq!(capture.record_fields(), (None, None, None));
        assert_eq!(capture.total(), 4);
    }

    #[test]
    fn test_api_key_hash_prefers_x_api_key_and_is_short() {
        let headers = Headers::from([
            ("x-api-key".to_string(), "sk-secret".to_string()),
            ("authorization".to_string(), "Bearer other".to_string()),
        ]);
        let hash = api_key_hash(&headers).unwrap();
        assert_eq!(hash.len(), 16);
        assert!(!hash.contains("secret"));

        let same = api_key_hash(&Headers::from([(
            "x-api-key".to_string(),
            "sk-secret".to_string(),
        )]))
        .unwrap();
        assert_eq!(hash, same);
    }

    #[test]
    fn test_rate_limit_parsing_anthropic_and_openai_names() {
        let headers = Headers::from([
            (
                "anthropic-ratelimit-requests-remaining".to_string(),
                "99".to_string(),
            ),
            (
                "anthropic-ratelimit-tokens-limit".to_string(),
                "80000".to_string(),
            ),
        ]);
        let info = parse_rate_limits(&headers).unwrap();
        assert_eq!(info.requests_remaining, Some(99));
        assert_eq!(info.tokens_limit, Some(80000));

        let headers = Headers::from([(
            "x-ratelimit-remaining-requests".to_string(),
            "5".to_string(),
        )]);
        assert_eq!(
            parse_rate_limits(&headers).unwrap().requests_remaining,
            Some(5)
        );

        assert!(parse_rate_limits(&Headers::new()).is_none());
    }

    #[test]
    fn test_hop_by_hop_headers_not_forwarded() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("host", "example.com".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("content-length", "42".parse().unwrap());

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get("connection").is_none());
        assert!(forwarded.get("transfer-encoding").is_none());
        assert!(forwarded.get("host").is_none());
        assert_eq!(forwarded.get("content-type").unwrap(), "application/json");
        assert_eq!(forwarded.get("content-length").unwrap(), "42");
    }

    #[test]
    fn test_header_map_joins_repeats_sorted() {
        let mut headers = hyper::HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());

        let map = header_map(&headers);
        assert_eq!(map["set-cookie"], "a=1, b=2");
        // BTreeMap iterates sorted
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["accept".to_string(), "set-cookie".to_string()]);
    }
}
