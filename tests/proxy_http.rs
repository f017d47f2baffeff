// Drive the real proxy engine against a local mock upstream and assert the
// captured exchanges land in the session log intact.
//
// The AI tests pin api.example-ai.com to the mock's loopback address so the
// full classify -> capture -> account -> price path runs exactly as it does
// against a real provider, minus DNS.

use agent_trace::config::Config;
use agent_trace::pipeline;
use agent_trace::pricing::PricingTable;
use agent_trace::proxy;
use agent_trace::store::FileStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One-shot upstream: reads a request, replies with a fixed body, records
/// how many body bytes it received.
async fn mock_upstream(
    content_type: &'static str,
    response_body: &'static str,
) -> (u16, tokio::task::JoinHandle<usize>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut body_len = 0usize;
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(head_end) = find_head_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..head_end]);
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                body_len = buf.len() - head_end;
                if body_len >= content_length {
                    body_len = content_length;
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            content_type,
            response_body.len(),
            response_body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
        body_len
    });
    (port, handle)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

/// Pricing table file with the (example-ai, m-1) entry the AI scenarios use.
fn write_pricing(dir: &Path) -> PathBuf {
    let path = dir.join("pricing-overrides.toml");
    std::fs::write(
        &path,
        concat!(
            "[[model]]\n",
            "provider = \"example-ai\"\n",
            "model = \"m-1\"\n",
            "input_per_1k = 0.003\n",
            "output_per_1k = 0.015\n",
            "currency = \"USD\"\n",
            "last_updated = \"2025-11-24\"\n",
        ),
    )
    .unwrap();
    path
}

/// Proxy + pipeline wired for AI capture: the example provider's host is
/// pinned to loopback and the pricing table comes from `write_pricing`.
async fn ai_proxy_session(
    dir: &Path,
    stem: &str,
) -> (
    FileStore,
    pipeline::PipelineHandle,
    tokio::task::JoinHandle<pipeline::PipelineResult>,
    proxy::ProxyHandle,
) {
    let store = FileStore::create(dir).unwrap();
    let log = store.open_session_log(stem).unwrap();
    let pricing_path = write_pricing(dir);
    let config = Arc::new(Config {
        order_window_ms: 5,
        resolve_overrides: vec![("api.example-ai.com".into(), "127.0.0.1:0".parse().unwrap())],
        ..Config::default()
    });
    let (events, join) = pipeline::spawn(config.clone(), log, stem.into());
    let pricing = Arc::new(PricingTable::load(&[pricing_path]).unwrap());
    let proxy = proxy::start(config, pricing, events.clone()).await.unwrap();
    (store, events, join, proxy)
}

/// Absolute-form POST to the example provider through the proxy; the URL
/// carries the mock's port because the DNS pin only rewrites the address.
async fn post_messages_via_proxy(proxy_port: u16, upstream_port: u16, body: &str) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let request = format!(
        "POST http://api.example-ai.com:{upstream_port}/v1/messages HTTP/1.1\r\nHost: api.example-ai.com:{upstream_port}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

/// Drain everything and parse the finished log.
async fn settle_and_read(
    store: &FileStore,
    stem: &str,
    events: pipeline::PipelineHandle,
    join: tokio::task::JoinHandle<pipeline::PipelineResult>,
    proxy: proxy::ProxyHandle,
) -> Vec<serde_json::Value> {
    proxy.stop(Duration::from_millis(500)).await;
    events.flush().await.unwrap();
    drop(events);
    join.await.unwrap();
    std::fs::read_to_string(store.root().join("sessions").join(format!("{stem}.jsonl")))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn plain_http_exchange_is_captured_and_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();
    let log = store.open_session_log("proxy-e2e").unwrap();

    let config = Arc::new(Config {
        capture_all_requests: true,
        order_window_ms: 5,
        ..Config::default()
    });
    let (events, pipeline_join) = pipeline::spawn(config.clone(), log, "e2e".into());
    let pricing = Arc::new(PricingTable::default());
    let proxy = proxy::start(config, pricing, events.clone()).await.unwrap();

    let (upstream_port, upstream) = mock_upstream("application/json", "{\"pong\":true}").await;

    // Absolute-form proxy request with a body larger than nothing
    let request_body = "ping-ping-ping";
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await.unwrap();
    let request = format!(
        "POST http://127.0.0.1:{upstream_port}/echo HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{request_body}",
        request_body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response).to_string();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("{\"pong\":true}"));

    // Upstream saw the body byte-for-byte
    assert_eq!(upstream.await.unwrap(), request_body.len());

    let lines = settle_and_read(&store, "proxy-e2e", events, pipeline_join, proxy).await;

    let request_line = lines
        .iter()
        .find(|l| l["kind"] == "http_request")
        .expect("request captured");
    assert_eq!(request_line["method"], "POST");
    assert!(request_line["url"]
        .as_str()
        .unwrap()
        .ends_with(&format!("127.0.0.1:{upstream_port}/echo")));
    assert_eq!(request_line["body"], request_body);

    let response_line = lines
        .iter()
        .find(|l| l["kind"] == "http_response")
        .expect("response captured");
    assert_eq!(response_line["status"], 200);
    assert_eq!(response_line["body"], "{\"pong\":true}");
    assert_eq!(
        response_line["parent_correlation_id"],
        request_line["correlation_id"]
    );
    assert!(response_line["duration_ms"].as_i64().is_some());
}

#[tokio::test]
async fn oversized_body_is_truncated_in_capture_but_forwarded_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();
    let log = store.open_session_log("proxy-trunc").unwrap();

    let config = Arc::new(Config {
        capture_all_requests: true,
        max_body_size: 100,
        order_window_ms: 5,
        ..Config::default()
    });
    let (events, pipeline_join) = pipeline::spawn(config.clone(), log, "trunc".into());
    let proxy = proxy::start(config, Arc::new(PricingTable::default()), events.clone())
        .await
        .unwrap();

    let (upstream_port, upstream) = mock_upstream("application/json", "ok").await;

    let request_body = "x".repeat(250);
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await.unwrap();
    let request = format!(
        "POST http://127.0.0.1:{upstream_port}/big HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\ncontent-length: 250\r\nconnection: close\r\n\r\n{request_body}"
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();

    // Traffic forwarded in full even though capture is capped
    assert_eq!(upstream.await.unwrap(), 250);

    let lines = settle_and_read(&store, "proxy-trunc", events, pipeline_join, proxy).await;
    let request_line = lines.iter().find(|l| l["kind"] == "http_request").unwrap();
    assert_eq!(request_line["body"].as_str().unwrap().len(), 100);
    assert_eq!(request_line["body_truncated"], true);
    assert_eq!(request_line["body_original_size"], 250);
}

#[tokio::test]
async fn ai_exchange_computes_exact_usage_and_cost() {
    let dir = tempfile::tempdir().unwrap();
    let (store, events, join, proxy) = ai_proxy_session(dir.path(), "ai-happy").await;
    let (upstream_port, upstream) = mock_upstream(
        "application/json",
        "{\"model\":\"m-1\",\"usage\":{\"input_tokens\":10,\"output_tokens\":5},\"content\":\"hi\"}",
    )
    .await;

    let response = post_messages_via_proxy(
        proxy.port,
        upstream_port,
        "{\"model\":\"m-1\",\"messages\":[]}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    upstream.await.unwrap();

    let lines = settle_and_read(&store, "ai-happy", events, join, proxy).await;

    let request = lines
        .iter()
        .find(|l| l["kind"] == "ai_request")
        .expect("classified as ai_request");
    assert_eq!(request["provider"], "example-ai");
    assert_eq!(request["model"], "m-1");

    let response = lines
        .iter()
        .find(|l| l["kind"] == "ai_response")
        .expect("ai_response emitted");
    assert_eq!(response["provider"], "example-ai");
    assert_eq!(response["model"], "m-1");
    assert_eq!(response["usage"]["input_tokens"], 10);
    assert_eq!(response["usage"]["output_tokens"], 5);
    assert_eq!(response["usage"]["total_tokens"], 15);
    assert_eq!(response["usage"]["method"], "exact");

    let cost = &response["cost"];
    assert!((cost["input"].as_f64().unwrap() - 0.00003).abs() < 1e-12);
    assert!((cost["output"].as_f64().unwrap() - 0.000075).abs() < 1e-12);
    assert!((cost["total"].as_f64().unwrap() - 0.000105).abs() < 1e-12);
    assert_eq!(cost["currency"], "USD");
    assert_eq!(response["parent_correlation_id"], request["correlation_id"]);
}

#[tokio::test]
async fn streaming_ai_response_assembles_text_and_final_usage() {
    let sse_body = concat!(
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"m-1\",\"usage\":{\"input_tokens\":12}}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":8}}\n\n",
    );

    let dir = tempfile::tempdir().unwrap();
    let (store, events, join, proxy) = ai_proxy_session(dir.path(), "ai-sse").await;
    let (upstream_port, upstream) = mock_upstream("text/event-stream", sse_body).await;

    let response = post_messages_via_proxy(
        proxy.port,
        upstream_port,
        "{\"model\":\"m-1\",\"messages\":[],\"stream\":true}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    // The wire stream reaches the client untouched
    assert!(response.contains("text_delta"));
    upstream.await.unwrap();

    let lines = settle_and_read(&store, "ai-sse", events, join, proxy).await;

    let responses: Vec<_> = lines.iter().filter(|l| l["kind"] == "ai_response").collect();
    assert_eq!(responses.len(), 1, "one logical response per stream");
    let response = responses[0];
    assert_eq!(response["body"], "Hello");
    assert_eq!(response["usage"]["input_tokens"], 12);
    assert_eq!(response["usage"]["output_tokens"], 8);
    assert_eq!(response["usage"]["method"], "exact");
    assert!(response["duration_ms"].as_i64().unwrap() >= 0);
    // m-1 is priced, so the streamed exchange costs something too
    assert!(response["cost"].is_object());
}

#[tokio::test]
async fn unknown_model_yields_null_cost_and_no_error() {
    let dir = tempfile::tempdir().unwrap();
    let (store, events, join, proxy) = ai_proxy_session(dir.path(), "ai-nopricing").await;
    let (upstream_port, upstream) = mock_upstream(
        "application/json",
        "{\"model\":\"m-unknown\",\"usage\":{\"input_tokens\":3,\"output_tokens\":2},\"content\":\"hi\"}",
    )
    .await;

    let response = post_messages_via_proxy(
        proxy.port,
        upstream_port,
        "{\"model\":\"m-unknown\",\"messages\":[]}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    upstream.await.unwrap();

    let lines = settle_and_read(&store, "ai-nopricing", events, join, proxy).await;

    let response = lines
        .iter()
        .find(|l| l["kind"] == "ai_response")
        .expect("ai_response emitted");
    assert!(response["cost"].is_null(), "missing pricing is null, not zero");
    assert_eq!(response["usage"]["input_tokens"], 3);
    assert_eq!(response["usage"]["output_tokens"], 2);
    assert_eq!(response["usage"]["method"], "exact");
    assert!(
        !lines.iter().any(|l| l["kind"] == "error"),
        "a pricing miss is not an error"
    );
}
