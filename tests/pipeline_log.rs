// End-to-end pipeline properties: events in, well-formed JSONL log out.
//
// These tests drive the pipeline + file store with fabricated captures and
// check the log-level guarantees a reader of the format depends on.

use agent_trace::config::{Config, REDACTION_MARKER};
use agent_trace::events::{
    EventPayload, Headers, RequestRecord, ResponseRecord, SessionStatus, SessionSummary,
    TokenMethod, TokenUsage, TraceEvent,
};
use agent_trace::pipeline;
use agent_trace::store::FileStore;
use std::sync::Arc;

fn read_lines(store: &FileStore, stem: &str) -> Vec<serde_json::Value> {
    let path = store.root().join("sessions").join(format!("{stem}.jsonl"));
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line is valid JSON"))
        .collect()
}

fn ai_request(handle: &pipeline::PipelineHandle, body: &str) -> TraceEvent {
    handle.make_event(EventPayload::AiRequest {
        provider: "example-ai".into(),
        model: Some("m-1".into()),
        api_key_hash: None,
        request: RequestRecord {
            method: "POST".into(),
            url: "https://api.example-ai.com/v1/messages".into(),
            headers: Headers::from([
                ("authorization".to_string(), "Bearer sk-abc123".to_string()),
                ("x-api-key".to_string(), "secret".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ]),
            body: Some(body.to_string()),
            body_truncated: Some(false),
            body_original_size: Some(body.len() as u64),
        },
    })
}

fn ai_response(handle: &pipeline::PipelineHandle, parent: &str) -> TraceEvent {
    handle.make_event(EventPayload::AiResponse {
        provider: "example-ai".into(),
        model: "m-1".into(),
        usage: TokenUsage::new(10, 5, TokenMethod::Exact),
        cost: Some(agent_trace::events::CostRecord {
            input: 0.00003,
            output: 0.000075,
            total: 0.000105,
            currency: "USD".into(),
            last_updated: Some("2025-01-01".into()),
        }),
        rate_limit: None,
        response: ResponseRecord {
            parent_correlation_id: Some(parent.to_string()),
            status: 200,
            headers: Headers::new(),
            body: Some("{\"content\":\"hi\"}".into()),
            body_truncated: Some(false),
            body_original_size: Some(16),
            truncated: None,
            duration_ms: None,
            error: None,
        },
    })
}

#[tokio::test]
async fn happy_path_session_log_is_well_formed() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();
    let log = store.open_session_log("happy").unwrap();
    let config = Arc::new(Config::default());
    let (handle, join) = pipeline::spawn(config.clone(), log, "session-1".into());

    handle.emit_payload(EventPayload::SessionStart {
        prompt: "fix the tests".into(),
        agent_version: "agent 1.2.3".into(),
        working_directory: "/work".into(),
        tags: vec!["ci".into()],
        config_snapshot: config.snapshot(),
    });

    let request = ai_request(&handle, r#"{"model":"m-1","messages":[]}"#);
    let request_id = request.correlation_id.clone();
    handle.emit(request);
    handle.emit(ai_response(&handle, &request_id));

    let summary = handle.flush().await.unwrap();
    handle.emit_payload(EventPayload::SessionEnd {
        duration_ms: 1234,
        status: SessionStatus::Completed,
        summary,
    });
    drop(handle);
    let result = join.await.unwrap();
    assert!(!result.failed);

    let lines = read_lines(&store, "happy");
    assert_eq!(lines.len(), 4);

    // Envelope invariants hold on every line
    for line in &lines {
        assert!(line["kind"].is_string());
        assert!(line["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(line["session_id"], "session-1");
        assert!(line["correlation_id"].is_string());
    }

    // Lifecycle brackets
    assert_eq!(lines.first().unwrap()["kind"], "session_start");
    assert_eq!(lines.last().unwrap()["kind"], "session_end");

    // Timestamps non-decreasing after ordering
    let stamps: Vec<i64> = lines.iter().map(|l| l["timestamp"].as_i64().unwrap()).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    // Every ai_response's parent is an earlier ai_request
    let response = lines.iter().find(|l| l["kind"] == "ai_response").unwrap();
    let parent = response["parent_correlation_id"].as_str().unwrap();
    let request_index = lines
        .iter()
        .position(|l| l["correlation_id"] == parent && l["kind"] == "ai_request")
        .expect("parent request exists");
    let response_index = lines.iter().position(|l| l["kind"] == "ai_response").unwrap();
    assert!(request_index < response_index);
    assert!(
        lines[request_index]["timestamp"].as_i64().unwrap()
            <= lines[response_index]["timestamp"].as_i64().unwrap()
    );

    // Cost arithmetic
    let cost = &response["cost"];
    let total = cost["total"].as_f64().unwrap();
    let parts = cost["input"].as_f64().unwrap() + cost["output"].as_f64().unwrap();
    assert!((total - parts).abs() < 1e-9);
    assert_eq!(response["usage"]["method"], "exact");
}

#[tokio::test]
async fn sensitive_headers_never_reach_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();
    let log = store.open_session_log("redact").unwrap();
    let (handle, join) = pipeline::spawn(Arc::new(Config::default()), log, "s".into());

    handle.emit(ai_request(&handle, "{}"));
    drop(handle);
    join.await.unwrap();

    let lines = read_lines(&store, "redact");
    let headers = &lines[0]["headers"];
    assert_eq!(headers["authorization"], REDACTION_MARKER);
    assert_eq!(headers["x-api-key"], REDACTION_MARKER);
    assert_eq!(headers["content-type"], "application/json");

    let raw = serde_json::to_string(&lines).unwrap();
    assert!(!raw.contains("sk-abc123"));
    assert!(!raw.contains("secret"));
}

#[tokio::test]
async fn parse_and_reserialize_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();
    let log = store.open_session_log("roundtrip").unwrap();
    let (handle, join) = pipeline::spawn(Arc::new(Config::default()), log, "s".into());

    let request = ai_request(&handle, r#"{"model":"m-1"}"#);
    let request_id = request.correlation_id.clone();
    handle.emit(request);
    handle.emit(ai_response(&handle, &request_id));
    drop(handle);
    join.await.unwrap();

    let path = store.root().join("sessions").join("roundtrip.jsonl");
    for line in std::fs::read_to_string(path).unwrap().lines() {
        let event: TraceEvent = serde_json::from_str(line).unwrap();
        let reserialized = serde_json::to_string(&event).unwrap();
        let a: serde_json::Value = serde_json::from_str(line).unwrap();
        let b: serde_json::Value = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(a, b, "field-set equality after a parse/serialize cycle");
    }
}

#[tokio::test]
async fn duplicate_capture_of_one_request_appends_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();
    let log = store.open_session_log("dedupe").unwrap();
    let (handle, join) = pipeline::spawn(Arc::new(Config::default()), log, "s".into());

    // Same request visible via the proxy and the telemetry path
    let event = ai_request(&handle, r#"{"model":"m-1","messages":[]}"#);
    let mut twin = event.clone();
    twin.correlation_id = format!("{}-twin", event.correlation_id);
    handle.emit(event);
    handle.emit(twin);
    drop(handle);
    join.await.unwrap();

    assert_eq!(read_lines(&store, "dedupe").len(), 1);
}

#[tokio::test]
async fn index_updates_atomically_per_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path()).unwrap();

    let mut summary = SessionSummary::default();
    summary.total_requests = 3;
    summary.total_cost = Some(0.5);
    summary.currency = Some("USD".into());

    let config = Config {
        session_id: Some("idx-1".into()),
        ..Config::default()
    };
    let session = agent_trace::session::Session::create(&config, "v1".into());
    store.update_index(session.index_entry(&summary)).unwrap();

    let index = store.read_index();
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].id, "idx-1");
    assert_eq!(index[0].total_requests, 3);
    assert_eq!(index[0].total_cost, Some(0.5));
    assert!(index[0].ended_at.is_some());
}
