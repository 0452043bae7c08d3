use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tokrelay_core::client::{
    BufferSink, ClientStreamReader, FragmentSink, INTERRUPTED_MARKER, STOPPED_MARKER, Transport,
};
use tokrelay_core::config::{Config, RoutingCfg};
use tokrelay_core::error::{ErrorBody, UpstreamErrorKind};
use tokrelay_core::provider_factory::UpstreamRegistry;
use tokrelay_core::relay::{Relay, RelaySettings};
use tokrelay_core::router::RoutingResolver;
use tokrelay_core::sse::DecodeBuffer;
use tokrelay_core::telemetry::{RelayTrace, TelemetrySink, set_telemetry_sink};
use tokrelay_core::upstream::Scripted;
use tokrelay_core::{GenerationRequest, StreamState, server};

#[derive(Default)]
struct Recorder(Mutex<Vec<RelayTrace>>);

impl TelemetrySink for Recorder {
    fn record(&self, trace: RelayTrace) {
        if let Ok(mut v) = self.0.lock() {
            v.push(trace);
        }
    }
}

fn recorder() -> Arc<Recorder> {
    static REC: OnceLock<Arc<Recorder>> = OnceLock::new();
    REC.get_or_init(|| {
        let rec = Arc::new(Recorder::default());
        set_telemetry_sink(rec.clone());
        rec
    })
    .clone()
}

async fn trace_for(request_id: &str) -> RelayTrace {
    let rec = recorder();
    for _ in 0..300 {
        let found = rec
            .0
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.request_id.as_deref() == Some(request_id))
            .cloned();
        if let Some(t) = found {
            return t;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no trace recorded for {request_id}");
}

/// Start a relay on an ephemeral port whose only upstream is `adapter`; returns the base URL.
async fn start_relay(adapter: Scripted, heartbeat: Duration) -> String {
    recorder();
    let cfg = Config {
        routing: RoutingCfg {
            default: "test".into(),
            rules: vec![],
        },
        ..Config::default()
    };
    let registry = UpstreamRegistry::default().with("test", Arc::new(adapter));
    let router = RoutingResolver::new(&cfg).unwrap();
    let settings = RelaySettings {
        heartbeat,
        ..RelaySettings::from(&cfg)
    };
    let relay = Arc::new(Relay::new(registry, router, settings));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, relay, std::future::pending()));
    format!("http://{addr}")
}

fn request(prompt: &str, id: &str) -> GenerationRequest {
    let mut req = GenerationRequest::new(prompt, "m");
    req.request_id = Some(id.to_string());
    req
}

/// Forwards each fragment to the test so it can react mid-stream.
struct ChannelSink(mpsc::UnboundedSender<String>);

impl FragmentSink for ChannelSink {
    fn on_fragment(&mut self, text: &str) {
        let _ = self.0.send(text.to_string());
    }
}

const SLOW: Duration = Duration::from_secs(15);

#[tokio::test]
async fn hello_there_completes() {
    let base = start_relay(Scripted::fragments(["He", "llo", " there"]), SLOW).await;
    let sink = BufferSink::new();
    let reader = ClientStreamReader::new(format!("{base}/api/stream")).unwrap();
    let state = reader.start(request("say hello", "e2e-hello"), sink.clone()).join().await;

    assert_eq!(state, StreamState::Completed);
    assert_eq!(sink.text(), "Hello there");

    let trace = trace_for("e2e-hello").await;
    assert_eq!(trace.state.as_deref(), Some("completed"));
    assert_eq!(trace.provider.as_deref(), Some("scripted"));
    assert_eq!(trace.fragments, 3);
    assert!(trace.streamed);
}

#[tokio::test]
async fn cancel_after_first_fragment_aborts_upstream() {
    let fragments: Vec<String> = std::iter::once("He".to_string())
        .chain((0..20).map(|i| format!(" {i}")))
        .collect();
    let adapter = Scripted::fragments(fragments).with_delay(Duration::from_millis(100));
    let probe = adapter.probe();
    let base = start_relay(adapter, SLOW).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ClientStreamReader::new(format!("{base}/api/stream"))
        .unwrap()
        .start(request("go", "e2e-cancel"), ChannelSink(tx));

    assert_eq!(rx.recv().await.as_deref(), Some("He"));
    handle.cancel();
    assert_eq!(handle.join().await, StreamState::Aborted);

    let mut seen = Vec::new();
    while let Ok(text) = rx.try_recv() {
        seen.push(text);
    }
    assert_eq!(seen, vec![format!("\n{STOPPED_MARKER}")]);

    let trace = trace_for("e2e-cancel").await;
    assert_eq!(trace.state.as_deref(), Some("aborted"));
    assert!(probe.was_cancelled());
    assert!(probe.emitted() < 21, "upstream kept producing after disconnect");
}

#[tokio::test]
async fn first_call_network_error_is_json_500() {
    let adapter = Scripted::fragments(["never"]).fail_on_open(UpstreamErrorKind::Network, "connection refused");
    let base = start_relay(adapter, SLOW).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/stream"))
        .header("x-request-id", "e2e-500")
        .json(&serde_json::json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let ctype = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(ctype.starts_with("application/json"), "got {ctype}");
    let body: ErrorBody = resp.json().await.unwrap();
    assert_eq!(body.error, "connection refused");

    let trace = trace_for("e2e-500").await;
    assert_eq!(trace.state.as_deref(), Some("failed"));
    assert_eq!(trace.error_kind.as_deref(), Some("network"));
    assert!(!trace.streamed);
}

#[tokio::test]
async fn invalid_requests_are_400() {
    let base = start_relay(Scripted::echo(), SLOW).await;
    let http = reqwest::Client::new();

    let blank = http
        .post(format!("{base}/api/stream"))
        .json(&serde_json::json!({"prompt": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 400);
    assert!(blank.json::<ErrorBody>().await.unwrap().error.contains("prompt"));

    let malformed = http
        .post(format!("{base}/api/stream"))
        .header("content-type", "application/json")
        .body("{")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
    assert!(!malformed.json::<ErrorBody>().await.unwrap().error.is_empty());
}

#[tokio::test]
async fn mid_stream_failure_reaches_client() {
    let adapter = Scripted::fragments(["a"]).fail_after(UpstreamErrorKind::Provider, "policy");
    let base = start_relay(adapter, SLOW).await;
    let sink = BufferSink::new();
    let state = ClientStreamReader::new(format!("{base}/api/stream"))
        .unwrap()
        .start(request("hi", "e2e-fail"), sink.clone())
        .join()
        .await;

    assert_eq!(state, StreamState::Failed("policy".into()));
    assert_eq!(sink.text(), format!("a\n{INTERRUPTED_MARKER}"));
    assert_eq!(trace_for("e2e-fail").await.state.as_deref(), Some("failed"));
}

#[tokio::test]
async fn get_transport_streams_echo() {
    let base = start_relay(Scripted::echo(), SLOW).await;
    let sink = BufferSink::new();
    let state = ClientStreamReader::new(format!("{base}/api/stream"))
        .unwrap()
        .with_transport(Transport::Get)
        .start(request("hello big world", "e2e-get"), sink.clone())
        .join()
        .await;

    assert_eq!(state, StreamState::Completed);
    assert_eq!(sink.text(), "hello big world");
}

#[tokio::test]
async fn heartbeats_are_sent_and_invisible() {
    let adapter = Scripted::fragments(["x", "y"]).with_delay(Duration::from_millis(200));
    let base = start_relay(adapter, Duration::from_millis(40)).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/api/stream"))
        .query(&[("prompt", "hi")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"],
        "text/event-stream; charset=utf-8"
    );
    assert_eq!(resp.headers()["cache-control"], "no-cache, no-transform");
    assert_eq!(resp.headers()["x-accel-buffering"], "no");

    let raw = resp.bytes().await.unwrap();
    assert!(String::from_utf8_lossy(&raw).contains(": keep-alive\n\n"));
    assert_eq!(
        DecodeBuffer::new().feed(&raw),
        vec![r#"{"text":"x"}"#, r#"{"text":"y"}"#, "[DONE]"]
    );
}

#[tokio::test]
async fn healthz_is_ok() {
    let base = start_relay(Scripted::echo(), SLOW).await;
    let body = reqwest::get(format!("{base}/healthz"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}
