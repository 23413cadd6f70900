//! Integration tests for the HTTP surface
//!
//! Starts the real router on an ephemeral port with a scripted reasoning
//! backend and talks to it over HTTP.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use judge_engine::agent::{
    AgentCore, AgentSettings, Budget, CondensePolicy, PromptBuilder, PromptTemplates,
    SessionManager,
};
use judge_engine::config::StreamConfig;
use judge_engine::llm::{
    BackendError, Decision, Finalization, Prompt, ReasoningBackend, ToolInvocation, Verdict,
};
use judge_engine::stream::StreamEvent;
use judge_engine::tools::{ToolRegistry, ToolSpec};
use judge_sdk::capability::CapabilityProvider;
use judge_sdk::types::{
    ArgSchema, FieldSpec, FieldType, ProviderError, ProviderOutput, ToolArgs,
};

struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Decision, BackendError>>>,
    delay: Duration,
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(&self, _prompt: &Prompt) -> Result<Decision, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Malformed("script exhausted".to_string())))
    }

    async fn check_health(&self) -> bool {
        true
    }
}

struct PanickingBackend;

#[async_trait]
impl ReasoningBackend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn decide(&self, _prompt: &Prompt) -> Result<Decision, BackendError> {
        panic!("backend blew up");
    }

    async fn check_health(&self) -> bool {
        true
    }
}

struct OcrProvider;

#[async_trait]
impl CapabilityProvider for OcrProvider {
    fn name(&self) -> &str {
        "ocr"
    }

    async fn invoke(&self, _args: &ToolArgs) -> Result<ProviderOutput, ProviderError> {
        Ok(ProviderOutput::found(json!({"text": "RUE DE RIVOLI"})).with_confidence(0.95))
    }
}

fn read_sign() -> Result<Decision, BackendError> {
    Ok(Decision::InvokeTool(ToolInvocation {
        tool: "ocr".to_string(),
        arguments: json!({"image_url": "https://cdn/p.jpg"}),
        thought: Some("read the street sign".to_string()),
    }))
}

fn finalize_supported() -> Result<Decision, BackendError> {
    Ok(Decision::Finalize(Finalization {
        verdict: Verdict::Supported,
        rationale: "street sign reads Rue de Rivoli".to_string(),
        cited_evidence: vec![1],
        thought: None,
    }))
}

fn paris_script() -> Vec<Result<Decision, BackendError>> {
    vec![read_sign(), finalize_supported()]
}

fn scripted(script: Vec<Result<Decision, BackendError>>, delay: Duration) -> Arc<dyn ReasoningBackend> {
    Arc::new(ScriptedBackend {
        script: Mutex::new(script.into()),
        delay,
    })
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server(script: Vec<Result<Decision, BackendError>>, delay: Duration) -> TestServer {
    start_server_with(
        scripted(script, delay),
        StreamConfig::default(),
        Duration::from_secs(2),
    )
    .await
}

async fn start_server_with(
    backend: Arc<dyn ReasoningBackend>,
    stream: StreamConfig,
    finish_grace: Duration,
) -> TestServer {
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolSpec::new(
            "ocr",
            "Read text in an image",
            ArgSchema::new(vec![FieldSpec::required("image_url", FieldType::String)]),
            Arc::new(OcrProvider),
        ))
        .unwrap();

    let prompts = PromptBuilder::new(
        Arc::new(PromptTemplates::default()),
        CondensePolicy::default(),
    );
    let settings = AgentSettings {
        backoff: Duration::from_millis(1),
        cancel_grace: Duration::from_millis(50),
        finish_grace,
        ..AgentSettings::default()
    };
    let core = AgentCore::new(backend, Arc::new(registry), prompts, settings);
    let manager = SessionManager::new(
        Arc::new(core),
        stream,
        Budget::new(5, Duration::from_secs(30)),
        None,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        judge_engine::server::serve_with_shutdown(listener, manager, async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        shutdown: Some(tx),
    }
}

impl TestServer {
    async fn start_session(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/api/sessions", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn session_id(&self) -> String {
        let response = self
            .start_session(json!({
                "claim": "This photo was taken in Paris",
                "media": [{"kind": "image", "uri": "https://cdn/p.jpg"}]
            }))
            .await;
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        body["session_id"].as_str().unwrap().to_string()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }

    /// Read an SSE body back into events
    async fn events(&self, id: &str) -> Vec<StreamEvent> {
        let response = self.get(&format!("/api/sessions/{}/events", id)).await;
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    async fn wait_for_status(&self, id: &str, expected: &str) -> Value {
        for _ in 0..100 {
            let body: Value = self
                .get(&format!("/api/sessions/{}", id))
                .await
                .json()
                .await
                .unwrap();
            if body["status"] == expected {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {} never reached status {}", id, expected);
    }
}

#[tokio::test]
async fn test_health_and_tools() {
    let server = start_server(Vec::new(), Duration::ZERO).await;

    let health: Value = server.get("/health").await.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["running_sessions"], 0);

    let tools: Value = server.get("/api/tools").await.json().await.unwrap();
    assert_eq!(tools["tools"][0]["name"], "ocr");
}

#[tokio::test]
async fn test_session_streams_events_until_final() {
    let server = start_server(paris_script(), Duration::ZERO).await;
    let id = server.session_id().await;

    let response = server.get(&format!("/api/sessions/{}/events", id)).await;
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream")));

    let body = response.text().await.unwrap();
    let tool_call = body.find("event: tool_call").expect("tool_call event");
    let tool_result = body.find("event: tool_result").expect("tool_result event");
    let final_event = body.find("event: final").expect("final event");
    assert!(tool_call < tool_result && tool_result < final_event);
    assert!(body.contains("\"verdict\":\"supported\""));

    let session = server.wait_for_status(&id, "finalized").await;
    assert_eq!(session["outcome"]["verdict"], "supported");
    assert_eq!(session["outcome"]["citations"], json!([1]));
}

#[tokio::test]
async fn test_stream_can_only_be_taken_once() {
    let server = start_server(paris_script(), Duration::ZERO).await;
    let id = server.session_id().await;

    let first = server.get(&format!("/api/sessions/{}/events", id)).await;
    assert_eq!(first.status(), 200);

    let second = server.get(&format!("/api/sessions/{}/events", id)).await;
    assert_eq!(second.status(), 409);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["code"], "stream_already_taken");

    drop(first);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let server = start_server(Vec::new(), Duration::ZERO).await;

    assert_eq!(server.get("/api/sessions/nope").await.status(), 404);
    assert_eq!(server.get("/api/sessions/nope/events").await.status(), 404);

    let abort = server
        .client
        .delete(format!("{}/api/sessions/nope", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(abort.status(), 404);
}

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let server = start_server(Vec::new(), Duration::ZERO).await;

    let empty = server.start_session(json!({"claim": "   "})).await;
    assert_eq!(empty.status(), 400);

    let zero_time = server
        .start_session(json!({"claim": "taken in Paris", "budget": {"max_seconds": 0}}))
        .await;
    assert_eq!(zero_time.status(), 400);
}

#[tokio::test]
async fn test_delete_aborts_running_session() {
    let server = start_server(paris_script(), Duration::from_secs(10)).await;
    let id = server.session_id().await;

    let response = server
        .client
        .delete(format!("{}/api/sessions/{}", server.base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let session = server.wait_for_status(&id, "aborted").await;
    assert_eq!(session["outcome"]["status"], "aborted");

    // Aborting a terminal session changes nothing
    let again = server
        .client
        .delete(format!("{}/api/sessions/{}", server.base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 202);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["status"], "aborted");
}

#[tokio::test]
async fn test_late_subscriber_still_sees_final_event() {
    let mut script: Vec<_> = (0..4).map(|_| read_sign()).collect();
    script.push(finalize_supported());
    let stream = StreamConfig {
        channel_capacity: 4,
        ..StreamConfig::default()
    };
    let server = start_server_with(
        scripted(script, Duration::ZERO),
        stream,
        Duration::from_millis(50),
    )
    .await;
    let id = server.session_id().await;

    // Nobody reads until the session is over and the flush grace has passed
    server.wait_for_status(&id, "finalized").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = server.events(&id).await;
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(seqs, expected);
    let last = events.last().unwrap();
    assert_eq!(last.kind.as_str(), "final");
    assert_eq!(last.payload["verdict"], "supported");
}

#[tokio::test]
async fn test_panicking_loop_ends_stream_with_terminal_error() {
    let server = start_server_with(
        Arc::new(PanickingBackend),
        StreamConfig::default(),
        Duration::from_millis(50),
    )
    .await;
    let id = server.session_id().await;

    let events = server.events(&id).await;
    let last = events.last().expect("at least the terminal event");
    assert!(last.is_terminal());
    assert_eq!(last.kind.as_str(), "error");
    assert_eq!(last.payload["code"], "internal_error");
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    server.wait_for_status(&id, "failed").await;
}
