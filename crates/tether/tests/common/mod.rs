//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Method, Request, StatusCode, header},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

use tether::agent::AgentType;
use tether::backend::SubprocessRunner;
use tether::discovery::{
    DiscoveryHints, DiscoveryResolver, RegistrySet, SessionRef, SessionStrategy, StaticLocator,
};
use tether::hub::{Hub, HubDeps};
use tether::liveness::PidProbe;
use tether::settings::AppConfig;
use tether::store::{MemoryStore, Store};

pub const SECRET: &str = "hunter2";

/// Live session ids and the prompts pushed into them.
#[derive(Debug, Default)]
pub struct FakeOpenCode {
    pub sessions: Vec<String>,
    pub prompts: Vec<(String, String)>,
}

pub type Shared = Arc<Mutex<FakeOpenCode>>;

/// Serve a minimal OpenCode server and return its base URL.
pub async fn spawn_opencode(state: Shared) -> String {
    async fn list(State(s): State<Shared>) -> Json<Value> {
        let ids = s.lock().unwrap().sessions.clone();
        Json(Value::Array(ids.into_iter().map(|id| json!({ "id": id })).collect()))
    }

    async fn prompt_async(
        State(s): State<Shared>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let mut state = s.lock().unwrap();
        if !state.sessions.contains(&id) {
            return StatusCode::NOT_FOUND;
        }
        let text = body["parts"][0]["text"].as_str().unwrap_or_default().to_string();
        state.prompts.push((id, text));
        StatusCode::NO_CONTENT
    }

    let app = Router::new()
        .route("/global/health", get(|| async { Json(json!({ "healthy": true })) }))
        .route("/session", get(list))
        .route("/session/{id}/prompt_async", post(prompt_async))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

pub struct AliveProbe(pub HashSet<u32>);

impl PidProbe for AliveProbe {
    fn alive(&self, pid: u32) -> bool {
        self.0.contains(&pid)
    }
}

/// Finds `session` for any project, unless another agent holds it.
pub struct FixedStrategy(pub Option<String>);

#[async_trait]
impl SessionStrategy for FixedStrategy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef> {
        self.0
            .clone()
            .filter(|id| !hints.exclude.contains(id))
            .map(|session_id| SessionRef {
                session_id,
                strategy: "fixed",
            })
    }
}

pub struct TestHub {
    pub hub: Arc<Hub>,
    pub app: Router,
    pub opencode: Shared,
    pub opencode_url: String,
    /// Project dir whose `run` script stands in for `opencode run`.
    pub project: TempDir,
}

/// Route `log` output through the test harness; `RUST_LOG` picks the level.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A hub over an in-memory store, a fake OpenCode server exposing
/// `discoverable`, live pids `alive`, and `sh` as the opencode CLI.
pub async fn test_hub(discoverable: Option<&str>, alive: &[u32]) -> TestHub {
    init_logging();
    let opencode: Shared = Arc::new(Mutex::new(FakeOpenCode {
        sessions: discoverable.map(str::to_string).into_iter().collect(),
        ..Default::default()
    }));
    let opencode_url = spawn_opencode(opencode.clone()).await;

    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("run"), "echo \"handled $#\"\n").unwrap();

    let mut config = AppConfig::default();
    config.server.internal_secret = Some(SECRET.to_string());
    config.backend.opencode_server = false;
    config.direct.poll_interval_ms = 20;
    config.direct.smart_pull_wait_secs = 1;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let deps = HubDeps {
        store,
        resolver: Arc::new(DiscoveryResolver::new(
            vec![Box::new(FixedStrategy(discoverable.map(str::to_string)))],
            Arc::new(StaticLocator::new(Some(opencode_url.clone()))),
        )),
        registries: Arc::new(RegistrySet::default()),
        probe: Arc::new(AliveProbe(alive.iter().copied().collect())),
        launcher: None,
        runner: SubprocessRunner::new(HashMap::from([(
            AgentType::Opencode,
            PathBuf::from("sh"),
        )])),
    };
    let hub = Hub::new(config, deps);
    let app = tether::api::create_router(hub.clone());
    TestHub {
        hub,
        app,
        opencode,
        opencode_url,
        project,
    }
}

/// Send a request with the shared secret and decode the JSON body.
pub async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call_with(app, method, uri, body, Some(SECRET)).await
}

pub async fn call_with(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    secret: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    if let Some(secret) = secret {
        builder = builder.header("x-internal-secret", secret);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Register `name` as an opencode agent in `project` with `pid`.
pub async fn register(app: &Router, name: &str, project: &str, pid: u32) -> Value {
    let (status, body) = call(
        app,
        Method::POST,
        "/agents/register",
        Some(json!({
            "name": name,
            "agent_type": "opencode",
            "project_path": project,
            "pid": pid,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register {name}: {body}");
    body
}
