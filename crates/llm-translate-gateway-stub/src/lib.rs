use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, info};

/// What the stub answers to one chat-completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReply {
    /// Return this text as the first choice.
    Text(String),
    /// Return the last user message unchanged.
    Echo,
    /// Fail with the given HTTP status.
    Fail(u16),
    /// Wait, then answer with the inner reply.
    Slow(Duration, Box<StubReply>),
}

impl StubReply {
    pub fn text(content: impl Into<String>) -> Self {
        StubReply::Text(content.into())
    }

    pub fn slow(delay: Duration, reply: StubReply) -> Self {
        StubReply::Slow(delay, Box::new(reply))
    }
}

/// One chat-completion call as the stub received it.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub body: Value,
}

impl RecordedRequest {
    /// Bearer token without the scheme.
    pub fn bearer(&self) -> Option<&str> {
        self.authorization.as_deref().and_then(|value| value.strip_prefix("Bearer "))
    }

    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(Value::as_str)
    }

    /// `(role, content)` pairs in the order they were sent.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .map(|message| {
                        let field = |name: &str| {
                            message.get(name).and_then(Value::as_str).unwrap_or_default().to_string()
                        };
                        (field("role"), field("content"))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn last_user_message(&self) -> String {
        self.messages()
            .into_iter()
            .rev()
            .find(|(role, _)| role == "user")
            .map(|(_, content)| content)
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct StubInner {
    script: Mutex<VecDeque<StubReply>>,
    fallback: Mutex<StubReply>,
    models: Mutex<Vec<String>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Scripted OpenAI-compatible upstream used to exercise `llm-translate-gateway`.
///
/// Replies are taken from a FIFO script; once it runs dry every call gets the
/// fallback reply.
#[derive(Debug, Clone)]
pub struct StubUpstream {
    inner: Arc<StubInner>,
}

impl Default for StubUpstream {
    fn default() -> Self {
        Self {
            inner: Arc::new(StubInner {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(StubReply::Echo),
                models: Mutex::new(vec!["stub-model".to_string()]),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl StubUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next unanswered call.
    pub fn push(&self, reply: StubReply) -> &Self {
        lock(&self.inner.script).push_back(reply);
        self
    }

    pub fn set_fallback(&self, reply: StubReply) {
        *lock(&self.inner.fallback) = reply;
    }

    pub fn set_models(&self, models: impl IntoIterator<Item = impl Into<String>>) {
        *lock(&self.inner.models) = models.into_iter().map(Into::into).collect();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.inner.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.inner.requests).len()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/models", get(list_models))
            .with_state(self.clone())
    }

    /// Serve on an ephemeral localhost port.
    pub async fn spawn(&self) -> Result<StubServer> {
        self.spawn_on(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    pub async fn spawn_on(&self, addr: SocketAddr) -> Result<StubServer> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind stub upstream on {addr}"))?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!("stub upstream stopped: {err}");
            }
        });
        info!("stub upstream listening on {addr}");
        Ok(StubServer { addr, task })
    }

    fn next_reply(&self) -> StubReply {
        if let Some(reply) = lock(&self.inner.script).pop_front() {
            return reply;
        }
        lock(&self.inner.fallback).clone()
    }
}

/// Running stub server; aborted on drop.
#[derive(Debug)]
pub struct StubServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StubServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Value for the gateway's `base_url` setting.
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn chat_completions(
    State(stub): State<StubUpstream>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request = RecordedRequest {
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body,
    };
    lock(&stub.inner.requests).push(request.clone());

    let mut reply = stub.next_reply();
    debug!(?reply, "stub answering chat completion");
    let content = loop {
        match reply {
            StubReply::Slow(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            StubReply::Text(text) => break text,
            StubReply::Echo => break request.last_user_message(),
            StubReply::Fail(code) => {
                let status =
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let body = json!({ "error": { "message": format!("scripted failure {code}") } });
                return (status, Json(body)).into_response();
            }
        }
    };

    let prompt_tokens: usize =
        request.messages().iter().map(|(_, content)| content.chars().count()).sum();
    let completion_tokens = content.chars().count();
    Json(json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "model": request.model().unwrap_or("stub-model"),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    }))
    .into_response()
}

async fn list_models(State(stub): State<StubUpstream>) -> Json<Value> {
    let data: Vec<Value> = lock(&stub.inner.models)
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "stub" }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
