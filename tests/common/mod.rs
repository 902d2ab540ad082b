//! Shared helpers for webhook endpoint tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use git_pipeliner::signature::sign;
use git_pipeliner::{Notifier, NotifyError, Pipeliner, PipelinerConfig, ScriptResult};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower::ServiceExt;

pub const SECRET: &str = "test-secret";
pub const ENDPOINT: &str = "/github-webhook";

pub fn pipeliner(scripts_path: &Path) -> Pipeliner {
    Pipeliner::new(
        PipelinerConfig::new(SECRET)
            .with_port(0)
            .with_scripts_path(scripts_path),
    )
    .unwrap()
}

pub fn repository() -> Value {
    json!({ "name": "temp", "full_name": "Org/temp" })
}

pub fn tag_payload() -> Value {
    json!({
        "ref_type": "tag",
        "ref": "v1.2.0",
        "master_branch": "main",
        "repository": repository(),
    })
}

pub fn push_payload(branch: &str) -> Value {
    json!({ "ref": format!("refs/heads/{branch}"), "repository": repository() })
}

/// A POST to the webhook endpoint, signed with `secret` when given.
pub fn webhook_request(event: &str, body: &[u8], secret: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(ENDPOINT)
        .header("content-type", "application/json")
        .header("x-github-event", event)
        .header("x-github-delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958");
    if let Some(secret) = secret {
        builder = builder.header("x-hub-signature-256", sign(body, secret));
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

/// Posts a signed webhook through the pipeliner's router.
pub async fn post_signed(pipeliner: &Pipeliner, event: &str, body: &Value) -> StatusCode {
    let body = serde_json::to_vec(body).unwrap();
    post(pipeliner, webhook_request(event, &body, Some(SECRET))).await
}

pub async fn post(pipeliner: &Pipeliner, request: Request<Body>) -> StatusCode {
    pipeliner
        .router()
        .oneshot(request)
        .await
        .unwrap()
        .status()
}

/// Sends a webhook over a raw connection to an owned listener and returns the
/// full response text.
pub async fn post_raw(port: u16, event: &str, body: &[u8], signature: &str) -> String {
    let head = format!(
        "POST {ENDPOINT} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         X-GitHub-Event: {event}\r\n\
         X-Hub-Signature-256: {signature}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Waits up to five seconds for `condition` to hold.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Notifier keeping every result it receives
#[derive(Default)]
pub struct RecordingNotifier {
    pub results: Mutex<Vec<ScriptResult>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, result: ScriptResult) -> Result<(), NotifyError> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }
}

pub fn recording_notifier(pipeliner: &Pipeliner) -> Arc<RecordingNotifier> {
    let notifier = Arc::new(RecordingNotifier::default());
    pipeliner.set_notifier(notifier.clone());
    notifier
}

#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
