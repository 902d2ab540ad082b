//! Webhook related structures and event classification
//!
//! GitHub sends one webhook per repository activity, identified by the
//! `X-GitHub-Event` header. [`classify`] maps the few activities pipelines
//! care about onto [`EventKind`] and extracts the data scripts need.

use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Header carrying the GitHub event type.
pub const EVENT_HEADER: &str = "x-github-event";

/// Header carrying the GitHub delivery GUID.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// One inbound webhook as received from GitHub
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub headers: HeaderMap,
    pub body: Value,
    /// Exact bytes of the request body, as signed by the sender.
    pub raw_body: Bytes,
}

impl WebhookRequest {
    /// Parses `raw_body` as JSON.
    pub fn from_raw(headers: HeaderMap, raw_body: Bytes) -> serde_json::Result<Self> {
        let body = serde_json::from_slice(&raw_body)?;
        Ok(Self {
            headers,
            body,
            raw_body,
        })
    }

    /// Builds a request from an already parsed body, serializing it for `raw_body`.
    pub fn from_json(headers: HeaderMap, body: Value) -> Self {
        let raw_body = Bytes::from(body.to_string());
        Self {
            headers,
            body,
            raw_body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn event_header(&self) -> Option<&str> {
        self.header(EVENT_HEADER)
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.header(DELIVERY_HEADER)
    }
}

/// Repository activities that can trigger a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Merge,
    Release,
    NewBranch,
    NewTag,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Push,
        EventKind::PullRequest,
        EventKind::Merge,
        EventKind::Release,
        EventKind::NewBranch,
        EventKind::NewTag,
    ];

    /// Name used for script files and environment variables.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Merge => "merge",
            EventKind::Release => "release",
            EventKind::NewBranch => "new_branch",
            EventKind::NewTag => "new_tag",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data extracted from the payload, shaped by the kind of event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventData {
    /// Changes were pushed to `branch`
    Push { branch: String },
    /// A pull request from `branch` into `base_branch` was opened
    PullRequest { branch: String, base_branch: String },
    /// A pull request from `branch` into `base_branch` was merged
    Merge { branch: String, base_branch: String },
    /// A release was published from `branch` at `tag`
    Release { branch: String, tag: String },
    NewBranch { branch: String },
    /// `branch` is the repository's default branch at the time of creation
    NewTag { tag: String, branch: Option<String> },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Push { .. } => EventKind::Push,
            EventData::PullRequest { .. } => EventKind::PullRequest,
            EventData::Merge { .. } => EventKind::Merge,
            EventData::Release { .. } => EventKind::Release,
            EventData::NewBranch { .. } => EventKind::NewBranch,
            EventData::NewTag { .. } => EventKind::NewTag,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            EventData::Push { branch }
            | EventData::PullRequest { branch, .. }
            | EventData::Merge { branch, .. }
            | EventData::Release { branch, .. }
            | EventData::NewBranch { branch } => Some(branch),
            EventData::NewTag { branch, .. } => branch.as_deref(),
        }
    }

    pub fn base_branch(&self) -> Option<&str> {
        match self {
            EventData::PullRequest { base_branch, .. } | EventData::Merge { base_branch, .. } => {
                Some(base_branch)
            }
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            EventData::Release { tag, .. } | EventData::NewTag { tag, .. } => Some(tag),
            _ => None,
        }
    }
}

/// Result of classifying one webhook
///
/// `data` carries the event kind, so an event is never present without its data.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub organization: Option<String>,
    pub repository: Option<String>,
    pub data: Option<EventData>,
    pub original_payload: Arc<WebhookRequest>,
}

impl ClassifiedEvent {
    pub fn event(&self) -> Option<EventKind> {
        self.data.as_ref().map(EventData::kind)
    }

    /// Organization, repository and event, when all three could be resolved.
    pub fn script_target(&self) -> Option<(&str, &str, EventKind)> {
        Some((
            self.organization.as_deref()?,
            self.repository.as_deref()?,
            self.event()?,
        ))
    }
}

impl PartialEq for ClassifiedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.organization == other.organization
            && self.repository == other.repository
            && self.data == other.data
            && self.original_payload.body == other.original_payload.body
            && self.original_payload.raw_body == other.original_payload.raw_body
    }
}

/// Classifies a webhook. Pure: the same request always yields the same result.
pub fn classify(request: Arc<WebhookRequest>) -> ClassifiedEvent {
    let body = &request.body;
    let data = request
        .event_header()
        .and_then(|event| classify_event(event, body));
    let repository = str_at(body, &["repository", "name"]).map(String::from);
    let organization = resolve_organization(body);

    ClassifiedEvent {
        organization,
        repository,
        data,
        original_payload: request,
    }
}

fn classify_event(event: &str, body: &Value) -> Option<EventData> {
    let action = str_at(body, &["action"]);

    match event {
        "create" => match str_at(body, &["ref_type"])? {
            "tag" => Some(EventData::NewTag {
                tag: str_at(body, &["ref"])?.to_string(),
                branch: str_at(body, &["master_branch"]).map(String::from),
            }),
            "branch" => Some(EventData::NewBranch {
                branch: str_at(body, &["ref"])?.to_string(),
            }),
            _ => None,
        },
        "push" => {
            let git_ref = str_at(body, &["ref"])?;
            let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
            Some(EventData::Push {
                branch: branch.to_string(),
            })
        }
        "pull_request" => {
            let (branch, base_branch) = pull_request_branches(body)?;
            match action? {
                "opened" => Some(EventData::PullRequest {
                    branch,
                    base_branch,
                }),
                "closed" if is_present(body, &["pull_request", "merged_at"]) => {
                    Some(EventData::Merge {
                        branch,
                        base_branch,
                    })
                }
                _ => None,
            }
        }
        "release" if action == Some("published") => Some(EventData::Release {
            branch: str_at(body, &["release", "target_commitish"])?.to_string(),
            tag: str_at(body, &["release", "tag_name"])?.to_string(),
        }),
        _ => None,
    }
}

fn pull_request_branches(body: &Value) -> Option<(String, String)> {
    let branch = str_at(body, &["pull_request", "head", "ref"])?;
    let base_branch = str_at(body, &["pull_request", "base", "ref"])?;
    Some((branch.to_string(), base_branch.to_string()))
}

/// `organization.login` when the payload has an organization, otherwise the
/// owner part of `repository.full_name`.
fn resolve_organization(body: &Value) -> Option<String> {
    if let Some(organization) = body.get("organization").filter(|o| o.is_object()) {
        return organization
            .get("login")
            .and_then(Value::as_str)
            .map(String::from);
    }

    str_at(body, &["repository", "full_name"])
        .and_then(|full_name| full_name.split('/').next())
        .filter(|owner| !owner.is_empty())
        .map(String::from)
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .and_then(Value::as_str)
}

fn is_present(value: &Value, path: &[&str]) -> bool {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .is_some_and(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn request(event: &str, body: Value) -> Arc<WebhookRequest> {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        Arc::new(WebhookRequest::from_json(headers, body))
    }

    fn repository() -> Value {
        json!({ "name": "temp", "full_name": "Org/temp" })
    }

    #[test]
    fn classifies_new_tag() {
        let classified = classify(request(
            "create",
            json!({
                "ref_type": "tag",
                "ref": "v1.2.0",
                "master_branch": "main",
                "repository": repository(),
            }),
        ));

        assert_eq!(classified.event(), Some(EventKind::NewTag));
        assert_eq!(classified.organization.as_deref(), Some("Org"));
        assert_eq!(classified.repository.as_deref(), Some("temp"));
        assert_eq!(
            classified.data,
            Some(EventData::NewTag {
                tag: "v1.2.0".to_string(),
                branch: Some("main".to_string()),
            })
        );
    }

    #[test]
    fn classifies_new_branch() {
        let classified = classify(request(
            "create",
            json!({ "ref_type": "branch", "ref": "feature-y", "repository": repository() }),
        ));

        assert_eq!(
            classified.data,
            Some(EventData::NewBranch {
                branch: "feature-y".to_string()
            })
        );
    }

    #[test]
    fn push_strips_heads_prefix() {
        let classified = classify(request(
            "push",
            json!({ "ref": "refs/heads/feature-x", "repository": repository() }),
        ));

        assert_eq!(classified.event(), Some(EventKind::Push));
        assert_eq!(
            classified.data.as_ref().and_then(EventData::branch),
            Some("feature-x")
        );
    }

    #[test]
    fn push_keeps_ref_without_heads_prefix() {
        let classified = classify(request(
            "push",
            json!({ "ref": "refs/tags/v1", "repository": repository() }),
        ));

        assert_eq!(
            classified.data.as_ref().and_then(EventData::branch),
            Some("refs/tags/v1")
        );
    }

    #[test]
    fn opened_pull_request() {
        let classified = classify(request(
            "pull_request",
            json!({
                "action": "opened",
                "pull_request": { "head": { "ref": "feature" }, "base": { "ref": "main" } },
                "repository": repository(),
            }),
        ));

        assert_eq!(
            classified.data,
            Some(EventData::PullRequest {
                branch: "feature".to_string(),
                base_branch: "main".to_string(),
            })
        );
    }

    #[test]
    fn closed_pull_request_with_merged_at_is_merge() {
        let classified = classify(request(
            "pull_request",
            json!({
                "action": "closed",
                "pull_request": {
                    "merged_at": "2024-01-01T00:00:00Z",
                    "head": { "ref": "feature" },
                    "base": { "ref": "main" },
                },
                "repository": repository(),
            }),
        ));

        assert_eq!(
            classified.data,
            Some(EventData::Merge {
                branch: "feature".to_string(),
                base_branch: "main".to_string(),
            })
        );
    }

    #[test]
    fn closed_pull_request_without_merge_has_no_event() {
        let unmerged = json!({ "head": { "ref": "feature" }, "base": { "ref": "main" } });
        let mut null_merged_at = unmerged.clone();
        null_merged_at["merged_at"] = Value::Null;

        for pull_request in [unmerged, null_merged_at] {
            let classified = classify(request(
                "pull_request",
                json!({ "action": "closed", "pull_request": pull_request, "repository": repository() }),
            ));

            assert_eq!(classified.event(), None);
            assert_eq!(classified.data, None);
        }
    }

    #[test]
    fn published_release() {
        let classified = classify(request(
            "release",
            json!({
                "action": "published",
                "release": { "target_commitish": "main", "tag_name": "v2.0.0" },
                "repository": repository(),
            }),
        ));

        assert_eq!(
            classified.data,
            Some(EventData::Release {
                branch: "main".to_string(),
                tag: "v2.0.0".to_string(),
            })
        );
    }

    #[test]
    fn unpublished_release_and_unknown_events_have_no_event() {
        let draft = classify(request(
            "release",
            json!({ "action": "created", "release": { "target_commitish": "main", "tag_name": "v2" }, "repository": repository() }),
        ));
        let issue = classify(request("issues", json!({ "action": "opened", "repository": repository() })));

        assert_eq!(draft.event(), None);
        assert_eq!(issue.event(), None);
        assert_eq!(issue.repository.as_deref(), Some("temp"));
    }

    #[test]
    fn missing_required_fields_yield_no_event() {
        let classified = classify(request("push", json!({ "repository": repository() })));
        assert_eq!(classified.data, None);
    }

    #[test]
    fn organization_login_takes_precedence_over_full_name() {
        let classified = classify(request(
            "push",
            json!({
                "ref": "refs/heads/main",
                "organization": { "login": "acme" },
                "repository": { "name": "temp", "full_name": "someone-else/temp" },
            }),
        ));

        assert_eq!(classified.organization.as_deref(), Some("acme"));
    }

    #[test]
    fn unresolvable_owner_has_no_script_target() {
        let classified = classify(request("push", json!({ "ref": "refs/heads/main" })));

        assert_eq!(classified.event(), Some(EventKind::Push));
        assert_eq!(classified.organization, None);
        assert_eq!(classified.repository, None);
        assert!(classified.script_target().is_none());
    }

    #[test]
    fn classification_is_idempotent() {
        let request = request(
            "create",
            json!({ "ref_type": "tag", "ref": "v1", "master_branch": "main", "repository": repository() }),
        );

        assert_eq!(classify(request.clone()), classify(request));
    }

    #[test]
    fn event_data_serializes_with_kind_tag() {
        let data = EventData::Push {
            branch: "main".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({ "event": "push", "data": { "branch": "main" } })
        );
    }
}
