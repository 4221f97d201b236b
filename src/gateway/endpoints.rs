//! Typed API endpoints
//!
//! Responses come wrapped as `{ "status": ..., "data": { <field>: ... } }`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::client::Gateway;
use super::http::ApiRequest;
use crate::core::message::{Chat, ChatMessage, Issue, IssueStatus, Notification, Post, UserRef};
use crate::error::{Result, SyncError};
use crate::storage::credentials::Credentials;

/// One page of a paginated listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    fn apply(&self, request: ApiRequest) -> ApiRequest {
        request
            .with_query("page", self.page)
            .with_query("limit", self.limit)
    }
}

/// Result of a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub user: UserRef,
    pub credentials: Credentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    user: UserRef,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn data_of(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

/// Pull `field` out of the response envelope
fn extract<T: DeserializeOwned>(body: Value, field: &str) -> Result<T> {
    let data = data_of(body);
    let value = match data {
        Value::Object(mut map) => map
            .remove(field)
            .ok_or_else(|| SyncError::MessageParseError(format!("Response has no '{}'", field)))?,
        _ => {
            return Err(SyncError::MessageParseError(format!(
                "Expected an object holding '{}'",
                field
            )))
        }
    };
    serde_json::from_value(value)
        .map_err(|e| SyncError::MessageParseError(format!("Invalid '{}': {}", field, e)))
}

/// Read a paginated listing whose items live under `field`. Listings
/// without pagination metadata are treated as a single page.
fn extract_page<T: DeserializeOwned>(body: Value, field: &str) -> Result<Page<T>> {
    let data = data_of(body);
    let page = data.get("page").and_then(Value::as_u64).unwrap_or(1) as u32;
    let total_pages = data
        .get("totalPages")
        .and_then(Value::as_u64)
        .map(|t| t as u32)
        .unwrap_or(page);

    let items = extract(data, field)?;
    Ok(Page {
        items,
        page,
        total_pages,
    })
}

impl Gateway {
    // Auth

    /// Exchange email and password for credentials. The credentials are
    /// returned, not stored.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResult> {
        let body = self
            .request(ApiRequest::post("auth/login").with_body(json!({ "email": email, "password": password })))
            .await?;
        let auth: AuthResponse = serde_json::from_value(data_of(body))
            .map_err(|e| SyncError::MessageParseError(format!("Invalid login response: {}", e)))?;

        Ok(LoginResult {
            user: auth.user,
            credentials: Credentials::new(auth.access_token, auth.refresh_token),
        })
    }

    pub async fn logout(&self) -> Result<()> {
        self.request(ApiRequest::post("auth/logout")).await.map(|_| ())
    }

    // Posts

    pub async fn get_post(&self, post_id: &str) -> Result<Post> {
        let body = self.request(ApiRequest::get(format!("posts/{}", encode_segment(post_id)))).await?;
        extract(body, "post")
    }

    pub async fn list_posts(&self, page: PageRequest) -> Result<Page<Post>> {
        let body = self.request(page.apply(ApiRequest::get("posts"))).await?;
        extract_page(body, "posts")
    }

    pub async fn like_post(&self, post_id: &str) -> Result<()> {
        self.request(ApiRequest::post(format!("posts/{}/like", encode_segment(post_id))))
            .await
            .map(|_| ())
    }

    pub async fn unlike_post(&self, post_id: &str) -> Result<()> {
        self.request(ApiRequest::delete(format!("posts/{}/like", encode_segment(post_id))))
            .await
            .map(|_| ())
    }

    pub async fn bookmark_post(&self, post_id: &str) -> Result<()> {
        self.request(ApiRequest::post(format!("posts/{}/bookmark", encode_segment(post_id))))
            .await
            .map(|_| ())
    }

    pub async fn unbookmark_post(&self, post_id: &str) -> Result<()> {
        self.request(ApiRequest::delete(format!("posts/{}/bookmark", encode_segment(post_id))))
            .await
            .map(|_| ())
    }

    // Issues

    pub async fn get_issue(&self, issue_id: &str) -> Result<Issue> {
        let body = self.request(ApiRequest::get(format!("issues/{}", encode_segment(issue_id)))).await?;
        extract(body, "issue")
    }

    pub async fn list_issues(&self, page: PageRequest) -> Result<Page<Issue>> {
        let body = self.request(page.apply(ApiRequest::get("issues"))).await?;
        extract_page(body, "issues")
    }

    pub async fn update_issue_status(&self, issue_id: &str, status: IssueStatus) -> Result<Issue> {
        let body = self
            .request(
                ApiRequest::patch(format!("issues/{}/status", encode_segment(issue_id)))
                    .with_body(json!({ "status": status.as_str() })),
            )
            .await?;
        extract(body, "issue")
    }

    pub async fn add_issue_label(&self, issue_id: &str, label: &str) -> Result<Issue> {
        let body = self
            .request(
                ApiRequest::post(format!("issues/{}/labels", encode_segment(issue_id)))
                    .with_body(json!({ "label": label })),
            )
            .await?;
        extract(body, "issue")
    }

    pub async fn remove_issue_label(&self, issue_id: &str, label: &str) -> Result<Issue> {
        let path = format!("issues/{}/labels/{}", encode_segment(issue_id), encode_segment(label));
        let body = self.request(ApiRequest::delete(path)).await?;
        extract(body, "issue")
    }

    pub async fn assign_issue(&self, issue_id: &str, user_id: &str) -> Result<Issue> {
        let body = self
            .request(
                ApiRequest::post(format!("issues/{}/assign", encode_segment(issue_id)))
                    .with_body(json!({ "userId": user_id })),
            )
            .await?;
        extract(body, "issue")
    }

    pub async fn unassign_issue(&self, issue_id: &str, user_id: &str) -> Result<Issue> {
        let path = format!("issues/{}/assign/{}", encode_segment(issue_id), encode_segment(user_id));
        let body = self.request(ApiRequest::delete(path)).await?;
        extract(body, "issue")
    }

    // Chats

    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        let body = self.request(ApiRequest::get("chats")).await?;
        extract(body, "chats")
    }

    pub async fn get_messages(&self, chat_id: &str, page: PageRequest) -> Result<Vec<ChatMessage>> {
        let body = self
            .request(page.apply(ApiRequest::get(format!("chats/{}/messages", encode_segment(chat_id)))))
            .await?;
        extract(body, "messages")
    }

    pub async fn mark_chat_read(&self, chat_id: &str) -> Result<()> {
        self.request(ApiRequest::post(format!("chats/{}/read", encode_segment(chat_id))))
            .await
            .map(|_| ())
    }

    pub async fn create_group_chat(&self, name: &str, participant_ids: &[String]) -> Result<Chat> {
        let body = self
            .request(ApiRequest::post("chats").with_body(json!({
                "type": "group",
                "name": name,
                "participants": participant_ids,
            })))
            .await?;
        extract(body, "chat")
    }

    /// Get the direct chat with a user, creating it if needed
    pub async fn direct_chat(&self, user_id: &str) -> Result<Chat> {
        let body = self
            .request(ApiRequest::post("chats/direct").with_body(json!({ "userId": user_id })))
            .await?;
        extract(body, "chat")
    }

    // Notifications

    pub async fn list_notifications(&self, page: PageRequest) -> Result<Vec<Notification>> {
        let body = self.request(page.apply(ApiRequest::get("notifications"))).await?;
        extract(body, "notifications")
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        self.request(ApiRequest::patch(format!("notifications/{}/read", encode_segment(notification_id))))
            .await
            .map(|_| ())
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        self.request(ApiRequest::post("notifications/read-all"))
            .await
            .map(|_| ())
    }

    // Users

    pub async fn get_user(&self, user_id: &str) -> Result<UserRef> {
        let body = self.request(ApiRequest::get(format!("users/{}", encode_segment(user_id)))).await?;
        extract(body, "user")
    }
}

/// Percent-encode a free-form path segment such as a label name
fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
