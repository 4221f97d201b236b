//! HTTP transport for the request gateway

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::auth::token::bearer;
use crate::error::{Result, SyncError};

/// Endpoints that never carry or renew a credential
const UNAUTHENTICATED_PATHS: [&str; 3] = ["auth/login", "auth/register", "auth/refresh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A request relative to the API base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Login, registration and renewal go out without a credential, and a
    /// 401 on them is final
    pub fn is_unauthenticated(&self) -> bool {
        let path = self.path.trim_start_matches('/');
        UNAUTHENTICATED_PATHS.contains(&path)
    }
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server-provided error text, falling back to the status code
    pub fn error_message(&self) -> String {
        match &self.body {
            Value::Object(map) => map
                .get("message")
                .or_else(|| map.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", self.status)),
            Value::String(s) if !s.is_empty() => s.clone(),
            _ => format!("HTTP {}", self.status),
        }
    }

    /// Map the status to the client error taxonomy
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            200..=299 => Ok(self.body),
            401 => Err(SyncError::AuthRequired),
            400..=499 => Err(SyncError::ValidationRejected {
                status: self.status,
                message: self.error_message(),
            }),
            _ => Err(SyncError::TransientNetwork(format!(
                "Server error {}: {}",
                self.status,
                self.error_message()
            ))),
        }
    }
}

/// Sends one HTTP request, no retries and no timeout handling
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, url: Url, request: &ApiRequest, access_token: Option<&str>) -> Result<ApiResponse>;
}

/// `reqwest` implementation of [`HttpBackend`]
#[derive(Debug, Clone, Default)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, url: Url, request: &ApiRequest, access_token: Option<&str>) -> Result<ApiResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = access_token {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer(token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(ApiResponse { status, body })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::TransientNetwork(err.to_string())
    }
}
