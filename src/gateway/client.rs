//! Request gateway
//!
//! Sends requests to the API with the stored access credential. A 401 is
//! answered with one credential renewal and one retry. Concurrent renewals
//! are collapsed into a single refresh call.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use super::http::{ApiRequest, ApiResponse, HttpBackend};
use crate::config::ClientConfig;
use crate::core::connection::CredentialRenewer;
use crate::error::{Result, SyncError};
use crate::storage::credentials::Credentials;
use crate::storage::traits::CredentialStore;

/// Body of a successful renewal
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct Gateway {
    config: ClientConfig,
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<dyn CredentialStore>,
    // Held for the duration of a renewal
    renewal: Mutex<()>,
}

impl Gateway {
    pub fn new(config: ClientConfig, backend: Arc<dyn HttpBackend>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            backend,
            credentials,
            renewal: Mutex::new(()),
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Send a request and return the response body.
    ///
    /// Never retries on its own except once after a successful credential
    /// renewal.
    pub async fn request(&self, request: ApiRequest) -> Result<Value> {
        if request.is_unauthenticated() {
            return self.send_once(&request, None).await?.into_result();
        }

        let token = self
            .credentials
            .load()
            .await?
            .map(|c| c.access_token);

        let response = self.send_once(&request, token.as_deref()).await?;
        if response.status != 401 {
            return response.into_result();
        }

        let Some(rejected) = token else {
            return Err(SyncError::AuthRequired);
        };

        debug!("{} returned 401, renewing credential", request);
        self.renew_credentials(&rejected).await?;

        let renewed = self
            .credentials
            .load()
            .await?
            .ok_or(SyncError::AuthRequired)?;
        self.send_once(&request, Some(&renewed.access_token))
            .await?
            .into_result()
    }

    /// Replace a rejected access token through the renewal endpoint.
    ///
    /// Callers that queued behind a renewal in progress find a different
    /// token in the store and reuse it. Any failure clears the stored
    /// credentials and reports `AuthRequired`.
    pub async fn renew_credentials(&self, rejected_token: &str) -> Result<()> {
        let _guard = self.renewal.lock().await;

        let Some(current) = self.credentials.load().await? else {
            return Err(SyncError::AuthRequired);
        };
        if current.access_token != rejected_token {
            debug!("Credential already renewed by a concurrent caller");
            return Ok(());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            warn!("No refresh token available, re-authentication required");
            self.credentials.clear().await?;
            return Err(SyncError::AuthRequired);
        };

        let request = ApiRequest::post("auth/refresh").with_body(json!({ "refreshToken": refresh_token }));
        let renewed = match self.send_once(&request, None).await.and_then(ApiResponse::into_result) {
            Ok(body) => parse_token_response(body),
            Err(e) => Err(e),
        };

        match renewed {
            Ok(tokens) => {
                let credentials = current.renewed(tokens.access_token, tokens.refresh_token);
                self.credentials.save(&credentials).await?;
                info!("Access credential renewed");
                Ok(())
            }
            Err(e) => {
                warn!("Credential renewal failed: {}", e);
                self.credentials.clear().await?;
                Err(SyncError::AuthRequired)
            }
        }
    }

    /// Store credentials obtained out of band, e.g. from a login form
    pub async fn store_credentials(&self, credentials: &Credentials) -> Result<()> {
        self.credentials.save(credentials).await
    }

    async fn send_once(&self, request: &ApiRequest, access_token: Option<&str>) -> Result<ApiResponse> {
        let url = self.url_for(request)?;
        debug!("{} {}", request.method, url);

        match tokio::time::timeout(
            self.config.request_timeout,
            self.backend.send(url, request, access_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", request, self.config.request_timeout);
                Err(SyncError::Timeout)
            }
        }
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url> {
        self.config.endpoint(&request.path)
    }
}

fn parse_token_response(body: Value) -> Result<TokenResponse> {
    let data = match body.get("data") {
        Some(data) if data.get("accessToken").is_some() => data.clone(),
        _ => body,
    };
    serde_json::from_value(data)
        .map_err(|e| SyncError::MessageParseError(format!("Invalid renewal response: {}", e)))
}

#[async_trait]
impl CredentialRenewer for Gateway {
    async fn renew(&self, rejected_token: &str) -> Result<()> {
        self.renew_credentials(rejected_token).await
    }
}

/// Thread-safe wrapper for Gateway
pub type SharedGateway = Arc<Gateway>;
