//! Remote API client contract and its reqwest implementation.
//!
//! [`RemoteApi::request`] returns a normalized [`ApiResponse`] for every
//! HTTP outcome, including transport failures. `Err(ApiError)` is left for
//! clients that cannot normalize what went wrong; the sync engine treats it
//! the same as a failed response.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::ApiError;

pub const SUBMISSIONS_ENDPOINT: &str = "/submissions";
pub const BATCH_SYNC_ENDPOINT: &str = "/submissions/sync";

const UNREACHABLE_MESSAGE: &str =
    "Cannot reach server. Please check your internet connection and try again.";
const INVALID_RESPONSE_MESSAGE: &str = "Server returned invalid response. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub body: Option<JsonValue>,
    pub requires_auth: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            body: None,
            requires_auth: true,
        }
    }
}

impl RequestOptions {
    pub fn post(body: JsonValue) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            requires_auth: true,
        }
    }
}

/// Normalized result of one API call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub is_network_error: bool,
    /// Whole response body, before `data` was unwrapped from the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<JsonValue>,
}

impl ApiResponse {
    pub fn ok(data: JsonValue) -> Self {
        Self {
            success: true,
            data: Some(data),
            status: Some(200),
            ..Default::default()
        }
    }

    pub fn rejected(error: impl Into<String>, status: u16) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn network_error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            is_network_error: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn request(&self, endpoint: &str, options: RequestOptions)
        -> Result<ApiResponse, ApiError>;
}

fn string_at<'a>(value: Option<&'a JsonValue>, path: &[&str]) -> Option<&'a str> {
    let mut current = value?;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str()
}

fn validation_errors(errors: &serde_json::Map<String, JsonValue>) -> BTreeMap<String, Vec<String>> {
    errors
        .iter()
        .map(|(field, messages)| {
            let messages = match messages {
                JsonValue::Array(items) => items
                    .iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect(),
                JsonValue::String(m) => vec![m.clone()],
                other => vec![other.to_string()],
            };
            (field.clone(), messages)
        })
        .collect()
}

/// Turns a status code and raw body into an [`ApiResponse`].
pub fn normalize_response(status: u16, body_text: &str) -> ApiResponse {
    let body: Option<JsonValue> = if body_text.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str(body_text).unwrap_or_else(|_| {
            debug!("Response body is not JSON, wrapping it as a message");
            json!({ "message": body_text })
        }))
    };

    if !(200..300).contains(&status) {
        if status == 422 {
            if let Some(errors) = body
                .as_ref()
                .and_then(|b| b.get("errors"))
                .and_then(JsonValue::as_object)
            {
                let first = errors.values().next().and_then(|first| match first {
                    JsonValue::Array(items) => items.first().and_then(JsonValue::as_str),
                    other => other.as_str(),
                });
                return ApiResponse {
                    success: false,
                    error: Some(first.unwrap_or("Validation failed").to_string()),
                    status: Some(status),
                    validation_errors: Some(validation_errors(errors)),
                    raw: body.clone(),
                    ..Default::default()
                };
            }
        }

        let error = string_at(body.as_ref(), &["error"])
            .or_else(|| string_at(body.as_ref(), &["message"]))
            .or_else(|| string_at(body.as_ref(), &["data", "message"]))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Request failed with status {status}"));

        return ApiResponse {
            success: false,
            error: Some(error),
            status: Some(status),
            data: body.clone(),
            raw: body,
            ..Default::default()
        };
    }

    match body.as_ref().and_then(|b| b.get("success")).and_then(JsonValue::as_bool) {
        Some(success) => {
            let data = body
                .as_ref()
                .and_then(|b| b.get("data"))
                .cloned()
                .or_else(|| body.clone());
            let error = if success {
                None
            } else {
                string_at(body.as_ref(), &["error"])
                    .or_else(|| string_at(body.as_ref(), &["message"]))
                    .map(str::to_string)
            };
            ApiResponse {
                success,
                data,
                error,
                status: Some(status),
                raw: body,
                ..Default::default()
            }
        }
        None => ApiResponse {
            success: true,
            data: body.clone(),
            status: Some(status),
            raw: body,
            ..Default::default()
        },
    }
}

/// JSON-over-HTTP client for the registration server.
pub struct HttpApiClient {
    client: Client,
    base_url: RwLock<String>,
    auth_token: RwLock<Option<String>>,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: RwLock::new(base_url.into().trim_end_matches('/').to_string()),
            auth_token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .read()
            .map(|url| url.clone())
            .unwrap_or_default()
    }

    pub fn set_base_url(&self, url: &str) {
        if let Ok(mut base) = self.base_url.write() {
            *base = url.trim_end_matches('/').to_string();
        }
    }

    /// `None` clears the token.
    pub fn set_auth_token(&self, token: Option<String>) {
        if let Ok(mut current) = self.auth_token.write() {
            *current = token.filter(|t| !t.is_empty());
        }
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token.read().ok().and_then(|t| t.clone())
    }

    fn describe_transport_error(err: &reqwest::Error) -> String {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            UNREACHABLE_MESSAGE.to_string()
        } else if err.is_decode() {
            INVALID_RESPONSE_MESSAGE.to_string()
        } else {
            err.to_string()
        }
    }

    /// Whether the server's API root answers with a 2xx.
    pub async fn test_connection(&self) -> bool {
        let base = self.base_url();
        let url = match base.strip_suffix("/api/v1") {
            Some(root) => format!("{root}/api"),
            None => base,
        };
        match self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("API connection test failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url(), endpoint);
        let mut builder = match options.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        }
        .header("Content-Type", "application/json")
        .header("Accept", "application/json");

        if options.requires_auth {
            if let Some(token) = self.auth_token() {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        debug!("API request: {:?} {url}", options.method);
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("API request to {url} failed: {e}");
                return Ok(ApiResponse::network_error(Self::describe_transport_error(&e)));
            }
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Reading response from {url} failed: {e}");
                return Ok(ApiResponse::network_error(Self::describe_transport_error(&e)));
            }
        };
        debug!("API response: {status} {url}");

        Ok(normalize_response(status, &text))
    }
}
