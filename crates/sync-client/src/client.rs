//! REST client for the Huddle backend.
//!
//! Implements [`RemoteBackend`] on top of three endpoints: mutation upload,
//! delta fetch per collection and single-message lookup.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;

use huddle_core::errors::Result as CoreResult;
use huddle_core::sync::{Collection, FetchPage, MutationAck, OutboxEntry, RemoteBackend, SyncRow};

use crate::error::{Result, SyncClientError};
use crate::types::{ApiErrorResponse, FetchPageResponse, MutationAckResponse, MutationRequest};

/// Default timeout for API requests. Callers time-box more tightly.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const IDEMPOTENCY_KEY: &str = "idempotency-key";

#[derive(Debug, Clone)]
pub struct HuddleApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HuddleApiClient {
    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Api] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Api] Response error ({}): {}", status, preview);
    }

    /// Create a new client for `base_url` (e.g. `https://api.huddle.chat`).
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncClientError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        if let Some(api_key) = &self.api_key {
            let key_value = HeaderValue::from_str(api_key)
                .map_err(|_| SyncClientError::auth("Invalid API key format"))?;
            headers.insert("apikey", key_value);
        }

        Ok(headers)
    }

    /// Reads the body and turns non-2xx statuses into [`SyncClientError::Api`].
    async fn read_body(response: reqwest::Response) -> Result<(StatusCode, String)> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                if let Some(message) = error.message {
                    let code = error.code.unwrap_or_else(|| "error".to_string());
                    return Err(SyncClientError::api(
                        status.as_u16(),
                        format!("{}: {}", code, message),
                    ));
                }
            }
            return Err(SyncClientError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }
        Ok((status, body))
    }

    /// Upload one mutation. The mutation id travels as the idempotency key so
    /// a retried upload is merged by the backend.
    ///
    /// POST /rest/v1/mutations
    pub async fn post_mutation(&self, token: &str, entry: &OutboxEntry) -> Result<MutationAck> {
        let url = format!("{}/rest/v1/mutations", self.base_url);
        let idempotency_key = HeaderValue::from_str(&entry.mutation_id)
            .map_err(|_| SyncClientError::invalid_request("Invalid mutation id"))?;

        let response = self
            .client
            .post(&url)
            .headers(self.headers(token)?)
            .header(IDEMPOTENCY_KEY, idempotency_key)
            .json(&MutationRequest::from(entry))
            .send()
            .await?;
        let (_, body) = Self::read_body(response).await?;

        if body.trim().is_empty() {
            return Ok(MutationAck {
                mutation_id: entry.mutation_id.clone(),
                row: None,
            });
        }

        let ack: MutationAckResponse = serde_json::from_str(&body)?;
        let row = match (ack.table.as_deref().and_then(Collection::parse), ack.row) {
            (Some(collection), Some(value)) => Some(SyncRow::from_value(collection, value).map_err(
                |err| SyncClientError::invalid_request(format!("Unreadable ack row: {}", err)),
            )?),
            _ => None,
        };
        Ok(MutationAck {
            mutation_id: ack.mutation_id.unwrap_or_else(|| entry.mutation_id.clone()),
            row,
        })
    }

    /// Rows of a collection updated strictly after `since`.
    ///
    /// GET /rest/v1/{collection}?since={ms}&limit={n}
    pub async fn get_changes(
        &self,
        token: &str,
        collection: Collection,
        since: i64,
        limit: i64,
    ) -> Result<FetchPage> {
        let url = format!("{}/rest/v1/{}", self.base_url, collection.as_str());
        let query = [("since", since.to_string()), ("limit", limit.to_string())];

        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .query(&query)
            .send()
            .await?;
        let (_, body) = Self::read_body(response).await?;
        let page: FetchPageResponse = serde_json::from_str(&body)?;

        let mut rows = Vec::with_capacity(page.rows.len());
        for value in page.rows {
            match SyncRow::from_value(collection, value) {
                Ok(row) => rows.push(row),
                Err(err) => log::warn!(
                    "[Api] Dropping unreadable {} row from delta page: {}",
                    collection,
                    err
                ),
            }
        }
        Ok(FetchPage {
            rows,
            has_more: page.has_more,
        })
    }

    /// Single message lookup. `None` when the backend has no such message.
    ///
    /// GET /rest/v1/messages/{id}?conversation_id={id}
    pub async fn get_message(
        &self,
        token: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<Option<SyncRow>> {
        let url = format!(
            "{}/rest/v1/messages/{}",
            self.base_url,
            urlencoding::encode(message_id)
        );
        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let (_, body) = Self::read_body(response).await?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        if value.is_null() {
            return Ok(None);
        }
        let row = SyncRow::from_value(Collection::Messages, value)
            .map_err(|err| SyncClientError::invalid_request(format!("Unreadable message: {}", err)))?;
        Ok(Some(row))
    }
}

#[async_trait]
impl RemoteBackend for HuddleApiClient {
    async fn send_mutation(&self, token: &str, entry: &OutboxEntry) -> CoreResult<MutationAck> {
        Ok(self.post_mutation(token, entry).await?)
    }

    async fn fetch_since(
        &self,
        token: &str,
        collection: Collection,
        since: i64,
        limit: i64,
    ) -> CoreResult<FetchPage> {
        Ok(self.get_changes(token, collection, since, limit).await?)
    }

    async fn fetch_entity(
        &self,
        token: &str,
        entity_id: &str,
        conversation_id: &str,
    ) -> CoreResult<Option<SyncRow>> {
        Ok(self.get_message(token, entity_id, conversation_id).await?)
    }
}
