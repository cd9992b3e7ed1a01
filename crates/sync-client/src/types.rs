//! Wire types for the REST API and the change stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use huddle_core::sync::{OutboxEntry, OutboxMutationKind};

/// Body of `POST /rest/v1/mutations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub mutation_id: String,
    pub kind: OutboxMutationKind,
    pub conversation_id: String,
    pub actor_id: String,
    pub entity_id: String,
    pub payload: Value,
}

impl From<&OutboxEntry> for MutationRequest {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            mutation_id: entry.mutation_id.clone(),
            kind: entry.kind,
            conversation_id: entry.conversation_id.clone(),
            actor_id: entry.actor_id.clone(),
            entity_id: entry.entity_id.clone(),
            payload: entry.payload.clone(),
        }
    }
}

/// Raw page returned by `GET /rest/v1/{collection}`. Rows are decoded per
/// collection by the client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPageResponse {
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationAckResponse {
    #[serde(default)]
    pub mutation_id: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub row: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AuthErrorResponse {
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Frames the client sends on the change stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame<'a> {
    Subscribe {
        filter: &'a huddle_core::sync::StreamFilter,
    },
    Heartbeat,
}

/// Frames the server sends on the change stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Change {
        op: huddle_core::sync::ChangeOp,
        table: String,
        #[serde(default)]
        row: Option<Value>,
        #[serde(default)]
        filter_match: Option<String>,
    },
    Heartbeat,
    #[serde(other)]
    Other,
}
