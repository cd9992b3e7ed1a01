//! Push wake-ups: fetch a single missing message, or ingest the message a
//! push notification carries and decide how to surface it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use log::{debug, info, warn};
use serde::Serialize;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::{Message, MessageType, MessagingRepositoryTrait};
use huddle_core::sync::{
    with_timeout, ApplyOutcome, Clock, RemoteBackend, SessionProvider, SyncRow,
    TombstoneRepositoryTrait,
};

const NEW_MESSAGE_PUSH: &str = "new_message";
const DEFAULT_TITLE: &str = "New message";
const DEFAULT_BODY: &str = "You have a new message";

/// A message as delivered in a push payload's data map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPayload {
    pub message_id: String,
    pub conversation_id: String,
    pub actor_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: Option<i64>,
    pub is_ghost: bool,
    pub conversation_name: Option<String>,
    pub category: Option<String>,
    pub parent_id: Option<String>,
    pub image_url: Option<String>,
}

fn non_empty(data: &HashMap<String, String>, key: &str) -> Option<String> {
    data.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn required(data: &HashMap<String, String>, key: &str) -> Result<String> {
    non_empty(data, key).ok_or_else(|| Error::InvalidInput(format!("push payload without {}", key)))
}

impl PushPayload {
    /// Parses the flat string map of a `new_message` push.
    pub fn from_data(data: &HashMap<String, String>) -> Result<Self> {
        match data.get("type").map(String::as_str) {
            Some(NEW_MESSAGE_PUSH) => {}
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported push type {:?}",
                    other
                )))
            }
        }

        let message_type = non_empty(data, "msg_type")
            .map(|kind| {
                serde_json::from_value(serde_json::Value::String(kind))
                    .unwrap_or(MessageType::Unknown)
            })
            .unwrap_or_default();
        let created_at = non_empty(data, "created_at").and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|parsed| parsed.timestamp_millis())
                .map_err(|err| debug!("[PushWake] Unparseable created_at {:?}: {}", raw, err))
                .ok()
        });

        Ok(Self {
            message_id: required(data, "message_id")?,
            conversation_id: required(data, "group_id")?,
            actor_id: required(data, "user_id")?,
            content: data.get("content").cloned().unwrap_or_default(),
            message_type,
            created_at,
            is_ghost: data
                .get("is_ghost")
                .is_some_and(|value| value.eq_ignore_ascii_case("true")),
            conversation_name: non_empty(data, "group_name"),
            category: non_empty(data, "category"),
            parent_id: non_empty(data, "parent_id"),
            image_url: non_empty(data, "image_url"),
        })
    }

    /// The message row, stamped with `now` when the payload carried no usable
    /// timestamp.
    pub fn to_message(&self, now: i64) -> Message {
        let created_at = self.created_at.unwrap_or(now);
        Message {
            id: self.message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            actor_id: self.actor_id.clone(),
            content: self.content.clone(),
            message_type: self.message_type,
            parent_id: self.parent_id.clone(),
            created_at,
            updated_at: created_at,
            is_ghost: self.is_ghost,
            category: self.category.clone(),
            image_url: self.image_url.clone(),
        }
    }

    fn notification_text(&self) -> (String, String) {
        let title = self
            .conversation_name
            .clone()
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let body = if self.content.trim().is_empty() {
            DEFAULT_BODY.to_string()
        } else {
            self.content.clone()
        };
        (title, body)
    }
}

/// Where the app is when a push arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppPresence {
    Background,
    Foreground { open_conversation: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PushDisposition {
    Notify { title: String, body: String },
    NotifyAndBumpUnread { title: String, body: String },
    /// The conversation is on screen; reload it without a notification.
    RefreshOpenView { conversation_id: String },
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushIngest {
    pub disposition: PushDisposition,
    /// The message could not be stored as is; run a full reconcile.
    pub needs_reconcile: bool,
}

pub struct PushWakeHandler {
    messaging: Arc<dyn MessagingRepositoryTrait>,
    tombstones: Arc<dyn TombstoneRepositoryTrait>,
    backend: Arc<dyn RemoteBackend>,
    session: Arc<dyn SessionProvider>,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    token_timeout: Duration,
}

impl PushWakeHandler {
    pub fn new(
        messaging: Arc<dyn MessagingRepositoryTrait>,
        tombstones: Arc<dyn TombstoneRepositoryTrait>,
        backend: Arc<dyn RemoteBackend>,
        session: Arc<dyn SessionProvider>,
        clock: Arc<dyn Clock>,
        fetch_timeout: Duration,
        token_timeout: Duration,
    ) -> Self {
        Self {
            messaging,
            tombstones,
            backend,
            session,
            clock,
            fetch_timeout,
            token_timeout,
        }
    }

    /// Makes sure `entity_id` is stored locally. Returns true when the caller
    /// should fall back to a full reconcile.
    pub async fn fetch_if_absent(&self, entity_id: &str, conversation_id: &str) -> bool {
        match self.try_fetch(entity_id, conversation_id).await {
            Ok(needs_reconcile) => needs_reconcile,
            Err(err) => {
                warn!(
                    "[PushWake] Fetch of {} failed, falling back to reconcile: {}",
                    entity_id, err
                );
                true
            }
        }
    }

    async fn try_fetch(&self, entity_id: &str, conversation_id: &str) -> Result<bool> {
        if self.tombstones.is_deleted(entity_id)? {
            debug!("[PushWake] {} is deleted locally", entity_id);
            return Ok(false);
        }
        if self.messaging.get_message(entity_id)?.is_some() {
            debug!("[PushWake] {} already stored", entity_id);
            return Ok(false);
        }

        let token = self.session.get_valid_token(self.token_timeout).await?;
        let fetched = with_timeout(
            self.fetch_timeout,
            self.backend.fetch_entity(&token, entity_id, conversation_id),
        )
        .await?;
        let Some(row) = fetched else {
            debug!("[PushWake] {} not found remotely", entity_id);
            return Ok(false);
        };

        let report = self.messaging.apply_remote_rows(vec![row]).await?;
        Ok(needs_reconcile(&report.outcome_for(entity_id).cloned(), report.is_complete()))
    }

    /// Stores the message carried by a push and decides how to surface it.
    pub async fn ingest_push_message(
        &self,
        payload: &PushPayload,
        presence: &AppPresence,
        current_actor: Option<&str>,
    ) -> Result<PushIngest> {
        if self.tombstones.is_deleted(&payload.message_id)? {
            debug!("[PushWake] Push for deleted {} ignored", payload.message_id);
            return Ok(PushIngest {
                disposition: PushDisposition::Suppressed,
                needs_reconcile: false,
            });
        }

        let message = payload.to_message(self.clock.now_millis());
        let needs_reconcile = match self
            .messaging
            .apply_remote_rows(vec![SyncRow::Message(message)])
            .await
        {
            Ok(report) => {
                let outcome = report.outcome_for(&payload.message_id).cloned();
                if outcome == Some(ApplyOutcome::Tombstoned) {
                    return Ok(PushIngest {
                        disposition: PushDisposition::Suppressed,
                        needs_reconcile: false,
                    });
                }
                needs_reconcile(&outcome, report.is_complete())
            }
            Err(err) => {
                warn!(
                    "[PushWake] Could not store pushed {}: {}",
                    payload.message_id, err
                );
                true
            }
        };

        let disposition = decide(payload, presence, current_actor);
        info!(
            "[PushWake] {} in {}: {:?}",
            payload.message_id, payload.conversation_id, disposition
        );
        Ok(PushIngest {
            disposition,
            needs_reconcile,
        })
    }
}

fn needs_reconcile(outcome: &Option<ApplyOutcome>, complete: bool) -> bool {
    match outcome {
        Some(ApplyOutcome::Orphaned { parent, parent_id }) => {
            debug!("[PushWake] Parent {} {} missing", parent, parent_id);
            true
        }
        Some(_) => !complete,
        None => true,
    }
}

fn decide(payload: &PushPayload, presence: &AppPresence, current_actor: Option<&str>) -> PushDisposition {
    if current_actor == Some(payload.actor_id.as_str()) {
        return PushDisposition::Suppressed;
    }
    let (title, body) = payload.notification_text();
    match presence {
        AppPresence::Background => PushDisposition::Notify { title, body },
        AppPresence::Foreground {
            open_conversation: Some(open),
        } if *open == payload.conversation_id => PushDisposition::RefreshOpenView {
            conversation_id: open.clone(),
        },
        AppPresence::Foreground { .. } => PushDisposition::NotifyAndBumpUnread { title, body },
    }
}
