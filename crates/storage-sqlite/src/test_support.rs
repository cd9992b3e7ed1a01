use tempfile::tempdir;

use huddle_core::messaging::{Conversation, Membership, Message, MessageType, MessagingRepositoryTrait};
use huddle_core::sync::SyncRow;

use crate::db::ConnectionOptions;
use crate::store::LocalStore;

pub(crate) fn setup_store() -> LocalStore {
    let app_data = tempdir()
        .expect("tempdir")
        .keep()
        .to_string_lossy()
        .to_string();
    LocalStore::open(&app_data, ConnectionOptions::default()).expect("open store")
}

pub(crate) fn conversation(id: &str, updated_at: i64) -> Conversation {
    Conversation {
        id: id.to_string(),
        name: format!("Conversation {}", id),
        created_by: None,
        created_at: updated_at,
        updated_at,
    }
}

pub(crate) fn membership(conversation_id: &str, actor_id: &str, updated_at: i64) -> Membership {
    Membership {
        conversation_id: conversation_id.to_string(),
        actor_id: actor_id.to_string(),
        joined_at: updated_at,
        last_read_at: 0,
        last_read_message_id: None,
        updated_at,
    }
}

pub(crate) fn message(id: &str, conversation_id: &str, actor_id: &str, created_at: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        actor_id: actor_id.to_string(),
        content: format!("body of {}", id),
        message_type: MessageType::Text,
        parent_id: None,
        created_at,
        updated_at: created_at,
        is_ghost: false,
        category: None,
        image_url: None,
    }
}

pub(crate) async fn seed_conversation(store: &LocalStore, id: &str) {
    store
        .messaging()
        .upsert(SyncRow::Conversation(conversation(id, 1)))
        .await
        .expect("seed conversation");
}
