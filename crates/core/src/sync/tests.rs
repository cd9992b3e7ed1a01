use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::errors::{Error, Result};
use crate::messaging::{Conversation, Membership, Message, MessageType};

fn conversation(id: &str, updated_at: i64) -> SyncRow {
    SyncRow::Conversation(Conversation {
        id: id.to_string(),
        name: format!("Group {id}"),
        created_by: None,
        created_at: updated_at,
        updated_at,
    })
}

fn message(id: &str, conversation_id: &str, parent_id: Option<&str>, updated_at: i64) -> SyncRow {
    SyncRow::Message(Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        actor_id: "u1".to_string(),
        content: "hi".to_string(),
        message_type: MessageType::Text,
        parent_id: parent_id.map(str::to_string),
        created_at: updated_at,
        updated_at,
        is_ghost: false,
        category: None,
        image_url: None,
    })
}

fn membership(conversation_id: &str, actor_id: &str, updated_at: i64) -> SyncRow {
    SyncRow::Membership(Membership {
        conversation_id: conversation_id.to_string(),
        actor_id: actor_id.to_string(),
        joined_at: updated_at,
        last_read_at: 0,
        last_read_message_id: None,
        updated_at,
    })
}

#[test]
fn lww_newer_or_equal_timestamp_wins() {
    assert!(should_apply_lww(1_000, 2_000));
    assert!(should_apply_lww(1_000, 1_000));
    assert!(!should_apply_lww(2_000, 1_000));
}

#[test]
fn collection_serialization_matches_backend_contract() {
    let actual = SYNC_COLLECTIONS
        .iter()
        .map(|collection| serde_json::to_string(collection).expect("serialize collection"))
        .collect::<Vec<_>>();
    assert_eq!(
        actual,
        vec![
            "\"conversations\"",
            "\"users\"",
            "\"memberships\"",
            "\"messages\""
        ]
    );
    assert_eq!(Collection::parse("groups"), Some(Collection::Conversations));
    assert_eq!(
        Collection::parse("group_members"),
        Some(Collection::Memberships)
    );
    assert_eq!(Collection::parse("polls"), None);
}

#[test]
fn parent_first_ordering_puts_conversations_before_children() {
    let ordered = order_parent_first(vec![
        message("m1", "c1", None, 30),
        membership("c1", "u1", 20),
        conversation("c1", 40),
    ]);
    let collections = ordered
        .iter()
        .map(SyncRow::collection)
        .collect::<Vec<_>>();
    assert_eq!(
        collections,
        vec![
            Collection::Conversations,
            Collection::Memberships,
            Collection::Messages
        ]
    );
}

#[test]
fn replies_follow_their_parent_within_a_batch() {
    let ordered = order_parent_first(vec![
        message("reply", "c1", Some("root"), 10),
        message("root", "c1", None, 20),
        message("other", "c1", Some("not-in-batch"), 5),
    ]);
    let ids = ordered.iter().map(SyncRow::entity_id).collect::<Vec<_>>();
    let root = ids.iter().position(|id| id == "root").expect("root");
    let reply = ids.iter().position(|id| id == "reply").expect("reply");
    assert!(root < reply);
    assert_eq!(ids[0], "other");
}

#[test]
fn sync_row_parses_backend_json() {
    let row = SyncRow::from_value(
        Collection::Messages,
        serde_json::json!({
            "id": "m1",
            "conversation_id": "c1",
            "actor_id": "u1",
            "content": "hello",
            "message_type": "confession",
            "created_at": 10,
            "updated_at": 11
        }),
    )
    .expect("parse message");
    match row {
        SyncRow::Message(message) => {
            assert_eq!(message.message_type, MessageType::Unknown);
            assert!(!message.is_ghost);
            assert_eq!(message.parent_id, None);
        }
        other => panic!("unexpected row {other:?}"),
    }
    assert_eq!(
        membership("c1", "u2", 1).entity_id(),
        "c1:u2".to_string()
    );
}

#[test]
fn checksum_ignores_key_order_but_not_versions() {
    let a = collection_checksum(vec![("m1", 1), ("m2", 2)]);
    let b = collection_checksum(vec![("m2", 2), ("m1", 1)]);
    let c = collection_checksum(vec![("m2", 3), ("m1", 1)]);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64);
}

#[test]
fn manual_clock_advances_on_demand() {
    let clock = ManualClock::new(1_000);
    clock.advance(Duration::from_secs(2));
    assert_eq!(clock.now_millis(), 3_000);
}

#[tokio::test(start_paused = true)]
async fn with_timeout_reports_elapsed_as_error() {
    let result: Result<()> = with_timeout(Duration::from_millis(50), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;
    assert!(matches!(result, Err(Error::Timeout(50))));
}

struct HangingSession {
    resets: AtomicUsize,
}

#[async_trait]
impl SessionProvider for HangingSession {
    async fn access_token(&self) -> Result<String> {
        std::future::pending::<()>().await;
        Ok("never".to_string())
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_session_is_reset_after_timeout() {
    let session = HangingSession {
        resets: AtomicUsize::new(0),
    };
    let result = session.get_valid_token(Duration::from_secs(3)).await;
    assert!(result.expect_err("should time out").is_timeout());
    assert_eq!(session.resets.load(Ordering::SeqCst), 1);
}
