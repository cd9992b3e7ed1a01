//! Database models for messaging tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use huddle_core::messaging::{Conversation, Membership, Message, MessageType, User};

use crate::utils::{enum_from_db, enum_to_db};

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct ConversationDB {
    pub id: String,
    pub name: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<ConversationDB> for Conversation {
    fn from(db: ConversationDB) -> Self {
        Self {
            id: db.id,
            name: db.name,
            created_by: db.created_by,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

impl From<Conversation> for ConversationDB {
    fn from(domain: Conversation) -> Self {
        Self {
            id: domain.id,
            name: domain.name,
            created_by: domain.created_by,
            created_at: domain.created_at,
            updated_at: domain.updated_at,
        }
    }
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct UserDB {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub updated_at: i64,
}

impl From<UserDB> for User {
    fn from(db: UserDB) -> Self {
        Self {
            id: db.id,
            display_name: db.display_name,
            avatar_url: db.avatar_url,
            updated_at: db.updated_at,
        }
    }
}

impl From<User> for UserDB {
    fn from(domain: User) -> Self {
        Self {
            id: domain.id,
            display_name: domain.display_name,
            avatar_url: domain.avatar_url,
            updated_at: domain.updated_at,
        }
    }
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(conversation_id, actor_id))]
#[diesel(table_name = crate::schema::memberships)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct MembershipDB {
    pub conversation_id: String,
    pub actor_id: String,
    pub joined_at: i64,
    pub last_read_at: i64,
    pub last_read_message_id: Option<String>,
    pub updated_at: i64,
}

impl From<MembershipDB> for Membership {
    fn from(db: MembershipDB) -> Self {
        Self {
            conversation_id: db.conversation_id,
            actor_id: db.actor_id,
            joined_at: db.joined_at,
            last_read_at: db.last_read_at,
            last_read_message_id: db.last_read_message_id,
            updated_at: db.updated_at,
        }
    }
}

impl From<Membership> for MembershipDB {
    fn from(domain: Membership) -> Self {
        Self {
            conversation_id: domain.conversation_id,
            actor_id: domain.actor_id,
            joined_at: domain.joined_at,
            last_read_at: domain.last_read_at,
            last_read_message_id: domain.last_read_message_id,
            updated_at: domain.updated_at,
        }
    }
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct MessageDB {
    pub id: String,
    pub conversation_id: String,
    pub actor_id: String,
    pub content: String,
    pub message_type: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_ghost: bool,
    pub category: Option<String>,
    pub image_url: Option<String>,
}

impl From<MessageDB> for Message {
    fn from(db: MessageDB) -> Self {
        Self {
            id: db.id,
            conversation_id: db.conversation_id,
            actor_id: db.actor_id,
            content: db.content,
            message_type: enum_from_db(&db.message_type).unwrap_or(MessageType::Unknown),
            parent_id: db.parent_id,
            created_at: db.created_at,
            updated_at: db.updated_at,
            is_ghost: db.is_ghost,
            category: db.category,
            image_url: db.image_url,
        }
    }
}

impl MessageDB {
    pub fn from_domain(domain: Message) -> huddle_core::Result<Self> {
        Ok(Self {
            message_type: enum_to_db(&domain.message_type)?,
            id: domain.id,
            conversation_id: domain.conversation_id,
            actor_id: domain.actor_id,
            content: domain.content,
            parent_id: domain.parent_id,
            created_at: domain.created_at,
            updated_at: domain.updated_at,
            is_ghost: domain.is_ghost,
            category: domain.category,
            image_url: domain.image_url,
        })
    }
}
