// Diesel schema for the local store. Keep in sync with `migrations/`.

diesel::table! {
    conversations (id) {
        id -> Text,
        name -> Text,
        created_by -> Nullable<Text>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    users (id) {
        id -> Text,
        display_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        updated_at -> BigInt,
    }
}

diesel::table! {
    memberships (conversation_id, actor_id) {
        conversation_id -> Text,
        actor_id -> Text,
        joined_at -> BigInt,
        last_read_at -> BigInt,
        last_read_message_id -> Nullable<Text>,
        updated_at -> BigInt,
    }
}

diesel::table! {
    messages (id) {
        id -> Text,
        conversation_id -> Text,
        actor_id -> Text,
        content -> Text,
        message_type -> Text,
        parent_id -> Nullable<Text>,
        created_at -> BigInt,
        updated_at -> BigInt,
        is_ghost -> Bool,
        category -> Nullable<Text>,
        image_url -> Nullable<Text>,
    }
}

diesel::table! {
    outbox (local_seq) {
        local_seq -> BigInt,
        mutation_id -> Text,
        kind -> Text,
        conversation_id -> Text,
        actor_id -> Text,
        entity_id -> Text,
        payload -> Text,
        status -> Text,
        retry_count -> Integer,
        next_retry_at -> BigInt,
        last_error -> Nullable<Text>,
        last_error_code -> Nullable<Text>,
        created_at -> BigInt,
    }
}

diesel::table! {
    tombstones (entity_id) {
        entity_id -> Text,
        entity_kind -> Text,
        deleted_at -> BigInt,
    }
}

diesel::table! {
    sync_cursors (collection) {
        collection -> Text,
        last_sync_timestamp -> BigInt,
        checksum -> Nullable<Text>,
        updated_at -> BigInt,
    }
}

diesel::joinable!(memberships -> conversations (conversation_id));
diesel::joinable!(messages -> conversations (conversation_id));

diesel::allow_tables_to_appear_in_same_query!(
    conversations,
    users,
    memberships,
    messages,
    outbox,
    tombstones,
    sync_cursors,
);
