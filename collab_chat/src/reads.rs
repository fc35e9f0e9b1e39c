use crate::{
    conversations,
    db::{self, parse_column},
    error::Result,
};
use chat_protocol::{ConversationId, MessageId, ReadState, UserId};
use rusqlite::{params, Connection};

/// Record the last message a member has read.
///
/// No ordering check against the previous pointer: a client may move its
/// own pointer backwards.
pub fn update_read(
    conn: &Connection,
    user: &UserId,
    conversation_id: &ConversationId,
    last_read_message_id: &MessageId,
) -> Result<ReadState> {
    conversations::authorize(conn, user, conversation_id)?;
    let now = db::now_millis();
    conn.execute(
        "INSERT INTO read_states (conversation_id, user_id, last_read_message_id, last_read_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(conversation_id, user_id) DO UPDATE SET \
           last_read_message_id = excluded.last_read_message_id, \
           last_read_at = excluded.last_read_at",
        params![
            conversation_id.to_string(),
            user.as_str(),
            last_read_message_id.to_string(),
            now
        ],
    )?;
    Ok(ReadState {
        conversation_id: *conversation_id,
        user_id: user.clone(),
        last_read_message_id: *last_read_message_id,
        last_read_at: now,
    })
}

/// Read pointers of every member that has one.
pub fn list_read_states(
    conn: &Connection,
    user: &UserId,
    conversation_id: &ConversationId,
) -> Result<Vec<ReadState>> {
    conversations::authorize(conn, user, conversation_id)?;
    let mut stmt = conn.prepare(
        "SELECT conversation_id, user_id, last_read_message_id, last_read_at \
         FROM read_states WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let states = stmt
        .query_map([conversation_id.to_string()], |row| {
            Ok(ReadState {
                conversation_id: parse_column(row, 0)?,
                user_id: parse_column(row, 1)?,
                last_read_message_id: parse_column(row, 2)?,
                last_read_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(states)
}

/// Messages from others newer than the user's read pointer. When the
/// pointer names a message that no longer resolves, its `lastReadAt` is
/// used instead.
pub fn unread_count(
    conn: &Connection,
    user: &UserId,
    conversation_id: &ConversationId,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages m \
         WHERE m.conversation_id = ?1 AND m.deleted_at IS NULL AND m.sender_id <> ?2 \
           AND m.created_at > COALESCE(( \
             SELECT COALESCE(lm.created_at, r.last_read_at) FROM read_states r \
             LEFT JOIN messages lm ON lm.id = r.last_read_message_id \
             WHERE r.conversation_id = ?1 AND r.user_id = ?2), 0)",
        params![conversation_id.to_string(), user.as_str()],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conversations::{create_conversation, NewConversation},
        messages,
    };
    use chat_protocol::{ConversationKind, MessageBody};

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn setup() -> (Connection, ConversationId) {
        let conn = db::init_db(":memory:").unwrap();
        let (conv, _) = create_conversation(
            &conn,
            &uid("alice"),
            NewConversation {
                kind: ConversationKind::Group,
                member_ids: vec![uid("bob"), uid("carol")],
                title: Some("team".into()),
                avatar: None,
            },
        )
        .unwrap();
        (conn, conv.id)
    }

    #[test]
    fn upsert_keeps_one_row_with_latest_values() {
        let (conn, conv) = setup();
        let bob = uid("bob");
        let m1 = messages::append_message(&conn, &uid("alice"), &conv, MessageBody::text("1")).unwrap();
        let m2 = messages::append_message(&conn, &uid("alice"), &conv, MessageBody::text("2")).unwrap();
        let first = update_read(&conn, &bob, &conv, &m1.id).unwrap();
        let second = update_read(&conn, &bob, &conv, &m2.id).unwrap();
        assert!(second.last_read_at > first.last_read_at);

        let states = list_read_states(&conn, &bob, &conv).unwrap();
        assert_eq!(states, vec![second]);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM read_states", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn pointer_may_move_backwards() {
        let (conn, conv) = setup();
        let bob = uid("bob");
        let m1 = messages::append_message(&conn, &uid("alice"), &conv, MessageBody::text("1")).unwrap();
        let m2 = messages::append_message(&conn, &uid("alice"), &conv, MessageBody::text("2")).unwrap();
        update_read(&conn, &bob, &conv, &m2.id).unwrap();
        let back = update_read(&conn, &bob, &conv, &m1.id).unwrap();
        assert_eq!(back.last_read_message_id, m1.id);
        assert_eq!(unread_count(&conn, &bob, &conv).unwrap(), 1);
    }

    #[test]
    fn unread_math() {
        let (conn, conv) = setup();
        let alice = uid("alice");
        let bob = uid("bob");
        messages::append_message(&conn, &alice, &conv, MessageBody::text("a1")).unwrap();
        let a2 = messages::append_message(&conn, &alice, &conv, MessageBody::text("a2")).unwrap();
        messages::append_message(&conn, &bob, &conv, MessageBody::text("b1")).unwrap();
        assert_eq!(unread_count(&conn, &bob, &conv).unwrap(), 2);
        assert_eq!(unread_count(&conn, &alice, &conv).unwrap(), 1);
        update_read(&conn, &bob, &conv, &a2.id).unwrap();
        assert_eq!(unread_count(&conn, &bob, &conv).unwrap(), 0);
        // unknown pointer falls back to the acknowledgement time
        update_read(&conn, &alice, &conv, &MessageId::new()).unwrap();
        assert_eq!(unread_count(&conn, &alice, &conv).unwrap(), 0);
    }
}
