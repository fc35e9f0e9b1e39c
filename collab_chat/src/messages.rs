use crate::{
    conversations,
    db::{self, parse_column},
    error::Result,
};
use chat_protocol::{ConversationId, Message, MessageBody, MessageId, Page, UserId};
use rusqlite::{params, types::Type, Connection, OptionalExtension};

pub const HISTORY_DEFAULT_LIMIT: u32 = 30;
pub const HISTORY_MAX_LIMIT: u32 = 100;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, body, created_at, edited_at, deleted_at";

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let body: String = row.get(3)?;
    let body: MessageBody = serde_json::from_str(&body)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Message {
        id: parse_column(row, 0)?,
        conversation_id: parse_column(row, 1)?,
        sender_id: parse_column(row, 2)?,
        body,
        created_at: row.get(4)?,
        edited_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

/// Append a message and move the conversation's last-message pointer.
///
/// The sender must be a member at call time. The message row is written
/// before the pointer so the inbox never references a missing message; a
/// crash between the two leaves the pointer stale until the next send.
pub fn append_message(
    conn: &Connection,
    sender: &UserId,
    conversation_id: &ConversationId,
    body: MessageBody,
) -> Result<Message> {
    conversations::authorize(conn, sender, conversation_id)?;
    let id = MessageId::new();
    let now = db::now_millis();
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, kind, body, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            conversation_id.to_string(),
            sender.as_str(),
            body.kind().as_str(),
            serde_json::to_string(&body)?,
            now
        ],
    )?;
    conversations::record_last_message(conn, conversation_id, &id, now)?;
    Ok(Message {
        id,
        conversation_id: *conversation_id,
        sender_id: sender.clone(),
        body,
        created_at: now,
        edited_at: None,
        deleted_at: None,
    })
}

pub fn get_message(conn: &Connection, id: &MessageId) -> Result<Option<Message>> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    Ok(stmt.query_row([id.to_string()], row_to_msg).optional()?)
}

/// Visible history of a conversation, newest first, strictly older than
/// the `before` cursor.
pub fn list_messages(
    conn: &Connection,
    user: &UserId,
    conversation_id: &ConversationId,
    before: Option<i64>,
    limit: Option<i64>,
) -> Result<Page<Message>> {
    conversations::authorize(conn, user, conversation_id)?;
    let limit = db::clamp_limit(limit, HISTORY_DEFAULT_LIMIT, HISTORY_MAX_LIMIT);
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE conversation_id = ?1 AND deleted_at IS NULL AND created_at < ?2 \
         ORDER BY created_at DESC, rowid DESC LIMIT ?3"
    ))?;
    let items = stmt
        .query_map(
            params![
                conversation_id.to_string(),
                before.unwrap_or(i64::MAX),
                limit
            ],
            row_to_msg,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, |m| m.created_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::{create_conversation, NewConversation};
    use crate::error::ChatError;
    use chat_protocol::{ConversationKind, FileContent};

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn setup() -> (Connection, ConversationId) {
        let conn = db::init_db(":memory:").unwrap();
        let (conv, _) = create_conversation(
            &conn,
            &uid("alice"),
            NewConversation {
                kind: ConversationKind::Direct,
                member_ids: vec![uid("bob")],
                title: None,
                avatar: None,
            },
        )
        .unwrap();
        (conn, conv.id)
    }

    #[test]
    fn append_moves_last_message_pointer() {
        let (conn, conv) = setup();
        let m = append_message(&conn, &uid("alice"), &conv, MessageBody::text("hi")).unwrap();
        let stored = conversations::load_conversation(&conn, &conv)
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_message_id, Some(m.id));
        assert_eq!(stored.last_message_at, Some(m.created_at));
        assert_eq!(stored.updated_at, m.created_at);
        assert_eq!(get_message(&conn, &m.id).unwrap().unwrap(), m);
    }

    #[test]
    fn pagination_order() {
        let (conn, conv) = setup();
        let alice = uid("alice");
        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(append_message(&conn, &alice, &conv, MessageBody::text(format!("m{i}"))).unwrap());
        }
        let all = list_messages(&conn, &alice, &conv, None, Some(10)).unwrap();
        let newest_first: Vec<_> = sent.iter().rev().map(|m| m.id).collect();
        assert_eq!(all.items.iter().map(|m| m.id).collect::<Vec<_>>(), newest_first);

        let first = list_messages(&conn, &alice, &conv, None, Some(2)).unwrap();
        assert_eq!(first.items.len(), 2);
        let second = list_messages(&conn, &alice, &conv, first.next_cursor, Some(2)).unwrap();
        let third = list_messages(&conn, &alice, &conv, second.next_cursor, Some(2)).unwrap();
        let mut combined = first.items.clone();
        combined.extend(second.items);
        combined.extend(third.items);
        assert_eq!(combined, all.items);
    }

    #[test]
    fn cursor_older_than_everything_ends_listing() {
        let (conn, conv) = setup();
        let bob = uid("bob");
        let m = append_message(&conn, &bob, &conv, MessageBody::text("only")).unwrap();
        let page = list_messages(&conn, &bob, &conv, Some(m.created_at), None).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn limits_are_clamped() {
        let (conn, conv) = setup();
        let alice = uid("alice");
        for i in 0..120 {
            append_message(&conn, &alice, &conv, MessageBody::text(format!("{i}"))).unwrap();
        }
        assert_eq!(list_messages(&conn, &alice, &conv, None, Some(0)).unwrap().items.len(), 30);
        assert_eq!(list_messages(&conn, &alice, &conv, None, Some(-3)).unwrap().items.len(), 30);
        assert_eq!(list_messages(&conn, &alice, &conv, None, Some(500)).unwrap().items.len(), 100);
    }

    #[test]
    fn soft_deleted_messages_are_hidden() {
        let (conn, conv) = setup();
        let alice = uid("alice");
        let keep = append_message(&conn, &alice, &conv, MessageBody::text("keep")).unwrap();
        let gone = append_message(
            &conn,
            &alice,
            &conv,
            MessageBody::File(FileContent {
                url: "https://files/x.pdf".into(),
                name: "x.pdf".into(),
                size: Some(12),
                mime: None,
            }),
        )
        .unwrap();
        conn.execute(
            "UPDATE messages SET deleted_at = ?2 WHERE id = ?1",
            params![gone.id.to_string(), db::now_millis()],
        )
        .unwrap();
        let page = list_messages(&conn, &alice, &conv, None, None).unwrap();
        assert_eq!(page.items, vec![keep]);
    }

    #[test]
    fn unknown_conversation_is_not_found() {
        let conn = db::init_db(":memory:").unwrap();
        let res = list_messages(&conn, &uid("alice"), &ConversationId::new(), None, None);
        assert!(matches!(res, Err(ChatError::NotFound(_))));
    }
}
