use crate::{
    db::{self, parse_column, parse_optional_column},
    error::{ChatError, Result},
    messages, profiles, reads,
};
use chat_protocol::{
    Conversation, ConversationId, ConversationKind, ConversationView, MessageId, Page, UserId,
};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::Deserialize;
use uuid::Uuid;

pub const INBOX_DEFAULT_LIMIT: u32 = 30;
pub const INBOX_MAX_LIMIT: u32 = 50;

const CONVERSATION_COLUMNS: &str = "c.id, c.kind, c.title, c.avatar, c.created_by, \
     c.last_message_id, c.last_message_at, c.created_at, c.updated_at";

/// Request to open a conversation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Deterministic id for the direct conversation between two users, so
/// every creator of the same pair lands on the same row.
pub fn direct_conversation_id(a: &UserId, b: &UserId) -> ConversationId {
    let (min, max) = if a <= b { (a, b) } else { (b, a) };
    // length prefix keeps ids that contain the separator from colliding
    let name = format!("direct:{}:{}{}", min.as_str().len(), min, max);
    ConversationId::from(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
}

/// Create a conversation, or return the existing direct conversation for
/// the same pair. The flag is true when a new record was written.
pub fn create_conversation(
    conn: &Connection,
    requester: &UserId,
    new: NewConversation,
) -> Result<(Conversation, bool)> {
    let mut members: Vec<UserId> = Vec::with_capacity(new.member_ids.len() + 1);
    for id in new
        .member_ids
        .into_iter()
        .chain(std::iter::once(requester.clone()))
    {
        if !members.contains(&id) {
            members.push(id);
        }
    }

    let (id, title, avatar) = match new.kind {
        ConversationKind::Direct => {
            let [a, b] = members.as_slice() else {
                return Err(ChatError::invalid(format!(
                    "a direct conversation needs exactly 2 distinct members, got {}",
                    members.len()
                )));
            };
            (direct_conversation_id(a, b), String::new(), String::new())
        }
        ConversationKind::Group => (
            ConversationId::new(),
            new.title.unwrap_or_default(),
            new.avatar.unwrap_or_default(),
        ),
    };

    let now = db::now_millis();
    let tx = conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO conversations (id, kind, title, avatar, created_by, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            id.to_string(),
            new.kind.as_str(),
            title,
            avatar,
            requester.as_str(),
            now
        ],
    )?;
    if inserted > 0 {
        let mut stmt = tx.prepare(
            "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)",
        )?;
        for member in &members {
            stmt.execute(params![id.to_string(), member.as_str()])?;
        }
    }
    let conversation = load_conversation(&tx, &id)?.ok_or(ChatError::NotFound("conversation"))?;
    let same_members = conversation.member_ids.len() == members.len()
        && members.iter().all(|m| conversation.has_member(m));
    if !same_members {
        return Err(ChatError::Internal(format!(
            "conversation {id} exists with a different member set"
        )));
    }
    tx.commit()?;
    Ok((conversation, inserted > 0))
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let kind: String = row.get(1)?;
    let kind = ConversationKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown conversation kind {kind}").into(),
        )
    })?;
    Ok(Conversation {
        id: parse_column(row, 0)?,
        kind,
        member_ids: Vec::new(),
        title: row.get(2)?,
        avatar: row.get(3)?,
        created_by: parse_column(row, 4)?,
        last_message_id: parse_optional_column(row, 5)?,
        last_message_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn load_members(conn: &Connection, id: &ConversationId) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_members WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let members = stmt
        .query_map([id.to_string()], |row| parse_column(row, 0))?
        .collect::<Result<Vec<UserId>, _>>()?;
    Ok(members)
}

pub fn load_conversation(conn: &Connection, id: &ConversationId) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"
    ))?;
    let Some(mut conversation) = stmt
        .query_row([id.to_string()], row_to_conversation)
        .optional()?
    else {
        return Ok(None);
    };
    conversation.member_ids = load_members(conn, id)?;
    Ok(Some(conversation))
}

/// Membership gate shared by every per-conversation operation.
pub fn authorize(conn: &Connection, user: &UserId, id: &ConversationId) -> Result<Conversation> {
    let conversation = load_conversation(conn, id)?.ok_or(ChatError::NotFound("conversation"))?;
    if !conversation.has_member(user) {
        return Err(ChatError::Forbidden);
    }
    Ok(conversation)
}

/// Attach the viewer-specific fields: the counterpart's profile for direct
/// conversations.
pub fn enrich(conn: &Connection, viewer: &UserId, conversation: Conversation) -> ConversationView {
    let other_user = conversation
        .other_member(viewer)
        .map(|other| profiles::lookup_profile(conn, other));
    ConversationView {
        conversation,
        other_user,
        last_message: None,
        unread_count: None,
    }
}

pub fn get_conversation(
    conn: &Connection,
    user: &UserId,
    id: &ConversationId,
) -> Result<ConversationView> {
    let conversation = authorize(conn, user, id)?;
    Ok(enrich(conn, user, conversation))
}

/// Conversations the user belongs to, most recently active first.
///
/// The cursor is the `updatedAt` of the last item of the previous page.
/// A conversation that moves rank between two page fetches can be skipped
/// or repeated across pages.
pub fn list_inbox(
    conn: &Connection,
    user: &UserId,
    cursor: Option<i64>,
    limit: Option<i64>,
) -> Result<Page<ConversationView>> {
    let limit = db::clamp_limit(limit, INBOX_DEFAULT_LIMIT, INBOX_MAX_LIMIT);
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
         JOIN conversation_members m ON m.conversation_id = c.id \
         WHERE m.user_id = ?1 AND c.updated_at < ?2 \
         ORDER BY c.updated_at DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![user.as_str(), cursor.unwrap_or(i64::MAX), limit],
            row_to_conversation,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for mut conversation in rows {
        conversation.member_ids = load_members(conn, &conversation.id)?;
        let last_message = match &conversation.last_message_id {
            Some(id) => messages::get_message(conn, id)?,
            None => None,
        };
        let unread = reads::unread_count(conn, user, &conversation.id)?;
        let mut view = enrich(conn, user, conversation);
        view.last_message = last_message;
        view.unread_count = Some(unread);
        items.push(view);
    }
    Ok(Page::new(items, |v| v.conversation.updated_at))
}

/// Move the denormalized last-message pointer. Runs after the message row
/// is written and is not atomic with it.
pub fn record_last_message(
    conn: &Connection,
    id: &ConversationId,
    message_id: &MessageId,
    at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET last_message_id = ?2, last_message_at = ?3, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), message_id.to_string(), at],
    )?;
    Ok(())
}
