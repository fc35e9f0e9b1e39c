use chat_protocol::{UserId, UserProfile};
use rusqlite::{Connection, OptionalExtension};

/// Look up display data for a user.
///
/// Profiles belong to the account service; a missing row or a failed query
/// yields a profile with null fields instead of an error.
pub fn lookup_profile(conn: &Connection, user: &UserId) -> UserProfile {
    let row = conn
        .query_row(
            "SELECT name, avatar FROM user_profiles WHERE user_id = ?1",
            [user.as_str()],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional();
    match row {
        Ok(Some((name, avatar))) => UserProfile {
            id: user.clone(),
            name,
            avatar,
        },
        Ok(None) => UserProfile::unknown(user.clone()),
        Err(e) => {
            tracing::warn!(user = %user, error = %e, "profile lookup failed");
            UserProfile::unknown(user.clone())
        }
    }
}
