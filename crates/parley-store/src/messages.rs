//! Message persistence.
//!
//! [`MessageRepo`] is the synchronous repository over a [`Database`];
//! [`SqliteMessageStore`] adapts it to the async [`MessageStore`] seam by
//! running every query on the blocking pool.

use async_trait::async_trait;
use chrono::SubsecRound;
use rusqlite::{params, Connection, Row};
use tracing::instrument;

use parley_core::{
    MediaKind, Message, MessageId, MessageKind, NewMessage, RoomId, Route, UserId,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, from_sql_id, to_sql_id};

const TABLE: &str = "messages";

const SELECT_COLUMNS: &str = "SELECT id, sender_id, kind, target_id, room_id, media, content, \
     metadata, created_at, updated_at FROM messages";

/// Durable message repository consumed by the delivery pipeline.
///
/// Every listing is ordered oldest first.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message and return it with its assigned id.
    async fn create(&self, msg: NewMessage) -> Result<Message, StoreError>;

    /// Private messages exchanged between `a` and `b`, in either direction.
    async fn find_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError>;

    async fn find_by_room(&self, room: RoomId) -> Result<Vec<Message>, StoreError>;

    /// Private messages sent or received by `user`.
    async fn find_by_user(&self, user: UserId) -> Result<Vec<Message>, StoreError>;
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, msg), fields(sender_id = %msg.sender_id, kind = %msg.route.kind()))]
    pub fn create(&self, mut msg: NewMessage) -> Result<Message, StoreError> {
        // Stored text keeps microseconds; trim here so the returned value
        // matches what a later read produces.
        msg.created_at = msg.created_at.trunc_subsecs(6);
        msg.updated_at = msg.updated_at.trunc_subsecs(6);

        let metadata = msg.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let sender = to_sql_id(msg.sender_id.get())?;
        let target = msg.route.target().map(|t| to_sql_id(t.get())).transpose()?;
        let room = msg.route.room().map(|r| to_sql_id(r.get())).transpose()?;

        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO messages (sender_id, kind, target_id, room_id, media, content, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    sender,
                    msg.route.kind().as_str(),
                    target,
                    room,
                    msg.media.as_str(),
                    msg.content,
                    metadata,
                    row_helpers::format_timestamp(&msg.created_at),
                    row_helpers::format_timestamp(&msg.updated_at),
                ],
            )?;
            let id = from_sql_id(conn.last_insert_rowid(), TABLE, "id")?;
            Ok(msg.with_id(MessageId::new(id)))
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: MessageId) -> Result<Message, StoreError> {
        let raw = to_sql_id(id.get())?;
        self.db.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
            let mut rows = query(conn, &sql, params![raw])?;
            rows.pop()
                .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
        })
    }

    #[instrument(skip(self), fields(user_a = %a, user_b = %b))]
    pub fn find_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError> {
        let (a, b) = (to_sql_id(a.get())?, to_sql_id(b.get())?);
        self.db.with_conn(|conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE kind = 'private' AND \
                 ((sender_id = ?1 AND target_id = ?2) OR (sender_id = ?2 AND target_id = ?1)) \
                 ORDER BY created_at ASC, id ASC"
            );
            query(conn, &sql, params![a, b])
        })
    }

    #[instrument(skip(self), fields(room_id = %room))]
    pub fn find_by_room(&self, room: RoomId) -> Result<Vec<Message>, StoreError> {
        let room = to_sql_id(room.get())?;
        self.db.with_conn(|conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE kind = 'group' AND room_id = ?1 \
                 ORDER BY created_at ASC, id ASC"
            );
            query(conn, &sql, params![room])
        })
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn find_by_user(&self, user: UserId) -> Result<Vec<Message>, StoreError> {
        let user = to_sql_id(user.get())?;
        self.db.with_conn(|conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE kind = 'private' AND (sender_id = ?1 OR target_id = ?1) \
                 ORDER BY created_at ASC, id ASC"
            );
            query(conn, &sql, params![user])
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            from_sql_id(n, TABLE, "count")
        })
    }
}

fn query(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map_row(row)?);
    }
    Ok(out)
}

fn map_row(row: &Row<'_>) -> Result<Message, StoreError> {
    let id: i64 = row_helpers::get(row, 0, TABLE, "id")?;
    let sender: i64 = row_helpers::get(row, 1, TABLE, "sender_id")?;
    let kind: String = row_helpers::get(row, 2, TABLE, "kind")?;
    let target: Option<i64> = row_helpers::get_opt(row, 3, TABLE, "target_id")?;
    let room: Option<i64> = row_helpers::get_opt(row, 4, TABLE, "room_id")?;
    let media: String = row_helpers::get(row, 5, TABLE, "media")?;
    let content: String = row_helpers::get(row, 6, TABLE, "content")?;
    let metadata: Option<String> = row_helpers::get_opt(row, 7, TABLE, "metadata")?;
    let created_at: String = row_helpers::get(row, 8, TABLE, "created_at")?;
    let updated_at: String = row_helpers::get(row, 9, TABLE, "updated_at")?;

    let kind: MessageKind = row_helpers::parse_enum(&kind, TABLE, "kind")?;
    let target = target
        .map(|t| from_sql_id(t, TABLE, "target_id").map(UserId::new))
        .transpose()?;
    let room = room
        .map(|r| from_sql_id(r, TABLE, "room_id").map(RoomId::new))
        .transpose()?;
    let route = Route::from_parts(kind, target, room).ok_or_else(|| StoreError::CorruptRow {
        table: TABLE,
        column: "kind",
        detail: format!("{kind} message without routing id"),
    })?;
    let media: MediaKind = row_helpers::parse_enum(&media, TABLE, "media")?;

    Ok(Message {
        id: MessageId::new(from_sql_id(id, TABLE, "id")?),
        sender_id: UserId::new(from_sql_id(sender, TABLE, "sender_id")?),
        route,
        media,
        content,
        metadata: metadata
            .map(|m| row_helpers::parse_json(&m, TABLE, "metadata"))
            .transpose()?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, TABLE, "updated_at")?,
    })
}

/// [`MessageStore`] over SQLite.
#[derive(Clone)]
pub struct SqliteMessageStore {
    repo: std::sync::Arc<MessageRepo>,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: std::sync::Arc::new(MessageRepo::new(db)),
        }
    }

    pub fn repo(&self) -> &MessageRepo {
        &self.repo
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&MessageRepo) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || f(&repo)).await?
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create(&self, msg: NewMessage) -> Result<Message, StoreError> {
        self.blocking(move |repo| repo.create(msg)).await
    }

    async fn find_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError> {
        self.blocking(move |repo| repo.find_between(a, b)).await
    }

    async fn find_by_room(&self, room: RoomId) -> Result<Vec<Message>, StoreError> {
        self.blocking(move |repo| repo.find_by_room(room)).await
    }

    async fn find_by_user(&self, user: UserId) -> Result<Vec<Message>, StoreError> {
        self.blocking(move |repo| repo.find_by_user(user)).await
    }
}
