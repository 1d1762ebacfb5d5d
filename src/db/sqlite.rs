use async_trait::async_trait;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use time::OffsetDateTime;

use super::{Attachment, Gateway, Message, MessageId, NewAttachment, Persona, PersonaId, RoomId, Sender, User, UserId};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS personas (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        profile TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id INTEGER NOT NULL,
        sender_user_id INTEGER REFERENCES users(id),
        sender_persona_id INTEGER REFERENCES personas(id),
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        has_attachment BOOLEAN NOT NULL DEFAULT 0,
        CHECK (sender_user_id IS NULL OR sender_persona_id IS NULL)
    )",
    "CREATE INDEX IF NOT EXISTS messages_room ON messages (room_id, id)",
    "CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id INTEGER NOT NULL REFERENCES messages(id),
        url TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        mime_type TEXT NOT NULL,
        attachment_kind TEXT NOT NULL
    )",
];

const MESSAGE_COLUMNS: &str = "id,room_id,sender_user_id,sender_persona_id,body,created_at,has_attachment";

#[derive(Clone)]
pub struct SqliteGateway {
    db_pool: SqlitePool,
}

impl SqliteGateway {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        // every in-memory connection is its own database, so keep exactly one alive
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(16)
        };
        let db_pool = options.connect(url).await?;

        let gateway = Self { db_pool };
        gateway.migrate().await?;
        Ok(gateway)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db_pool).await?;
        }
        Ok(())
    }

    pub async fn upsert_user(&self, id: UserId, name: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO users (id,name) VALUES (?,?) ON CONFLICT(id) DO UPDATE SET name=excluded.name")
            .bind(id)
            .bind(name)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_persona(&self, id: PersonaId, name: &str, profile: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO personas (id,name,profile) VALUES (?,?,?) ON CONFLICT(id) DO UPDATE SET name=excluded.name, profile=excluded.profile")
            .bind(id)
            .bind(name)
            .bind(profile)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Gateway for SqliteGateway {
    async fn create_message(&self, room_id: RoomId, sender: Sender, body: &str) -> anyhow::Result<Message> {
        let (sender_user_id, sender_persona_id) = sender.split();
        let message = sqlx::query_as::<_, Message>(&format!(
            "INSERT INTO messages (room_id,sender_user_id,sender_persona_id,body,created_at,has_attachment) VALUES (?,?,?,?,?,0) RETURNING {MESSAGE_COLUMNS}"
        ))
            .bind(room_id)
            .bind(sender_user_id)
            .bind(sender_persona_id)
            .bind(body)
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&self.db_pool)
            .await?;

        Ok(message)
    }

    async fn get_messages_by_room(&self, room_id: RoomId, limit: usize) -> anyhow::Result<Vec<Message>> {
        let mut messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? ORDER BY id DESC LIMIT ?"
        ))
            .bind(room_id)
            .bind(i64::try_from(limit)?)
            .fetch_all(&self.db_pool)
            .await?;

        messages.reverse();
        Ok(messages)
    }

    async fn get_messages_before(&self, room_id: RoomId, before: MessageId, limit: usize) -> anyhow::Result<Vec<Message>> {
        let mut messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? AND id<? ORDER BY id DESC LIMIT ?"
        ))
            .bind(room_id)
            .bind(before)
            .bind(i64::try_from(limit)?)
            .fetch_all(&self.db_pool)
            .await?;

        messages.reverse();
        Ok(messages)
    }

    async fn create_attachment(&self, message_id: MessageId, attachment: NewAttachment) -> anyhow::Result<Attachment> {
        let mut tx = self.db_pool.begin().await?;

        let linked = sqlx::query("UPDATE messages SET has_attachment=1 WHERE id=?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        if linked.rows_affected() == 0 {
            anyhow::bail!("message {message_id} does not exist");
        }

        let attachment = sqlx::query_as::<_, Attachment>(
            "INSERT INTO attachments (message_id,url,file_name,file_size,mime_type,attachment_kind) VALUES (?,?,?,?,?,?) \
             RETURNING id,message_id,url,file_name,file_size,mime_type,attachment_kind"
        )
            .bind(message_id)
            .bind(&attachment.url)
            .bind(&attachment.file_name)
            .bind(attachment.file_size)
            .bind(&attachment.mime_type)
            .bind(attachment.attachment_kind)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(attachment)
    }

    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
        Ok(
            sqlx::query_as("SELECT id,name FROM users WHERE id=?")
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?
        )
    }

    async fn get_persona(&self, id: PersonaId) -> anyhow::Result<Option<Persona>> {
        Ok(
            sqlx::query_as("SELECT id,name,profile FROM personas WHERE id=?")
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?
        )
    }
}
