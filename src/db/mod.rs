mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

pub type RoomId = i64;
pub type UserId = i64;
pub type PersonaId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,

    pub sender_user_id: Option<UserId>,
    pub sender_persona_id: Option<PersonaId>,

    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub has_attachment: bool,

    // client-side only, never stored
    #[sqlx(skip)]
    #[serde(default)]
    pub is_starred: bool,
}

impl Message {
    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
    VoiceMessage,
}

impl AttachmentKind {
    /// Best guess for uploads that don't say what they are.
    pub fn from_mime(mime_type: &str) -> Self {
        match mime_type.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "audio" => Self::Audio,
            "video" => Self::Video,
            _ => Self::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: i64,
    pub message_id: MessageId,

    pub url: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub attachment_kind: AttachmentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Persona {
    pub id: PersonaId,
    pub name: String,
    /// Behavioral profile handed to the generation service as-is.
    pub profile: String,
}

/// Who a new message is attributed to. Users and personas are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User(UserId),
    Persona(PersonaId),
}

impl Sender {
    pub(crate) fn split(self) -> (Option<UserId>, Option<PersonaId>) {
        match self {
            Sender::User(id) => (Some(id), None),
            Sender::Persona(id) => (None, Some(id)),
        }
    }
}

pub struct NewAttachment {
    pub url: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub attachment_kind: AttachmentKind,
}

/// Durable storage for messages and attachments, plus read access to users and
/// personas. Ids handed out by `create_message` are monotonic per gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn create_message(&self, room_id: RoomId, sender: Sender, body: &str) -> anyhow::Result<Message>;

    /// Most recent `limit` messages of the room, oldest first.
    async fn get_messages_by_room(&self, room_id: RoomId, limit: usize) -> anyhow::Result<Vec<Message>>;

    /// Up to `limit` messages of the room older than `before`, oldest first.
    async fn get_messages_before(&self, room_id: RoomId, before: MessageId, limit: usize) -> anyhow::Result<Vec<Message>>;

    /// Also flags the message as having an attachment.
    async fn create_attachment(&self, message_id: MessageId, attachment: NewAttachment) -> anyhow::Result<Attachment>;

    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>>;

    async fn get_persona(&self, id: PersonaId) -> anyhow::Result<Option<Persona>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_mime() {
        assert_eq!(AttachmentKind::from_mime("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("audio/ogg"), AttachmentKind::Audio);
        assert_eq!(AttachmentKind::from_mime("video/mp4"), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_mime("application/pdf"), AttachmentKind::Document);
        assert_eq!(AttachmentKind::from_mime(""), AttachmentKind::Document);
    }

    #[test]
    fn message_wire_shape_is_camel_case() {
        let msg = Message {
            id: 4,
            room_id: 7,
            sender_user_id: None,
            sender_persona_id: Some(3),
            body: "hi".into(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            has_attachment: false,
            is_starred: false,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["roomId"], 7);
        assert_eq!(json["senderPersonaId"], 3);
        assert!(json["senderUserId"].is_null());
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");
    }
}
