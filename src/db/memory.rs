use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{Attachment, Gateway, Message, MessageId, NewAttachment, Persona, PersonaId, RoomId, Sender, User, UserId};

/// Process-local gateway. Nothing survives a restart; used when no database is
/// configured and throughout the tests.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    messages: Vec<Message>,
    attachments: Vec<Attachment>,
    users: HashMap<UserId, User>,
    personas: HashMap<PersonaId, Persona>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_user(&self, id: UserId, name: &str) {
        self.inner.lock().users.insert(id, User { id, name: name.to_owned() });
    }

    pub fn upsert_persona(&self, id: PersonaId, name: &str, profile: &str) {
        self.inner.lock().personas.insert(id, Persona {
            id,
            name: name.to_owned(),
            profile: profile.to_owned(),
        });
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn create_message(&self, room_id: RoomId, sender: Sender, body: &str) -> anyhow::Result<Message> {
        let (sender_user_id, sender_persona_id) = sender.split();
        let mut inner = self.inner.lock();
        let message = Message {
            id: inner.messages.len() as MessageId + 1,
            room_id,
            sender_user_id,
            sender_persona_id,
            body: body.to_owned(),
            created_at: OffsetDateTime::now_utc(),
            has_attachment: false,
            is_starred: false,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages_by_room(&self, room_id: RoomId, limit: usize) -> anyhow::Result<Vec<Message>> {
        let inner = self.inner.lock();
        let mut recent: Vec<Message> = inner.messages.iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn get_messages_before(&self, room_id: RoomId, before: MessageId, limit: usize) -> anyhow::Result<Vec<Message>> {
        let inner = self.inner.lock();
        let mut earlier: Vec<Message> = inner.messages.iter()
            .rev()
            .filter(|m| m.room_id == room_id && m.id < before)
            .take(limit)
            .cloned()
            .collect();
        earlier.reverse();
        Ok(earlier)
    }

    async fn create_attachment(&self, message_id: MessageId, attachment: NewAttachment) -> anyhow::Result<Attachment> {
        let mut inner = self.inner.lock();
        let Some(message) = inner.messages.iter_mut().find(|m| m.id == message_id) else {
            anyhow::bail!("message {message_id} does not exist");
        };
        message.has_attachment = true;

        let attachment = Attachment {
            id: inner.attachments.len() as i64 + 1,
            message_id,
            url: attachment.url,
            file_name: attachment.file_name,
            file_size: attachment.file_size,
            mime_type: attachment.mime_type,
            attachment_kind: attachment.attachment_kind,
        };
        inner.attachments.push(attachment.clone());
        Ok(attachment)
    }

    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
        Ok(self.inner.lock().users.get(&id).cloned())
    }

    async fn get_persona(&self, id: PersonaId) -> anyhow::Result<Option<Persona>> {
        Ok(self.inner.lock().personas.get(&id).cloned())
    }
}
