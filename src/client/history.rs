//! Client-side message list with deduplication.
//!
//! Persisted messages (positive ids) are unique by id. A local echo of our own
//! message gets a negative id and is swapped for the server's copy once one
//! arrives with the same body and sender, stamped within [`ECHO_TOLERANCE`].

use time::{Duration, OffsetDateTime};

use crate::db::{Message, MessageId, RoomId, UserId};

pub const ECHO_TOLERANCE: Duration = Duration::milliseconds(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Added,
    ReplacedEcho,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    last_temp_id: MessageId,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Shows our own message right away, before the server has it.
    pub fn add_optimistic(&mut self, room_id: RoomId, user_id: UserId, body: &str, now: OffsetDateTime) -> Message {
        self.last_temp_id -= 1;
        let message = Message {
            id: self.last_temp_id,
            room_id,
            sender_user_id: Some(user_id),
            sender_persona_id: None,
            body: body.to_owned(),
            created_at: now,
            has_attachment: false,
            is_starred: false,
        };
        self.messages.push(message.clone());
        message
    }

    pub fn insert(&mut self, message: Message) -> Inserted {
        if message.is_persisted() && self.messages.iter().any(|m| m.id == message.id) {
            return Inserted::Duplicate;
        }

        let echo = self.messages.iter().position(|m| !m.is_persisted() && is_echo(m, &message));
        let inserted = match echo {
            Some(i) => {
                let starred = self.messages[i].is_starred;
                self.messages[i] = Message { is_starred: starred, ..message };
                Inserted::ReplacedEcho
            }
            None => {
                self.messages.push(message);
                Inserted::Added
            }
        };
        self.sort();
        inserted
    }

    /// Folds in a `room_history` payload, which may overlap what we already have.
    pub fn merge_history(&mut self, history: Vec<Message>) {
        for message in history {
            self.insert(message);
        }
    }

    pub fn toggle_star(&mut self, id: MessageId) -> Option<bool> {
        let message = self.messages.iter_mut().find(|m| m.id == id)?;
        message.is_starred = !message.is_starred;
        Some(message.is_starred)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    // persisted by id, pending echoes after them in the order they were sent
    fn sort(&mut self) {
        self.messages.sort_by_key(|m| if m.is_persisted() { (false, m.id) } else { (true, 0) });
    }
}

fn is_echo(optimistic: &Message, persisted: &Message) -> bool {
    persisted.is_persisted()
        && optimistic.sender_user_id.is_some()
        && optimistic.sender_user_id == persisted.sender_user_id
        && optimistic.room_id == persisted.room_id
        && optimistic.body == persisted.body
        && (optimistic.created_at - persisted.created_at).abs() <= ECHO_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(id: MessageId, user: UserId, body: &str, at: OffsetDateTime) -> Message {
        Message {
            id,
            room_id: 7,
            sender_user_id: Some(user),
            sender_persona_id: None,
            body: body.to_owned(),
            created_at: at,
            has_attachment: false,
            is_starred: false,
        }
    }

    #[test]
    fn same_id_is_kept_once() {
        let now = OffsetDateTime::now_utc();
        let mut log = MessageLog::new();
        assert_eq!(log.insert(persisted(1, 2, "hi", now)), Inserted::Added);
        assert_eq!(log.insert(persisted(1, 2, "hi", now)), Inserted::Duplicate);
        assert_eq!(log.messages().len(), 1);
    }

    #[test]
    fn echo_is_replaced_in_place() {
        let now = OffsetDateTime::now_utc();
        let mut log = MessageLog::new();
        let echo = log.add_optimistic(7, 1, "hello", now);
        assert_eq!(echo.id, -1);
        log.toggle_star(-1);

        let from_server = persisted(12, 1, "hello", now + Duration::milliseconds(400));
        assert_eq!(log.insert(from_server), Inserted::ReplacedEcho);
        assert_eq!(log.messages().len(), 1);
        assert_eq!(log.messages()[0].id, 12);
        assert!(log.messages()[0].is_starred);
    }

    #[test]
    fn echo_needs_matching_sender_body_and_time() {
        let now = OffsetDateTime::now_utc();
        let mut log = MessageLog::new();
        log.add_optimistic(7, 1, "hello", now);

        assert_eq!(log.insert(persisted(10, 2, "hello", now)), Inserted::Added);
        assert_eq!(log.insert(persisted(11, 1, "hello!", now)), Inserted::Added);
        assert_eq!(log.insert(persisted(12, 1, "hello", now + Duration::milliseconds(1500))), Inserted::Added);
        assert_eq!(log.messages().iter().filter(|m| m.id < 0).count(), 1);
        assert_eq!(log.insert(persisted(13, 1, "hello", now - Duration::milliseconds(1000))), Inserted::ReplacedEcho);
    }

    #[test]
    fn rejoin_history_overlap_is_merged() {
        let now = OffsetDateTime::now_utc();
        let mut log = MessageLog::new();
        log.insert(persisted(1, 2, "a", now));
        log.insert(persisted(2, 2, "b", now));
        log.add_optimistic(7, 1, "pending", now);

        log.merge_history(vec![
            persisted(1, 2, "a", now),
            persisted(2, 2, "b", now),
            persisted(3, 2, "c", now),
        ]);

        let ids: Vec<MessageId> = log.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, [1, 2, 3, -1]);
    }

    #[test]
    fn each_echo_gets_its_own_temp_id() {
        let now = OffsetDateTime::now_utc();
        let mut log = MessageLog::new();
        let a = log.add_optimistic(7, 1, "same", now);
        let b = log.add_optimistic(7, 1, "same", now);
        assert_ne!(a.id, b.id);

        log.insert(persisted(5, 1, "same", now));
        let ids: Vec<MessageId> = log.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, [5, -2]);
    }
}
