use crate::{
    AppState,
    db::{Message, RoomId, UserId},
    error::RelayError,
    protocol::{ClientMessage, ServerEvent},
};

use super::{Connection, msg};

/// What a successful join hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSnapshot {
    pub history: Vec<Message>,
    pub presence: Vec<UserId>,
}

/// One socket's view of the relay. Dropping it leaves whatever room it was in.
pub struct Session {
    state: AppState,
    conn: Connection,
}

impl Session {
    pub fn new(state: AppState, conn: Connection) -> Self {
        Session { state, conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Handles one raw text frame. Malformed frames are logged and dropped.
    pub async fn handle_text(&mut self, text: &str) {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection = %self.conn.id, error = %e, "dropping frame");
                return;
            }
        };

        if let Err(e) = self.handle(msg).await {
            if e.is_reportable() {
                tracing::debug!(connection = %self.conn.id, error = %e, "request refused");
                self.conn.send(&ServerEvent::error(&e));
            }
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        match msg {
            ClientMessage::JoinRoom { user_id, room_id } => self.join(user_id, room_id).await.map(drop),
            ClientMessage::LeaveRoom => {
                self.state.registry.leave(&mut self.conn);
                Ok(())
            }
            ClientMessage::SendMessage { message, persona_id } => {
                msg::send_msg(&self.state, &self.conn, message, persona_id).await
            }
            ClientMessage::SendAttachment(upload) => msg::send_attachment(&self.state, &self.conn, upload).await,
            ClientMessage::SendVoiceMessage(voice) => msg::send_voice_message(&self.state, &self.conn, voice).await,
            ClientMessage::Ping => {
                self.conn.send(&ServerEvent::Pong);
                Ok(())
            }
        }
    }

    pub async fn join(&mut self, user_id: UserId, room_id: RoomId) -> Result<JoinSnapshot, RelayError> {
        if self.conn.membership().is_some() {
            return Err(RelayError::AlreadyJoined);
        }
        self.state.gateway.get_user(user_id).await
            .map_err(RelayError::Persistence)?
            .ok_or(RelayError::UnknownUser(user_id))?;

        let presence = self.state.registry.join(&mut self.conn, user_id, room_id)?;

        let history = match self.state.gateway.get_messages_by_room(room_id, self.state.config.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "history unavailable");
                self.conn.send(&ServerEvent::Error { message: "history is unavailable right now".to_owned() });
                Vec::new()
            }
        };
        self.state.registry.release(&self.conn, &ServerEvent::RoomHistory { room_id, messages: history.clone() });

        Ok(JoinSnapshot { history, presence })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state.registry.on_disconnect(&mut self.conn);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::{
        ai::{GenerationError, GenerationRequest, Generator},
        config::Config,
        db::{Attachment, AttachmentKind, Gateway, MemoryGateway, MessageId, NewAttachment, Persona, PersonaId, Sender, User},
        rooms::{Frame, is_current},
    };

    use super::*;

    struct Echo;

    #[async_trait]
    impl Generator for Echo {
        async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(format!("you said {}", request.trigger.body))
        }
    }

    /// Hands out ids in call order but is slow to confirm a message saying "slow".
    struct SlowAck(Arc<MemoryGateway>);

    #[async_trait]
    impl Gateway for SlowAck {
        async fn create_message(&self, room_id: RoomId, sender: Sender, body: &str) -> anyhow::Result<Message> {
            let message = self.0.create_message(room_id, sender, body).await?;
            if body == "slow" {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(message)
        }
        async fn get_messages_by_room(&self, room_id: RoomId, limit: usize) -> anyhow::Result<Vec<Message>> {
            self.0.get_messages_by_room(room_id, limit).await
        }
        async fn get_messages_before(&self, room_id: RoomId, before: MessageId, limit: usize) -> anyhow::Result<Vec<Message>> {
            self.0.get_messages_before(room_id, before, limit).await
        }
        async fn create_attachment(&self, message_id: MessageId, attachment: NewAttachment) -> anyhow::Result<Attachment> {
            self.0.create_attachment(message_id, attachment).await
        }
        async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
            self.0.get_user(id).await
        }
        async fn get_persona(&self, id: PersonaId) -> anyhow::Result<Option<Persona>> {
            self.0.get_persona(id).await
        }
    }

    fn state() -> (AppState, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.upsert_user(1, "Ada");
        gateway.upsert_user(2, "Bob");
        gateway.upsert_persona(3, "Marvin", "A gloomy robot.");
        (AppState::new(Config::default(), gateway.clone(), Arc::new(Echo)), gateway)
    }

    fn session(state: &AppState) -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(state.clone(), Connection::new(tx)), rx)
    }

    fn events(session: &Session, rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<ServerEvent> {
        let epoch = session.connection().epoch();
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if is_current(&frame, &epoch) {
                events.push(frame.event().unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn join_returns_history_and_presence() {
        let (state, gateway) = state();
        gateway.create_message(7, Sender::User(2), "earlier").await.unwrap();

        let (mut s, mut rx) = session(&state);
        let snapshot = s.join(1, 7).await.unwrap();
        assert_eq!(snapshot.presence, vec![1]);
        assert_eq!(snapshot.history.len(), 1);

        let events = events(&s, &mut rx);
        assert!(matches!(&events[0], ServerEvent::RoomHistory { room_id: 7, messages } if messages.len() == 1));
    }

    #[tokio::test]
    async fn unknown_user_cannot_join() {
        let (state, _) = state();
        let (mut s, _rx) = session(&state);
        assert!(matches!(s.join(99, 7).await, Err(RelayError::UnknownUser(99))));
        assert!(s.connection().membership().is_none());
    }

    #[tokio::test]
    async fn sending_before_join_has_no_side_effects() {
        let (state, gateway) = state();
        let (mut s, mut rx) = session(&state);

        s.handle_text(r#"{"type":"send_message","payload":{"message":"hello"}}"#).await;
        assert_eq!(events(&s, &mut rx), vec![ServerEvent::error(&RelayError::NotJoined)]);
        assert!(gateway.messages().is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_quietly() {
        let (state, _) = state();
        let (mut s, mut rx) = session(&state);
        s.handle_text("{not json").await;
        s.handle_text(r#"{"type":"ping"}"#).await;
        assert_eq!(events(&s, &mut rx), vec![ServerEvent::Pong]);
    }

    #[tokio::test]
    async fn unknown_persona_saves_nothing() {
        let (state, gateway) = state();
        let (mut s, mut rx) = session(&state);
        s.join(1, 7).await.unwrap();
        events(&s, &mut rx);

        s.handle_text(r#"{"type":"send_message","payload":{"message":"hi","personaId":42}}"#).await;
        assert_eq!(events(&s, &mut rx), vec![ServerEvent::error(&RelayError::UnknownPersona(42))]);
        assert!(gateway.messages().is_empty());
    }

    #[tokio::test]
    async fn busy_persona_still_keeps_the_message() {
        let (state, gateway) = state();
        let (mut s, mut rx) = session(&state);
        s.join(1, 7).await.unwrap();
        events(&s, &mut rx);

        s.handle_text(r#"{"type":"send_message","payload":{"message":"one","personaId":3}}"#).await;
        s.handle_text(r#"{"type":"send_message","payload":{"message":"two","personaId":3}}"#).await;

        let events = events(&s, &mut rx);
        assert!(events.contains(&ServerEvent::error(&RelayError::GenerationBusy(3))), "{events:?}");
        let typing = events.iter().filter(|e| matches!(e, ServerEvent::PersonaTyping { .. })).count();
        assert_eq!(typing, 1);
        assert_eq!(gateway.messages().len(), 2);
    }

    #[tokio::test]
    async fn attachments_announce_message_then_file() {
        let (state, _) = state();
        let (mut s, mut rx) = session(&state);
        s.join(1, 7).await.unwrap();
        events(&s, &mut rx);

        s.handle_text(r#"{"type":"send_voice_message","payload":{
            "url":"https://files/v.ogg","fileName":"v.ogg","fileSize":2048,"mimeType":"audio/ogg"}}"#).await;

        let events = events(&s, &mut rx);
        let [ServerEvent::NewMessage(msg), ServerEvent::AttachmentAdded { attachment, .. }] = events.as_slice() else {
            panic!("{events:?}")
        };
        assert!(msg.has_attachment);
        assert_eq!(attachment.message_id, msg.id);
        assert_eq!(attachment.attachment_kind, AttachmentKind::VoiceMessage);
    }

    #[tokio::test]
    async fn captioned_attachment_infers_its_kind() {
        let (state, gateway) = state();
        let (mut s, mut rx) = session(&state);
        s.join(1, 7).await.unwrap();
        events(&s, &mut rx);

        s.handle_text(r#"{"type":"send_attachment","payload":{"message":"my cat",
            "url":"https://files/cat.png","fileName":"cat.png","fileSize":1024,"mimeType":"image/png"}}"#).await;

        let events = events(&s, &mut rx);
        let [ServerEvent::NewMessage(msg), ServerEvent::AttachmentAdded { room_id: 7, attachment }] = events.as_slice() else {
            panic!("{events:?}")
        };
        assert_eq!(msg.body, "my cat");
        assert_eq!(msg.sender_user_id, Some(1));
        assert!(msg.has_attachment);
        assert_eq!(attachment.message_id, msg.id);
        assert_eq!(attachment.attachment_kind, AttachmentKind::Image);
        assert_eq!(attachment.file_name, "cat.png");
        assert!(gateway.messages()[0].has_attachment);
    }

    #[tokio::test]
    async fn broadcasts_follow_id_order() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.upsert_user(1, "Ada");
        gateway.upsert_user(2, "Bob");
        gateway.upsert_user(4, "Cy");
        let state = AppState::new(Config::default(), Arc::new(SlowAck(gateway)), Arc::new(Echo));

        let (mut ada, _ada_rx) = session(&state);
        let (mut bob, _bob_rx) = session(&state);
        let (mut cy, mut rx) = session(&state);
        ada.join(1, 7).await.unwrap();
        bob.join(2, 7).await.unwrap();
        cy.join(4, 7).await.unwrap();
        events(&cy, &mut rx);

        let slow = ada.handle(ClientMessage::SendMessage { message: "slow".into(), persona_id: None });
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bob.handle(ClientMessage::SendMessage { message: "fast".into(), persona_id: None }).await
        };
        let (slow, fast) = tokio::join!(slow, fast);
        slow.unwrap();
        fast.unwrap();

        let seen: Vec<(MessageId, String)> = events(&cy, &mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::NewMessage(msg) => Some((msg.id, msg.body)),
                _ => None,
            })
            .collect();
        assert_eq!(seen.len(), 2, "{seen:?}");
        assert!(seen[0].0 < seen[1].0, "{seen:?}");
        assert_eq!(seen[0].1, "slow");
    }

    #[tokio::test]
    async fn dropping_the_session_leaves_the_room() {
        let (state, _) = state();
        let (mut s, _rx) = session(&state);
        s.join(1, 7).await.unwrap();
        assert_eq!(state.registry.active_users(7), vec![1]);

        drop(s);
        assert!(state.registry.active_users(7).is_empty());
    }
}
