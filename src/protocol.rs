//! JSON wire contract between the relay and its clients.
//!
//! Every frame is `{ "type": ..., "payload": ... }`. Frames without data (`ping`,
//! `pong`, `leave_room`) leave out `payload`.

use serde::{Deserialize, Serialize};

use crate::db::{Attachment, AttachmentKind, Message, PersonaId, RoomId, UserId};
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        user_id: UserId,
        room_id: RoomId,
    },
    LeaveRoom,
    SendMessage {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_id: Option<PersonaId>,
    },
    SendAttachment(AttachmentUpload),
    SendVoiceMessage(VoiceUpload),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpload {
    /// Optional caption, becomes the message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub url: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_kind: Option<AttachmentKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpload {
    pub url: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    NewMessage(Message),
    RoomHistory {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    UserJoined {
        room_id: RoomId,
        user_id: UserId,
    },
    UserLeft {
        room_id: RoomId,
        user_id: UserId,
    },
    ActiveUsers {
        room_id: RoomId,
        user_ids: Vec<UserId>,
    },
    PersonaTyping {
        room_id: RoomId,
        persona_id: PersonaId,
    },
    AiError {
        room_id: RoomId,
        persona_id: PersonaId,
        reason: String,
    },
    AttachmentAdded {
        room_id: RoomId,
        attachment: Attachment,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerEvent {
    pub fn error(err: &RelayError) -> Self {
        ServerEvent::Error { message: err.to_string() }
    }

    pub fn to_json(&self) -> String {
        // plain data enums with string keys always serialize
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","payload":{"message":"internal"}}"#.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_join() {
        let msg = ClientMessage::parse(r#"{"type":"join_room","payload":{"userId":1,"roomId":7}}"#).unwrap();
        assert_eq!(msg, ClientMessage::JoinRoom { user_id: 1, room_id: 7 });
    }

    #[test]
    fn parses_send_with_and_without_persona() {
        let with = ClientMessage::parse(r#"{"type":"send_message","payload":{"message":"hello","personaId":3}}"#).unwrap();
        assert_eq!(with, ClientMessage::SendMessage { message: "hello".into(), persona_id: Some(3) });

        let without = ClientMessage::parse(r#"{"type":"send_message","payload":{"message":"hello"}}"#).unwrap();
        assert_eq!(without, ClientMessage::SendMessage { message: "hello".into(), persona_id: None });
    }

    #[test]
    fn ping_has_no_payload() {
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(serde_json::to_value(ClientMessage::Ping).unwrap(), json!({"type": "ping"}));
        assert_eq!(serde_json::to_value(ServerEvent::Pong).unwrap(), json!({"type": "pong"}));
    }

    #[test]
    fn attachment_kind_is_optional() {
        let msg = ClientMessage::parse(r#"{"type":"send_attachment","payload":{
            "url":"https://files/a.pdf","fileName":"a.pdf","fileSize":10,"mimeType":"application/pdf"}}"#).unwrap();
        let ClientMessage::SendAttachment(upload) = msg else { panic!("wrong variant") };
        assert_eq!(upload.attachment_kind, None);
        assert_eq!(upload.message, None);
    }

    #[test]
    fn rejects_garbage() {
        for text in ["", "hello", r#"{"type":"dance"}"#, r#"{"type":"join_room","payload":{"roomId":"seven"}}"#] {
            assert!(matches!(ClientMessage::parse(text), Err(RelayError::Protocol(_))), "{text}");
        }
    }

    #[test]
    fn server_events_are_enveloped() {
        let typing = ServerEvent::PersonaTyping { room_id: 7, persona_id: 3 };
        assert_eq!(
            serde_json::to_value(&typing).unwrap(),
            json!({"type": "persona_typing", "payload": {"roomId": 7, "personaId": 3}})
        );

        let err = ServerEvent::error(&RelayError::NotJoined);
        assert_eq!(serde_json::from_str::<ServerEvent>(&err.to_json()).unwrap(), err);
    }
}
