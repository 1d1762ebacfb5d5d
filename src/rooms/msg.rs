use crate::{
    AppState,
    db::{AttachmentKind, NewAttachment, PersonaId, Sender},
    error::RelayError,
    protocol::{AttachmentUpload, ServerEvent, VoiceUpload},
};

use super::{Connection, Membership};

fn membership(conn: &Connection) -> Result<Membership, RelayError> {
    conn.membership().ok_or(RelayError::NotJoined)
}

pub(crate) async fn send_msg(
    state: &AppState,
    conn: &Connection,

    message: String,
    persona_id: Option<PersonaId>,
) -> Result<(), RelayError> {
    let Membership { user_id, room_id } = membership(conn)?;
    if message.trim().is_empty() {
        return Err(RelayError::EmptyMessage);
    }

    // resolved up front so an unknown persona leaves nothing behind
    let persona = match persona_id {
        Some(id) => Some(
            state.gateway.get_persona(id).await
                .map_err(RelayError::Persistence)?
                .ok_or(RelayError::UnknownPersona(id))?
        ),
        None => None,
    };

    let sequence = state.registry.sequence(room_id).await;
    let msg = state.gateway.create_message(room_id, Sender::User(user_id), &message).await
        .map_err(RelayError::Persistence)?;
    tracing::debug!(room_id, user_id, message_id = msg.id, persona_id, "message saved");

    state.registry.broadcast_to_room(room_id, &ServerEvent::NewMessage(msg.clone()));
    drop(sequence);

    if let Some(persona) = persona {
        state.orchestrator.dispatch(persona, msg)?;
    }
    Ok(())
}

pub(crate) async fn send_attachment(
    state: &AppState,
    conn: &Connection,

    AttachmentUpload { message, url, file_name, file_size, mime_type, attachment_kind }: AttachmentUpload,
) -> Result<(), RelayError> {
    let attachment_kind = attachment_kind.unwrap_or_else(|| AttachmentKind::from_mime(&mime_type));
    attach(state, conn, message.unwrap_or_default(), NewAttachment {
        url,
        file_name,
        file_size,
        mime_type,
        attachment_kind,
    }).await
}

pub(crate) async fn send_voice_message(
    state: &AppState,
    conn: &Connection,

    VoiceUpload { url, file_name, file_size, mime_type }: VoiceUpload,
) -> Result<(), RelayError> {
    attach(state, conn, String::new(), NewAttachment {
        url,
        file_name,
        file_size,
        mime_type,
        attachment_kind: AttachmentKind::VoiceMessage,
    }).await
}

/// Saves a message carrying one attachment, then announces both.
async fn attach(
    state: &AppState,
    conn: &Connection,

    caption: String,
    attachment: NewAttachment,
) -> Result<(), RelayError> {
    let Membership { user_id, room_id } = membership(conn)?;

    let _sequence = state.registry.sequence(room_id).await;
    let mut msg = state.gateway.create_message(room_id, Sender::User(user_id), &caption).await
        .map_err(RelayError::Persistence)?;
    let attachment = state.gateway.create_attachment(msg.id, attachment).await
        .map_err(RelayError::Persistence)?;
    msg.has_attachment = true;
    tracing::debug!(room_id, user_id, message_id = msg.id, kind = ?attachment.attachment_kind, "attachment saved");

    state.registry.broadcast_to_room(room_id, &ServerEvent::NewMessage(msg));
    state.registry.broadcast_to_room(room_id, &ServerEvent::AttachmentAdded { room_id, attachment });
    Ok(())
}
