//! Prompt layout for persona replies.
//!
//! The triggering message is always the final user turn and the only thing the
//! persona is asked to answer. Room history goes in one earlier turn marked as
//! background.

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{Message, PersonaId, UserId};

use super::generator::GenerationRequest;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

impl PromptMessage {
    fn system(content: String) -> Self {
        PromptMessage { role: "system", content }
    }

    fn user(content: String) -> Self {
        PromptMessage { role: "user", content }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Speakers {
    pub users: HashMap<UserId, String>,
    pub personas: HashMap<PersonaId, String>,
}

impl Speakers {
    pub fn name_of(&self, message: &Message) -> String {
        match (message.sender_user_id, message.sender_persona_id) {
            (Some(id), _) => self.users.get(&id).cloned().unwrap_or_else(|| format!("user #{id}")),
            (None, Some(id)) => self.personas.get(&id).cloned().unwrap_or_else(|| format!("persona #{id}")),
            (None, None) => "someone".to_owned(),
        }
    }
}

pub fn build(request: &GenerationRequest<'_>) -> Vec<PromptMessage> {
    let persona = request.persona;
    let mut messages = vec![PromptMessage::system(format!(
        "You are {name}, a character in a group chat.\n\n{profile}\n\n\
         Stay in character. Answer the latest message addressed to you directly; \
         earlier conversation is background only. Reply with your message text alone.",
        name = persona.name,
        profile = persona.profile.trim(),
    ))];

    let background: Vec<String> = request.context
        .iter()
        .filter(|m| m.id != request.trigger.id && !m.body.trim().is_empty())
        .map(|m| format!("{}: {}", request.speakers.name_of(m), m.body))
        .collect();
    if !background.is_empty() {
        messages.push(PromptMessage::user(format!(
            "Background, earlier in the room (oldest first):\n{}",
            background.join("\n")
        )));
    }

    messages.push(PromptMessage::user(format!(
        "{} says to you:\n{}",
        request.speakers.name_of(request.trigger),
        request.trigger.body
    )));
    messages
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use tokio::time::Instant;

    use crate::db::Persona;

    use super::*;

    fn message(id: i64, user: i64, body: &str) -> Message {
        Message {
            id,
            room_id: 7,
            sender_user_id: Some(user),
            sender_persona_id: None,
            body: body.to_owned(),
            created_at: OffsetDateTime::now_utc(),
            has_attachment: false,
            is_starred: false,
        }
    }

    #[test]
    fn trigger_is_the_last_turn() {
        let persona = Persona { id: 3, name: "Marvin".into(), profile: "A gloomy robot.".into() };
        let context = vec![message(1, 2, "nice weather"), message(2, 2, "indeed")];
        let trigger = message(3, 1, "hello Marvin, how are you?");
        let mut speakers = Speakers::default();
        speakers.users.insert(1, "Ada".into());

        let prompt = build(&GenerationRequest {
            persona: &persona,
            trigger: &trigger,
            context: &context,
            speakers: &speakers,
            deadline: Instant::now(),
        });

        assert_eq!(prompt.len(), 3);
        assert_eq!(prompt[0].role, "system");
        assert!(prompt[0].content.contains("A gloomy robot."));
        assert!(prompt[1].content.starts_with("Background"));
        assert!(prompt[1].content.contains("user #2: nice weather"));
        assert_eq!(prompt[2], PromptMessage::user("Ada says to you:\nhello Marvin, how are you?".into()));
    }

    #[test]
    fn no_background_turn_without_history() {
        let persona = Persona { id: 3, name: "Marvin".into(), profile: String::new() };
        let trigger = message(3, 1, "hi");
        // the trigger itself never counts as background
        let context = vec![trigger.clone()];

        let prompt = build(&GenerationRequest {
            persona: &persona,
            trigger: &trigger,
            context: &context,
            speakers: &Speakers::default(),
            deadline: Instant::now(),
        });
        assert_eq!(prompt.len(), 2);
        assert!(prompt[1].content.ends_with("hi"));
    }
}
