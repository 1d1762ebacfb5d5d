//! Persona reply cycle.
//!
//! Per `(room, persona)`: Idle -> Generating -> one of Delivered,
//! FallbackDelivered or ErrorReported -> Idle. The Generating flag lives in the
//! room's registry entry and is only held as a guard; no room lock is held while
//! the generation service is being awaited.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};

use crate::{
    config::MAX_GENERATION_TIMEOUT,
    db::{Gateway, Message, Persona, RoomId, Sender},
    error::RelayError,
    protocol::ServerEvent,
    rooms::Registry,
};

use super::{
    generator::{GenerationError, GenerationRequest, Generator},
    prompt::Speakers,
};

pub const FALLBACK_REPLY: &str = "Sorry, I lost my train of thought. Could you say that again?";

/// How a persona turn ended.
#[derive(Debug)]
pub enum Outcome {
    Delivered(Message),
    FallbackDelivered(Message),
    ErrorReported(String),
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    gateway: Arc<dyn Gateway>,
    generator: Arc<dyn Generator>,

    timeout: Duration,
    context_window: usize,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        gateway: Arc<dyn Gateway>,
        generator: Arc<dyn Generator>,
        timeout: Duration,
        context_window: usize,
    ) -> Self {
        Orchestrator { registry, gateway, generator, timeout, context_window }
    }

    /// Starts `persona`'s reply to `trigger`, which must already be persisted.
    ///
    /// `persona_typing` has been broadcast by the time this returns. Fails with
    /// `GenerationBusy` while the persona is still answering in that room.
    pub fn dispatch(self: &Arc<Self>, persona: Persona, trigger: Message) -> Result<JoinHandle<Outcome>, RelayError> {
        let room_id = trigger.room_id;
        let guard = self.registry.begin_generation(room_id, persona.id)?;
        self.registry.broadcast_to_room(room_id, &ServerEvent::PersonaTyping { room_id, persona_id: persona.id });
        tracing::info!(room_id, persona_id = persona.id, trigger_id = trigger.id, "generating");

        let this = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = this.respond(&persona, &trigger).await;
            drop(guard);
            outcome
        }))
    }

    async fn respond(&self, persona: &Persona, trigger: &Message) -> Outcome {
        let room_id = trigger.room_id;
        let started = Instant::now();

        let failure = match self.generate(persona, trigger).await {
            Ok(text) => match self.save_and_broadcast(room_id, persona, &text).await {
                Ok(reply) => {
                    tracing::info!(room_id, persona_id = persona.id, reply_id = reply.id, elapsed_ms = started.elapsed().as_millis() as u64, "delivered");
                    return Outcome::Delivered(reply);
                }
                Err(e) => format!("reply not saved: {e:#}"),
            },
            Err(e) => e.to_string(),
        };
        tracing::warn!(room_id, persona_id = persona.id, failure = %failure, "falling back");

        match self.save_and_broadcast(room_id, persona, FALLBACK_REPLY).await {
            Ok(fallback) => Outcome::FallbackDelivered(fallback),
            Err(e) => {
                tracing::error!(room_id, persona_id = persona.id, error = %e, "fallback not saved");
                let reason = format!("{} could not reply", persona.name);
                self.registry.broadcast_to_room(room_id, &ServerEvent::AiError {
                    room_id,
                    persona_id: persona.id,
                    reason: reason.clone(),
                });
                Outcome::ErrorReported(reason)
            }
        }
    }

    async fn save_and_broadcast(&self, room_id: RoomId, persona: &Persona, body: &str) -> anyhow::Result<Message> {
        let _sequence = self.registry.sequence(room_id).await;
        let message = self.gateway.create_message(room_id, Sender::Persona(persona.id), body).await?;
        self.registry.broadcast_to_room(room_id, &ServerEvent::NewMessage(message.clone()));
        Ok(message)
    }

    /// Everything up to and including the generation call runs under one deadline.
    async fn generate(&self, persona: &Persona, trigger: &Message) -> Result<String, GenerationError> {
        let deadline = Instant::now() + self.timeout.min(MAX_GENERATION_TIMEOUT);

        let call = async {
            let context = self.context(trigger).await;
            let speakers = self.speakers(persona, trigger, &context).await;
            self.generator.generate(GenerationRequest {
                persona,
                trigger,
                context: &context,
                speakers: &speakers,
                deadline,
            }).await
        };

        match tokio::time::timeout_at(deadline, call).await {
            Ok(Ok(text)) if text.trim().is_empty() => Err(GenerationError::EmptyReply),
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout),
        }
    }

    /// The last `context_window` messages before the trigger.
    async fn context(&self, trigger: &Message) -> Vec<Message> {
        match self.gateway.get_messages_before(trigger.room_id, trigger.id, self.context_window).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(room_id = trigger.room_id, error = %e, "no context for generation");
                Vec::new()
            }
        }
    }

    async fn speakers(&self, persona: &Persona, trigger: &Message, context: &[Message]) -> Speakers {
        let mut speakers = Speakers::default();
        speakers.personas.insert(persona.id, persona.name.clone());

        for message in context.iter().chain(std::iter::once(trigger)) {
            if let Some(user_id) = message.sender_user_id {
                if !speakers.users.contains_key(&user_id) {
                    if let Ok(Some(user)) = self.gateway.get_user(user_id).await {
                        speakers.users.insert(user_id, user.name);
                    }
                }
            }
            if let Some(persona_id) = message.sender_persona_id {
                if !speakers.personas.contains_key(&persona_id) {
                    if let Ok(Some(other)) = self.gateway.get_persona(persona_id).await {
                        speakers.personas.insert(persona_id, other.name);
                    }
                }
            }
        }
        speakers
    }
}
