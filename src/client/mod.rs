//! Reference client for the relay's WebSocket protocol.
//!
//! Keeps one socket open, pings every 30 seconds, and reconnects with
//! exponential backoff after anything but a normal close. After a reconnect it
//! rejoins the room it was in before sending anything else.

mod backoff;
pub mod history;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, interval_at, sleep},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message as WsMessage,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::{
    db::{Message, PersonaId},
    protocol::{ClientMessage, ServerEvent},
    rooms::Membership,
};

pub use backoff::Backoff;
pub use history::MessageLog;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://localhost:8080/ws`
    pub url: String,
    pub ping_interval: Duration,
    pub backoff: Backoff,
    /// Server events kept for [`RoomClient::next_event`]. Newer events are
    /// dropped while the buffer is full; the message log is updated regardless.
    pub event_buffer: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            ping_interval: Duration::from_secs(30),
            backoff: Backoff::default(),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed normally, either side. Terminal.
    Disconnected,
    /// Reconnect attempts used up. Terminal.
    Failed,
}

impl ClientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientStatus::Disconnected | ClientStatus::Failed)
    }
}

enum Command {
    Send(ClientMessage),
    Close,
}

pub struct RoomClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
    events: mpsc::Receiver<ServerEvent>,
    log: Arc<Mutex<MessageLog>>,
    requested: Option<Membership>,
    task: JoinHandle<()>,
}

impl RoomClient {
    /// Starts connecting in the background. Commands issued before the socket
    /// is up are queued.
    pub fn connect(config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ClientStatus::Connecting);
        let (event_tx, events) = mpsc::channel(config.event_buffer.max(1));
        let log = Arc::new(Mutex::new(MessageLog::new()));

        let runner = Runner {
            config,
            commands: command_rx,
            status: status_tx,
            events: event_tx,
            log: log.clone(),
            membership: None,
            pending: VecDeque::new(),
        };
        let task = tokio::spawn(runner.run());

        RoomClient { commands, status, events, log, requested: None, task }
    }

    pub fn join_room(&mut self, user_id: i64, room_id: i64) {
        self.requested = Some(Membership { user_id, room_id });
        self.log.lock().clear();
        self.send(ClientMessage::JoinRoom { user_id, room_id });
    }

    pub fn leave_room(&mut self) {
        self.requested = None;
        self.send(ClientMessage::LeaveRoom);
    }

    /// Sends a chat message and returns its local echo, if we're in a room.
    pub fn send_message(&self, body: &str, persona_id: Option<PersonaId>) -> Option<Message> {
        let echo = self.requested.map(|Membership { user_id, room_id }| {
            self.log.lock().add_optimistic(room_id, user_id, body, OffsetDateTime::now_utc())
        });
        self.send(ClientMessage::SendMessage { message: body.to_owned(), persona_id });
        echo
    }

    pub fn send(&self, msg: ClientMessage) {
        let _ = self.commands.send(Command::Send(msg));
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Waits until the status satisfies `f`. Returns the final status if the
    /// client stopped first.
    pub async fn wait_for_status(&mut self, f: impl Fn(&ClientStatus) -> bool) -> ClientStatus {
        let reached = self
            .status
            .wait_for(|status| f(status) || status.is_terminal())
            .await
            .map(|status| status.clone());
        match reached {
            Ok(status) => status,
            Err(_) => self.status.borrow().clone(),
        }
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Deduplicated messages of the current room, local echoes last.
    pub fn messages(&self) -> Vec<Message> {
        self.log.lock().messages().to_vec()
    }

    pub fn toggle_star(&self, id: i64) -> Option<bool> {
        self.log.lock().toggle_star(id)
    }

    /// Closes the socket normally and waits for the background task.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }
}

enum SessionEnd {
    Closed,
    Dropped(String),
}

struct Runner {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ClientStatus>,
    events: mpsc::Sender<ServerEvent>,
    log: Arc<Mutex<MessageLog>>,

    /// Room joined over a previous socket, rejoined after reconnecting.
    membership: Option<Membership>,
    /// Commands that arrived while disconnected or failed to send.
    pending: VecDeque<ClientMessage>,
}

impl Runner {
    async fn run(mut self) {
        let mut attempt = 0;
        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((socket, _)) => {
                    attempt = 0;
                    self.status.send_replace(ClientStatus::Connected);
                    tracing::info!(url = %self.config.url, "connected");

                    match self.session(socket).await {
                        SessionEnd::Closed => {
                            self.status.send_replace(ClientStatus::Disconnected);
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            tracing::warn!(url = %self.config.url, reason = %reason, "connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.config.url, error = %e, attempt, "connect failed");
                }
            }

            let Some(delay) = self.config.backoff.next(attempt) else {
                tracing::error!(url = %self.config.url, attempts = attempt, "giving up");
                self.status.send_replace(ClientStatus::Failed);
                return;
            };
            attempt += 1;
            self.status.send_replace(ClientStatus::Reconnecting { attempt, delay });

            if !self.wait(delay).await {
                self.status.send_replace(ClientStatus::Disconnected);
                return;
            }
        }
    }

    /// Sleeps out a backoff delay, queueing commands. `false` if asked to close.
    async fn wait(&mut self, delay: Duration) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(msg)) => self.pending.push_back(msg),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut write, mut read) = socket.split();

        if let Some(Membership { user_id, room_id }) = self.membership {
            tracing::info!(user_id, room_id, "rejoining");
            let rejoin = ClientMessage::JoinRoom { user_id, room_id };
            if let Err(e) = self.forward(&mut write, rejoin).await {
                return SessionEnd::Dropped(e.to_string());
            }
        }
        while let Some(msg) = self.pending.pop_front() {
            if let Err(e) = self.forward(&mut write, msg.clone()).await {
                self.pending.push_front(msg);
                return SessionEnd::Dropped(e.to_string());
            }
        }

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.receive(text.as_str()),
                    Some(Ok(WsMessage::Close(frame))) => {
                        return match frame {
                            Some(CloseFrame { code: CloseCode::Normal | CloseCode::Away, .. }) => SessionEnd::Closed,
                            Some(frame) => SessionEnd::Dropped(format!("closed with {}", frame.code)),
                            None => SessionEnd::Dropped("closed without status".to_owned()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".to_owned()),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(msg)) => {
                        if let Err(e) = self.forward(&mut write, msg.clone()).await {
                            self.pending.push_back(msg);
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = write.send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "bye".into(),
                        }))).await;
                        return SessionEnd::Closed;
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = self.forward(&mut write, ClientMessage::Ping).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
            }
        }
    }

    async fn forward(
        &mut self,
        write: &mut futures_util::stream::SplitSink<Socket, WsMessage>,
        msg: ClientMessage,
    ) -> Result<(), tungstenite::Error> {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode command");
                return Ok(());
            }
        };
        write.send(WsMessage::text(text)).await?;

        match msg {
            ClientMessage::JoinRoom { user_id, room_id } => self.membership = Some(Membership { user_id, room_id }),
            ClientMessage::LeaveRoom => self.membership = None,
            _ => {}
        }
        Ok(())
    }

    fn receive(&mut self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable event");
                return;
            }
        };

        match &event {
            ServerEvent::NewMessage(message) => {
                self.log.lock().insert(message.clone());
            }
            ServerEvent::RoomHistory { messages, .. } => self.log.lock().merge_history(messages.clone()),
            _ => {}
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::debug!(?event, "event buffer full, dropping");
        }
    }
}
