//! In-process bus
//!
//! Agents attach with [`MemoryTransport::connect_agent`] and get a
//! [`MemoryAgent`] to read commands from and answer on. Messages for agents that
//! are not attached are dropped, as on a real bus without a subscriber.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::payload::CommandPayload;
use super::{InboundReply, Transport, TransportError};

/// A message as delivered to an agent
#[derive(Debug, Clone)]
pub struct Envelope {
    pub reply_token: Option<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn command(&self) -> Result<CommandPayload, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

pub struct MemoryTransport {
    agents: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    replies_tx: mpsc::UnboundedSender<InboundReply>,
    replies_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundReply>>>,
    down: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            agents: Mutex::new(HashMap::new()),
            replies_tx,
            replies_rx: Mutex::new(Some(replies_rx)),
            down: AtomicBool::new(false),
        }
    }

    /// Attach an agent, replacing any earlier attachment under the same id
    pub fn connect_agent(&self, agent_id: &str) -> MemoryAgent {
        let (tx, rx) = mpsc::unbounded_channel();
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), tx);

        MemoryAgent {
            agent_id: agent_id.to_string(),
            inbox: rx,
            replies: self.replies_tx.clone(),
        }
    }

    /// Simulate the bus connection going away (or coming back)
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        agent_id: &str,
        reply_token: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Down("memory bus is down".to_string()));
        }

        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        match agents.get(agent_id) {
            Some(inbox) => {
                let envelope = Envelope {
                    reply_token: reply_token.map(str::to_string),
                    body,
                };
                if inbox.send(envelope).is_err() {
                    trace!(agent_id, "agent detached, message dropped");
                }
            }
            None => trace!(agent_id, "no subscriber, message dropped"),
        }
        Ok(())
    }

    async fn replies(&self) -> Result<BoxStream<'static, InboundReply>, TransportError> {
        let receiver = self
            .replies_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| TransportError::Down("reply stream already taken".to_string()))?;

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|reply| (reply, rx))
        })
        .boxed())
    }

    fn is_connected(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

/// The agent side of a [`MemoryTransport`]
pub struct MemoryAgent {
    agent_id: String,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    replies: mpsc::UnboundedSender<InboundReply>,
}

impl MemoryAgent {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Answer `envelope` with a JSON value; no-op for fire-and-forget messages
    pub fn reply(&self, envelope: &Envelope, value: &Value) {
        let Some(token) = &envelope.reply_token else {
            return;
        };
        match serde_json::to_vec(value) {
            Ok(body) => self.reply_raw(token, body),
            Err(e) => trace!("unable to encode reply: {e}"),
        }
    }

    pub fn reply_raw(&self, token: &str, body: Vec<u8>) {
        let _ = self.replies.send(InboundReply {
            token: token.to_string(),
            body,
        });
    }

    /// Answer every command with `handler`; `None` leaves the command unanswered
    pub fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&CommandPayload) -> Option<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                let Ok(command) = envelope.command() else {
                    trace!(agent_id = %self.agent_id, "ignoring undecodable command");
                    continue;
                };
                if let Some(value) = handler(&command) {
                    self.reply(&envelope, &value);
                }
            }
        })
    }
}
