//! Correlated request/reply over a pub/sub bus
//!
//! Every command sent through [`AgentLink::send`] carries a fresh correlation
//! token. One background task per link reads the reply stream and hands each
//! reply to the waiter registered under its token. Waiters are removed when the
//! reply arrives, when the wait times out and when the caller gives up (the
//! registration is a drop guard), so replies arriving after that are discarded.

pub mod memory;
#[cfg(feature = "transport-nats")]
pub mod nats;
pub mod payload;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

pub use memory::{Envelope, MemoryAgent, MemoryTransport};
#[cfg(feature = "transport-nats")]
pub use nats::NatsTransport;
pub use payload::{CommandPayload, Reply};

/// Default allowance on top of a command's timeout
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport is down: {0}")]
    Down(String),
}

/// A reply read off the bus
#[derive(Debug, Clone)]
pub struct InboundReply {
    pub token: String,
    pub body: Vec<u8>,
}

/// The pub/sub bus the link runs on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `body` on the agent's subject, asking for a reply under `reply_token`
    async fn publish(
        &self,
        agent_id: &str,
        reply_token: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Stream of all replies addressed to this hub
    async fn replies(&self) -> Result<BoxStream<'static, InboundReply>, TransportError>;

    fn is_connected(&self) -> bool;
}

type Waiters = Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>;

struct Inner {
    transport: Arc<dyn Transport>,
    waiters: Waiters,
    grace: Duration,
}

impl Inner {
    fn waiters(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Vec<u8>>>> {
        // the map stays consistent even if a holder panicked
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, reply: InboundReply) {
        let waiter = self.waiters().remove(&reply.token);
        match waiter {
            Some(tx) => {
                if tx.send(reply.body).is_err() {
                    trace!(token = %reply.token, "waiter went away before delivery");
                }
            }
            None => trace!(token = %reply.token, "dropping late or unknown reply"),
        }
    }
}

/// Removes the waiter when the request finishes, however it finishes
struct Registration<'a> {
    inner: &'a Inner,
    token: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.inner.waiters().remove(&self.token);
    }
}

/// Request/reply facade over a [`Transport`]
#[derive(Clone)]
pub struct AgentLink {
    inner: Arc<Inner>,
}

impl AgentLink {
    /// Subscribe to the transport's replies and start the demultiplexing task
    pub async fn connect(
        transport: Arc<dyn Transport>,
        grace: Duration,
    ) -> Result<Self, TransportError> {
        let replies = transport.replies().await?;
        let inner = Arc::new(Inner {
            transport,
            waiters: Mutex::new(HashMap::new()),
            grace,
        });

        tokio::spawn(reply_loop(replies, Arc::downgrade(&inner)));
        debug!("agent link connected");

        Ok(Self { inner })
    }

    /// Send a command and wait for its reply
    ///
    /// Waits at most `timeout` plus the configured grace. Nothing is retried.
    #[instrument(skip(self, command), fields(func = %command.func))]
    pub async fn send(&self, agent_id: &str, command: &CommandPayload, timeout: Duration) -> Reply {
        if !self.inner.transport.is_connected() {
            warn!("transport is not connected");
            return Reply::TransportDown;
        }

        let body = match serde_json::to_vec(command) {
            Ok(body) => body,
            Err(e) => return Reply::Error(format!("unable to encode command: {e}")),
        };

        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.waiters().insert(token.clone(), tx);
        let _registration = Registration {
            inner: &self.inner,
            token: token.clone(),
        };

        if let Err(e) = self
            .inner
            .transport
            .publish(agent_id, Some(&token), body)
            .await
        {
            warn!("publish failed: {e}");
            return Reply::TransportDown;
        }

        match tokio::time::timeout(timeout + self.inner.grace, rx).await {
            Ok(Ok(body)) => decode(&body),
            Ok(Err(_)) => Reply::TransportDown,
            Err(_) => {
                debug!("no reply within {:?}", timeout);
                Reply::Timeout
            }
        }
    }

    /// Send a command without waiting for anything
    #[instrument(skip(self, command), fields(func = %command.func))]
    pub async fn publish(
        &self,
        agent_id: &str,
        command: &CommandPayload,
    ) -> Result<(), TransportError> {
        if !self.inner.transport.is_connected() {
            return Err(TransportError::Down("not connected".to_string()));
        }

        let body =
            serde_json::to_vec(command).map_err(|e| TransportError::Down(e.to_string()))?;
        self.inner.transport.publish(agent_id, None, body).await
    }

    /// Number of requests currently waiting for a reply
    pub fn pending(&self) -> usize {
        self.inner.waiters().len()
    }
}

fn decode(body: &[u8]) -> Reply {
    match serde_json::from_slice(body) {
        Ok(value) => Reply::Payload(value),
        Err(e) => Reply::Error(format!("malformed reply: {e}")),
    }
}

async fn reply_loop(mut replies: BoxStream<'static, InboundReply>, inner: Weak<Inner>) {
    while let Some(reply) = replies.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.deliver(reply);
    }
    debug!("reply stream ended");
}
