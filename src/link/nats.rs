//! NATS transport
//!
//! Commands are published on the agent id as subject with a reply subject of
//! `<inbox_prefix>.<token>`. One wildcard subscription on `<inbox_prefix>.*`
//! collects every reply.

use async_nats::connection::State;
use async_trait::async_trait;
use futures::StreamExt;
use futures::future;
use futures::stream::BoxStream;
use tracing::info;

use super::{InboundReply, Transport, TransportError};

pub struct NatsTransport {
    client: async_nats::Client,
    inbox_prefix: String,
}

impl NatsTransport {
    pub async fn connect(url: &str, inbox_prefix: impl Into<String>) -> Result<Self, TransportError> {
        info!("connecting to NATS at {url}");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Down(format!("failed to connect to NATS: {e}")))?;

        Ok(Self {
            client,
            inbox_prefix: inbox_prefix.into(),
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(
        &self,
        agent_id: &str,
        reply_token: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let result = match reply_token {
            Some(token) => {
                self.client
                    .publish_with_reply(
                        agent_id.to_string(),
                        format!("{}.{token}", self.inbox_prefix),
                        body.into(),
                    )
                    .await
            }
            None => self.client.publish(agent_id.to_string(), body.into()).await,
        };

        result.map_err(|e| TransportError::Down(format!("publish failed: {e}")))
    }

    async fn replies(&self) -> Result<BoxStream<'static, InboundReply>, TransportError> {
        let subscriber = self
            .client
            .subscribe(format!("{}.*", self.inbox_prefix))
            .await
            .map_err(|e| TransportError::Down(format!("failed to subscribe: {e}")))?;

        let prefix = format!("{}.", self.inbox_prefix);
        Ok(subscriber
            .filter_map(move |message| {
                let reply = message
                    .subject
                    .as_str()
                    .strip_prefix(prefix.as_str())
                    .map(|token| InboundReply {
                        token: token.to_string(),
                        body: message.payload.to_vec(),
                    });
                future::ready(reply)
            })
            .boxed())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }
}
