//! Wire shapes exchanged with agents

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command as sent to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub func: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl CommandPayload {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            timeout: None,
            payload: None,
            id: None,
        }
    }

    /// Timeout the agent itself applies, in seconds
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Outcome of a request/reply exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Whatever the agent answered
    Payload(Value),
    /// No answer within the budget
    Timeout,
    /// The bus is not connected or refused the message
    TransportDown,
    /// An answer arrived but could not be decoded
    Error(String),
}

impl Reply {
    /// The reply as a plain string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Payload(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}
