//! Chat connector boundary. The core is protocol-agnostic: a
//! connector delivers inbound events and accepts outbound sends, and
//! everything else stays on its side of this trait.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::protocol::RetVal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    #[default]
    Variable,
    Fixed,
    Raw,
}

impl MessageFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => MessageFormat::Fixed,
            "raw" => MessageFormat::Raw,
            _ => MessageFormat::Variable,
        }
    }
}

/// One inbound message from the chat backend. `channel` of `None`
/// means a direct message. `addressed` is set when the connector
/// already knows the robot was spoken to (always true for DMs on most
/// protocols); the dispatcher additionally recognizes name/alias
/// addressing in the text itself.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub user: String,
    pub channel: Option<String>,
    pub text: String,
    pub addressed: bool,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn send_channel_message(&self, channel: &str, text: &str, format: MessageFormat)
        -> RetVal;
    async fn send_user_message(&self, user: &str, text: &str, format: MessageFormat) -> RetVal;
    async fn send_user_channel_message(
        &self,
        user: &str,
        channel: &str,
        text: &str,
        format: MessageFormat,
    ) -> RetVal;
    async fn join_channel(&self, _channel: &str) -> RetVal {
        RetVal::Ok
    }
    /// Protocol-level user attribute lookup (email, handle, ...).
    async fn user_attribute(&self, _user: &str, _attribute: &str) -> Option<String> {
        None
    }
}

/// Minimal connector for running the robot in a terminal; everything
/// goes to stdout.
pub struct TerminalConnector {
    bot_name: String,
}

impl TerminalConnector {
    pub fn new(bot_name: String) -> Self {
        TerminalConnector { bot_name }
    }
}

#[async_trait]
impl Connector for TerminalConnector {
    async fn send_channel_message(
        &self,
        channel: &str,
        text: &str,
        _format: MessageFormat,
    ) -> RetVal {
        println!("#{channel} <{}> {text}", self.bot_name);
        RetVal::Ok
    }

    async fn send_user_message(&self, user: &str, text: &str, _format: MessageFormat) -> RetVal {
        println!("(dm to {user}) <{}> {text}", self.bot_name);
        RetVal::Ok
    }

    async fn send_user_channel_message(
        &self,
        user: &str,
        channel: &str,
        text: &str,
        _format: MessageFormat,
    ) -> RetVal {
        println!("#{channel} <{}> @{user}: {text}", self.bot_name);
        RetVal::Ok
    }

    async fn join_channel(&self, channel: &str) -> RetVal {
        info!("joining channel #{channel}");
        RetVal::Ok
    }
}

/// A message captured by the recording connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub user: Option<String>,
    pub channel: Option<String>,
    pub text: String,
    pub format: MessageFormat,
}

/// Connector test double: records every outbound send for assertions.
#[derive(Default)]
pub struct RecordingConnector {
    sent: Mutex<Vec<SentMessage>>,
    pub attributes: Mutex<Vec<(String, String, String)>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        RecordingConnector::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("recording mutex poisoned").clone()
    }

    fn record(&self, msg: SentMessage) {
        self.sent.lock().expect("recording mutex poisoned").push(msg);
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn send_channel_message(
        &self,
        channel: &str,
        text: &str,
        format: MessageFormat,
    ) -> RetVal {
        self.record(SentMessage {
            user: None,
            channel: Some(channel.to_string()),
            text: text.to_string(),
            format,
        });
        RetVal::Ok
    }

    async fn send_user_message(&self, user: &str, text: &str, format: MessageFormat) -> RetVal {
        self.record(SentMessage {
            user: Some(user.to_string()),
            channel: None,
            text: text.to_string(),
            format,
        });
        RetVal::Ok
    }

    async fn send_user_channel_message(
        &self,
        user: &str,
        channel: &str,
        text: &str,
        format: MessageFormat,
    ) -> RetVal {
        self.record(SentMessage {
            user: Some(user.to_string()),
            channel: Some(channel.to_string()),
            text: text.to_string(),
            format,
        });
        RetVal::Ok
    }

    async fn user_attribute(&self, user: &str, attribute: &str) -> Option<String> {
        self.attributes
            .lock()
            .expect("attributes mutex poisoned")
            .iter()
            .find(|(u, a, _)| u == user && a == attribute)
            .map(|(_, _, v)| v.clone())
    }
}
