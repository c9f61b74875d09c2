//! Notification events produced by the host.

use serde::{Deserialize, Serialize};

/// Who an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetScope {
    /// Private message to the account on one network.
    DirectMessage,
    /// Channel message that may mention the account.
    Mention,
    /// Administrative broadcast to every device of the account.
    Broadcast,
}

impl TargetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectMessage => "direct_message",
            Self::Mention => "mention",
            Self::Broadcast => "broadcast",
        }
    }
}

/// A chat event that may need to notify an account's devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Account owning the devices to notify.
    pub account: String,
    /// Display name of the sender.
    pub sender: String,
    /// Message text.
    pub message: String,
    /// Network of the conversation; `None` for broadcasts, or for direct
    /// messages that address every network of the account.
    pub network: Option<String>,
    /// Channel the message was sent to (mention scope).
    pub channel: Option<String>,
    /// The account's current nickname on `network`, used to expand `{nick}`.
    pub recipient_nick: Option<String>,
    pub scope: TargetScope,
}

impl NotificationEvent {
    pub fn direct_message(
        account: impl Into<String>,
        network: Option<String>,
        sender: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            sender: sender.into(),
            message: message.into(),
            network,
            channel: None,
            recipient_nick: None,
            scope: TargetScope::DirectMessage,
        }
    }

    pub fn mention(
        account: impl Into<String>,
        network: impl Into<String>,
        channel: impl Into<String>,
        recipient_nick: impl Into<String>,
        sender: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            sender: sender.into(),
            message: message.into(),
            network: Some(network.into()),
            channel: Some(channel.into()),
            recipient_nick: Some(recipient_nick.into()),
            scope: TargetScope::Mention,
        }
    }

    pub fn broadcast(
        account: impl Into<String>,
        sender: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            sender: sender.into(),
            message: message.into(),
            network: None,
            channel: None,
            recipient_nick: None,
            scope: TargetScope::Broadcast,
        }
    }

    /// Attach the recipient's current nickname.
    pub fn with_recipient_nick(mut self, nick: impl Into<String>) -> Self {
        self.recipient_nick = Some(nick.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.scope == TargetScope::Broadcast
    }
}
