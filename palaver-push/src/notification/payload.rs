//! Push payload formatting.

use serde::{Deserialize, Serialize};

use super::events::{NotificationEvent, TargetScope};
use crate::registry::DeviceRecord;

/// JSON body of a push request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub badge: u64,
    pub message: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl PushPayload {
    /// Build the payload for one device, using the badge already stored on `record`.
    ///
    /// Broadcasts carry no network; every other event carries the device's network.
    pub fn build(event: &NotificationEvent, record: &DeviceRecord) -> Self {
        let network = (!event.is_broadcast()).then(|| record.key.network_id.clone());
        let channel = match event.scope {
            TargetScope::Mention => event.channel.clone(),
            TargetScope::DirectMessage | TargetScope::Broadcast => None,
        };

        Self {
            badge: record.badge,
            message: event.message.clone(),
            sender: event.sender.clone(),
            network,
            channel,
        }
    }

    pub fn to_body(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
