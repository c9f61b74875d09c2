//! Device records and staged edits.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a registered device: unique per account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub push_identifier: String,
    pub device_id: String,
    pub network_id: String,
}

impl DeviceKey {
    pub fn new(
        push_identifier: impl Into<String>,
        device_id: impl Into<String>,
        network_id: impl Into<String>,
    ) -> Self {
        Self {
            push_identifier: push_identifier.into(),
            device_id: device_id.into(),
            network_id: network_id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The push identifier is a credential; only the device and network are shown.
        write!(f, "{}@{}", self.device_id, self.network_id)
    }
}

/// A committed device registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub key: DeviceKey,
    #[serde(default)]
    pub push_endpoint: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub mention_keywords: BTreeSet<String>,
    #[serde(default)]
    pub mention_channels: BTreeSet<String>,
    #[serde(default)]
    pub mention_nicks: BTreeSet<String>,
    #[serde(default)]
    pub ignore_keywords: BTreeSet<String>,
    #[serde(default)]
    pub ignore_channels: BTreeSet<String>,
    #[serde(default)]
    pub ignore_nicks: BTreeSet<String>,
    #[serde(default)]
    pub badge: u64,
}

impl DeviceRecord {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            key,
            push_endpoint: None,
            push_token: None,
            version: None,
            mention_keywords: BTreeSet::new(),
            mention_channels: BTreeSet::new(),
            mention_nicks: BTreeSet::new(),
            ignore_keywords: BTreeSet::new(),
            ignore_channels: BTreeSet::new(),
            ignore_nicks: BTreeSet::new(),
            badge: 0,
        }
    }

    /// Bearer credential for push requests: the push token, else the push identifier.
    pub fn bearer_token(&self) -> &str {
        self.push_token
            .as_deref()
            .unwrap_or(&self.key.push_identifier)
    }

    fn scalar_mut(&mut self, field: ScalarField) -> &mut Option<String> {
        match field {
            ScalarField::PushEndpoint => &mut self.push_endpoint,
            ScalarField::PushToken => &mut self.push_token,
            ScalarField::Version => &mut self.version,
        }
    }

    fn list_mut(&mut self, field: ListField) -> &mut BTreeSet<String> {
        match field {
            ListField::MentionKeyword => &mut self.mention_keywords,
            ListField::MentionChannel => &mut self.mention_channels,
            ListField::MentionNick => &mut self.mention_nicks,
            ListField::IgnoreKeyword => &mut self.ignore_keywords,
            ListField::IgnoreChannel => &mut self.ignore_channels,
            ListField::IgnoreNick => &mut self.ignore_nicks,
        }
    }
}

/// Single-valued fields, replaced by `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarField {
    PushEndpoint,
    PushToken,
    Version,
}

impl ScalarField {
    pub fn parse(key: &str) -> Option<Self> {
        match key.to_ascii_uppercase().as_str() {
            "PUSH-ENDPOINT" => Some(Self::PushEndpoint),
            "PUSH-TOKEN" => Some(Self::PushToken),
            "VERSION" => Some(Self::Version),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PushEndpoint => "PUSH-ENDPOINT",
            Self::PushToken => "PUSH-TOKEN",
            Self::Version => "VERSION",
        }
    }
}

/// Set-valued fields, unioned by `ADD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListField {
    MentionKeyword,
    MentionChannel,
    MentionNick,
    IgnoreKeyword,
    IgnoreChannel,
    IgnoreNick,
}

impl ListField {
    pub fn parse(key: &str) -> Option<Self> {
        match key.to_ascii_uppercase().as_str() {
            "MENTION-KEYWORD" => Some(Self::MentionKeyword),
            "MENTION-CHANNEL" => Some(Self::MentionChannel),
            "MENTION-NICK" => Some(Self::MentionNick),
            "IGNORE-KEYWORD" => Some(Self::IgnoreKeyword),
            "IGNORE-CHANNEL" => Some(Self::IgnoreChannel),
            "IGNORE-NICK" => Some(Self::IgnoreNick),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MentionKeyword => "MENTION-KEYWORD",
            Self::MentionChannel => "MENTION-CHANNEL",
            Self::MentionNick => "MENTION-NICK",
            Self::IgnoreKeyword => "IGNORE-KEYWORD",
            Self::IgnoreChannel => "IGNORE-CHANNEL",
            Self::IgnoreNick => "IGNORE-NICK",
        }
    }
}

/// Edits staged by an open registration transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingEdits {
    sets: BTreeMap<ScalarField, String>,
    adds: BTreeMap<ListField, BTreeSet<String>>,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a replacement; a later `set` of the same field wins.
    pub fn set(&mut self, field: ScalarField, value: impl Into<String>) {
        self.sets.insert(field, value.into());
    }

    /// Stage a set-union append.
    pub fn add(&mut self, field: ListField, value: impl Into<String>) {
        self.adds.entry(field).or_default().insert(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.adds.is_empty()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.adds.clear();
    }

    /// Merge into `record`: SET replaces, ADD unions, untouched fields persist.
    pub fn apply_to(&self, record: &mut DeviceRecord) {
        for (field, value) in &self.sets {
            *record.scalar_mut(*field) = Some(value.clone());
        }
        for (field, values) in &self.adds {
            record.list_mut(*field).extend(values.iter().cloned());
        }
    }
}
