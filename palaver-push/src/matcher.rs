//! Recipient selection for notification events.
//!
//! Keywords match case-insensitively on word boundaries after `{nick}` is
//! replaced with the recipient's current nickname. Channel and nick lists are
//! case-insensitive wildcard patterns (`*`, `?`).

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::notification::{NotificationEvent, TargetScope};
use crate::registry::{DeviceKey, DeviceRecord};

/// Placeholder expanded to the recipient's nickname at match time.
pub const NICK_PLACEHOLDER: &str = "{nick}";

/// Compiled patterns kept before the cache is flushed.
pub const DEFAULT_PATTERN_CACHE_SIZE: usize = 1024;

/// Selects the devices an event should notify.
///
/// Compiled patterns are cached, so a single matcher should be shared. Expanded
/// `{nick}` keywords produce a new pattern per nickname, so the cache is flushed
/// whenever it reaches its capacity.
pub struct Matcher {
    patterns: DashMap<String, Option<Regex>>,
    capacity: usize,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_PATTERN_CACHE_SIZE)
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_size(capacity: usize) -> Self {
        Self {
            patterns: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of compiled patterns currently cached.
    pub fn cached_patterns(&self) -> usize {
        self.patterns.len()
    }

    /// Keys of the devices in `devices` that `event` should notify.
    pub fn select(&self, event: &NotificationEvent, devices: &[Arc<DeviceRecord>]) -> Vec<DeviceKey> {
        devices
            .iter()
            .filter(|record| self.wants(event, record))
            .map(|record| record.key.clone())
            .collect()
    }

    /// Whether a single device should be notified.
    pub fn wants(&self, event: &NotificationEvent, record: &DeviceRecord) -> bool {
        match event.scope {
            TargetScope::Broadcast => true,
            TargetScope::DirectMessage => {
                self.on_network(event, record) && !self.is_ignored(event, record)
            }
            TargetScope::Mention => {
                self.on_network(event, record)
                    && self.is_mentioned(event, record)
                    && !self.is_ignored(event, record)
            }
        }
    }

    fn on_network(&self, event: &NotificationEvent, record: &DeviceRecord) -> bool {
        event
            .network
            .as_deref()
            .is_none_or(|network| network == record.key.network_id)
    }

    fn is_mentioned(&self, event: &NotificationEvent, record: &DeviceRecord) -> bool {
        let nick = event.recipient_nick.as_deref();

        let channel_hit = event.channel.as_deref().is_some_and(|channel| {
            record
                .mention_channels
                .iter()
                .any(|pattern| self.wildcard_matches(pattern, channel))
        });

        channel_hit
            || record
                .mention_nicks
                .iter()
                .any(|pattern| self.wildcard_matches(pattern, &event.sender))
            || record
                .mention_keywords
                .iter()
                .any(|keyword| self.keyword_matches(keyword, nick, &event.message))
    }

    fn is_ignored(&self, event: &NotificationEvent, record: &DeviceRecord) -> bool {
        let nick = event.recipient_nick.as_deref();

        let channel_ignored = event.channel.as_deref().is_some_and(|channel| {
            record
                .ignore_channels
                .iter()
                .any(|pattern| self.wildcard_matches(pattern, channel))
        });

        channel_ignored
            || record
                .ignore_nicks
                .iter()
                .any(|pattern| self.wildcard_matches(pattern, &event.sender))
            || record
                .ignore_keywords
                .iter()
                .any(|keyword| self.keyword_matches(keyword, nick, &event.message))
    }

    /// Whether `keyword` occurs in `text` as a whole word, ignoring case.
    ///
    /// A keyword containing `{nick}` never matches when `nick` is unknown.
    pub fn keyword_matches(&self, keyword: &str, nick: Option<&str>, text: &str) -> bool {
        let expanded = if keyword.contains(NICK_PLACEHOLDER) {
            match nick {
                Some(nick) if !nick.is_empty() => keyword.replace(NICK_PLACEHOLDER, nick),
                _ => return false,
            }
        } else {
            keyword.to_string()
        };

        if expanded.trim().is_empty() {
            return false;
        }

        self.is_match(&keyword_pattern(&expanded), text)
    }

    /// Whether the whole of `value` matches the wildcard `pattern`, ignoring case.
    pub fn wildcard_matches(&self, pattern: &str, value: &str) -> bool {
        self.is_match(&wildcard_pattern(pattern), value)
    }

    fn is_match(&self, pattern: &str, text: &str) -> bool {
        if let Some(cached) = self.patterns.get(pattern) {
            return cached.as_ref().is_some_and(|re| re.is_match(text));
        }

        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern, error = %e, "Failed to compile match pattern");
                None
            }
        };
        let matched = compiled.as_ref().is_some_and(|re| re.is_match(text));
        if self.patterns.len() >= self.capacity {
            debug!(cached = self.patterns.len(), "Flushing match pattern cache");
            self.patterns.clear();
        }
        self.patterns.insert(pattern.to_string(), compiled);
        matched
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn keyword_pattern(keyword: &str) -> String {
    let starts_with_word = keyword.chars().next().is_some_and(is_word_char);
    let ends_with_word = keyword.chars().next_back().is_some_and(is_word_char);

    format!(
        "(?i){}{}{}",
        if starts_with_word { r"\b" } else { "" },
        regex::escape(keyword),
        if ends_with_word { r"\b" } else { "" },
    )
}

fn wildcard_pattern(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}
