//! Per-connection registration state machine.
//!
//! ```text
//! Idle --IDENTIFY--> Identified --BEGIN--> TransactionOpen --END--> Identified
//! ```
//!
//! Invalid transitions are ignored and leave the state untouched. Staged edits
//! live only inside the session; dropping the session discards them.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{Command, REQUEST_ALL};
use crate::registry::{DeviceKey, DeviceRecord, ListField, PendingEdits, Registry, ScalarField};
use crate::Result;

/// Registration states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Identified(DeviceKey),
    TransactionOpen {
        identity: DeviceKey,
        edits: PendingEdits,
    },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Identified(_) => "identified",
            Self::TransactionOpen { .. } => "transaction_open",
        }
    }
}

/// Result of feeding one command to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A line to write back to the connection.
    Reply(String),
    /// A transaction was opened (or restarted).
    Opened,
    /// An edit was added to the open transaction.
    Staged,
    /// The open transaction was merged into the registry.
    Committed(Arc<DeviceRecord>),
    /// The command was not valid here and had no effect.
    Ignored(&'static str),
}

/// Registration session owned by one client connection.
#[derive(Debug, Default)]
pub struct RegistrationSession {
    state: SessionState,
}

impl RegistrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The identity set by the last `IDENTIFY`, if any.
    pub fn identity(&self) -> Option<&DeviceKey> {
        match &self.state {
            SessionState::Idle => None,
            SessionState::Identified(identity) | SessionState::TransactionOpen { identity, .. } => {
                Some(identity)
            }
        }
    }

    /// Apply a command. Committing writes through to `registry` under `account`.
    ///
    /// On a registry error the open transaction is kept so the client may retry `END`.
    pub fn handle(&mut self, account: &str, command: Command, registry: &Registry) -> Result<Step> {
        let state = std::mem::take(&mut self.state);

        let (next, step) = match (state, command) {
            (
                SessionState::Idle | SessionState::Identified(_),
                Command::Identify {
                    push_identifier,
                    device_id,
                    network_id,
                },
            ) => {
                let identity = DeviceKey::new(push_identifier, device_id, network_id);
                if let Err(e) = registry.reset_badge(account, &identity) {
                    warn!(account, device = %identity, error = %e, "Failed to reset badge");
                }
                debug!(account, device = %identity, "Device identified");
                (
                    SessionState::Identified(identity),
                    Step::Reply(REQUEST_ALL.to_string()),
                )
            }

            (
                SessionState::Identified(identity) | SessionState::TransactionOpen { identity, .. },
                Command::Begin {
                    push_identifier,
                    device_id,
                },
            ) if identity.push_identifier == push_identifier && identity.device_id == device_id => (
                SessionState::TransactionOpen {
                    identity,
                    edits: PendingEdits::new(),
                },
                Step::Opened,
            ),

            (SessionState::TransactionOpen { identity, mut edits }, Command::Set { key, value }) => {
                let step = match ScalarField::parse(&key) {
                    Some(field) => {
                        edits.set(field, value);
                        Step::Staged
                    }
                    None => Step::Ignored("unrecognized SET key"),
                };
                (SessionState::TransactionOpen { identity, edits }, step)
            }

            (SessionState::TransactionOpen { identity, mut edits }, Command::Add { key, value }) => {
                let step = match ListField::parse(&key) {
                    Some(field) => {
                        edits.add(field, value);
                        Step::Staged
                    }
                    None => Step::Ignored("unrecognized ADD key"),
                };
                (SessionState::TransactionOpen { identity, edits }, step)
            }

            (SessionState::TransactionOpen { identity, edits }, Command::End) => {
                match registry.commit(account, &identity, &edits) {
                    Ok(record) => (SessionState::Identified(identity), Step::Committed(record)),
                    Err(e) => {
                        self.state = SessionState::TransactionOpen { identity, edits };
                        return Err(e);
                    }
                }
            }

            (state, command) => {
                debug!(
                    account,
                    state = state.as_str(),
                    ?command,
                    "Ignoring out-of-order registration command"
                );
                (state, Step::Ignored("invalid in current state"))
            }
        };

        self.state = next;
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH_ID: &str = "9167e47b01598af7423e2ecd3d0a3ec4";
    const DEVICE_ID: &str = "611d3a30a3d666fc491cdea0d2e1dd6e";
    const NETWORK_ID: &str = "b758eaab1a4611a310642a6e8419fbff";

    fn feed(session: &mut RegistrationSession, registry: &Registry, line: &str) -> Step {
        let command = Command::parse(line).expect("sub-protocol line");
        session.handle("admin", command, registry).unwrap()
    }

    fn identify(session: &mut RegistrationSession, registry: &Registry) -> Step {
        feed(
            session,
            registry,
            &format!("PALAVER IDENTIFY {PUSH_ID} {DEVICE_ID} {NETWORK_ID}"),
        )
    }

    fn key() -> DeviceKey {
        DeviceKey::new(PUSH_ID, DEVICE_ID, NETWORK_ID)
    }

    #[test]
    fn test_identify_requests_snapshot() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();

        assert_eq!(
            identify(&mut session, &registry),
            Step::Reply("PALAVER REQ *".to_string())
        );
        assert_eq!(session.identity(), Some(&key()));
    }

    #[test]
    fn test_full_registration() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);

        assert_eq!(
            feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}")),
            Step::Opened
        );
        feed(&mut session, &registry, "PALAVER SET PUSH-TOKEN 605b64f5");
        feed(&mut session, &registry, "PALAVER SET PUSH-ENDPOINT https://api.palaverapp.com/1/push");
        feed(&mut session, &registry, "PALAVER ADD MENTION-KEYWORD cocode");
        feed(&mut session, &registry, "PALAVER ADD MENTION-KEYWORD {nick}");

        // Nothing is visible before END.
        assert!(registry.get("admin", &key()).is_none());

        let Step::Committed(record) = feed(&mut session, &registry, "PALAVER END") else {
            panic!("expected commit");
        };
        assert_eq!(record.push_token.as_deref(), Some("605b64f5"));
        assert_eq!(
            record.push_endpoint.as_deref(),
            Some("https://api.palaverapp.com/1/push")
        );
        assert!(record.mention_keywords.contains("{nick}"));
        assert!(matches!(session.state(), SessionState::Identified(_)));
        assert_eq!(registry.get("admin", &key()), Some(record));
    }

    #[test]
    fn test_mismatched_begin_is_ignored() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);

        let step = feed(&mut session, &registry, &format!("PALAVER BEGIN other {DEVICE_ID}"));
        assert!(matches!(step, Step::Ignored(_)));
        assert!(matches!(session.state(), SessionState::Identified(_)));

        assert!(matches!(
            feed(&mut session, &registry, "PALAVER SET PUSH-TOKEN x"),
            Step::Ignored(_)
        ));
        assert!(matches!(feed(&mut session, &registry, "PALAVER END"), Step::Ignored(_)));
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_begin_before_identify_is_ignored() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();

        let step = feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"));
        assert!(matches!(step, Step::Ignored(_)));
        assert_eq!(session.state(), &SessionState::Idle);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);
        feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"));

        assert!(matches!(
            feed(&mut session, &registry, "PALAVER SET COLOUR blue"),
            Step::Ignored(_)
        ));
        assert!(matches!(
            feed(&mut session, &registry, "PALAVER ADD PUSH-TOKEN abc"),
            Step::Ignored(_)
        ));
        let Step::Committed(record) = feed(&mut session, &registry, "PALAVER END") else {
            panic!("expected commit");
        };
        assert_eq!(record.as_ref(), &DeviceRecord::new(key()));
    }

    #[test]
    fn test_repeated_transactions_keep_untouched_fields() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);

        for line in [
            format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"),
            "PALAVER SET PUSH-ENDPOINT https://a/push".to_string(),
            "PALAVER ADD MENTION-KEYWORD cocode".to_string(),
            "PALAVER END".to_string(),
            format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"),
            "PALAVER SET PUSH-TOKEN abcdefg".to_string(),
            "PALAVER ADD MENTION-KEYWORD cocode".to_string(),
            "PALAVER END".to_string(),
        ] {
            feed(&mut session, &registry, &line);
        }

        let record = registry.get("admin", &key()).unwrap();
        assert_eq!(record.push_endpoint.as_deref(), Some("https://a/push"));
        assert_eq!(record.push_token.as_deref(), Some("abcdefg"));
        assert_eq!(record.mention_keywords.len(), 1);
    }

    #[test]
    fn test_begin_restarts_open_transaction() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);

        feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"));
        feed(&mut session, &registry, "PALAVER SET PUSH-TOKEN discarded");
        feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"));
        feed(&mut session, &registry, "PALAVER END");

        assert_eq!(registry.get("admin", &key()).unwrap().push_token, None);
    }

    #[test]
    fn test_identify_inside_transaction_is_ignored() {
        let registry = Registry::in_memory();
        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);
        feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"));

        let step = feed(&mut session, &registry, "PALAVER IDENTIFY a b c");
        assert!(matches!(step, Step::Ignored(_)));
        assert!(matches!(session.state(), SessionState::TransactionOpen { .. }));
    }

    #[test]
    fn test_identify_resets_badge() {
        let registry = Registry::in_memory();
        registry.commit("admin", &key(), &PendingEdits::new()).unwrap();
        registry.bump_badges("admin", &[key()]).unwrap();

        let mut session = RegistrationSession::new();
        identify(&mut session, &registry);

        assert_eq!(registry.get("admin", &key()).unwrap().badge, 0);
    }

    #[test]
    fn test_dropping_session_discards_edits() {
        let registry = Registry::in_memory();
        {
            let mut session = RegistrationSession::new();
            identify(&mut session, &registry);
            feed(&mut session, &registry, &format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"));
            feed(&mut session, &registry, "PALAVER SET PUSH-ENDPOINT https://a/push");
        }
        assert_eq!(registry.device_count(), 0);
    }
}
