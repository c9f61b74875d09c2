//! Host-facing module facade.
//!
//! [`PalaverModule`] is the only type a bouncer host needs: it consumes client
//! lines, module commands and chat events, and produces the lines to write back
//! plus the push dispatches.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::{Error, Result};
use crate::config::PushConfig;
use crate::logging::redact;
use crate::matcher::Matcher;
use crate::notification::{DispatchReceipt, Dispatcher, NotificationEvent};
use crate::protocol::Command;
use crate::registry::{DeviceRecord, Registry};
use crate::session::{RegistrationSession, Step};

/// Module name as shown to users.
pub const MODULE_NAME: &str = "palaver";

/// Client capability announced while the module is loaded.
pub const CAPABILITY: &str = "palaverapp.com";

/// Sender name used by the `test` command.
pub const TEST_SENDER: &str = "palaver";

/// Message text used by the `test` command.
pub const TEST_MESSAGE: &str = "Test notification";

/// Effects the host applies on module load and unload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEffect {
    /// `CAP <nick> NEW` to every capable client.
    CapabilityAdded(&'static str),
    /// `CAP <nick> DEL` to every capable client.
    CapabilityRemoved(&'static str),
    /// A status line for the administrator who issued the command.
    Status(String),
}

impl HostEffect {
    /// Render as a raw line addressed to `nick`.
    pub fn to_line(&self, nick: &str) -> String {
        match self {
            Self::CapabilityAdded(cap) => format!(":irc.znc.in CAP {} NEW :{}", nick, cap),
            Self::CapabilityRemoved(cap) => format!(":irc.znc.in CAP {} DEL :{}", nick, cap),
            Self::Status(text) => format!(":*status!znc@znc.in PRIVMSG {} :{}", nick, text),
        }
    }
}

/// What the host knows about one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: u64,
    pub account: String,
    pub network: Option<String>,
    pub is_admin: bool,
}

/// Result of offering a client line to the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// The line belonged to the module; write these replies back.
    Handled(Vec<String>),
    /// Not ours; the host processes the line as usual.
    Passthrough,
}

/// A chat message seen by the host on behalf of `account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub account: String,
    pub network: String,
    /// `None` for private messages.
    pub channel: Option<String>,
    pub sender: String,
    pub text: String,
    /// The account's current nickname on `network`.
    pub recipient_nick: String,
}

impl ChatMessage {
    fn to_event(&self) -> NotificationEvent {
        match &self.channel {
            Some(channel) => NotificationEvent::mention(
                &self.account,
                &self.network,
                channel,
                &self.recipient_nick,
                &self.sender,
                &self.text,
            ),
            None => NotificationEvent::direct_message(
                &self.account,
                Some(self.network.clone()),
                &self.sender,
                &self.text,
            )
            .with_recipient_nick(&self.recipient_nick),
        }
    }
}

#[derive(Debug, Clone)]
struct Presence {
    account: String,
    network: Option<String>,
    away: bool,
}

pub struct PalaverModule {
    registry: Arc<Registry>,
    matcher: Matcher,
    dispatcher: Dispatcher,
    presence: DashMap<u64, Presence>,
}

impl PalaverModule {
    pub fn new(registry: Arc<Registry>, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            matcher: Matcher::new(),
            dispatcher,
            presence: DashMap::new(),
        }
    }

    /// File-backed registry and HTTP dispatcher built from `config`.
    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let registry = Registry::open(&config.data_dir)?;
        let dispatcher = Dispatcher::from_config(config)?;
        Ok(Self::new(Arc::new(registry), dispatcher))
    }

    pub fn capability(&self) -> &'static str {
        CAPABILITY
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn on_load(&self) -> Vec<HostEffect> {
        info!(
            devices = self.registry.device_count(),
            "Module {} loaded", MODULE_NAME
        );
        vec![
            HostEffect::CapabilityAdded(CAPABILITY),
            HostEffect::Status(format!("Loaded module {}", MODULE_NAME)),
        ]
    }

    /// Withdraw the capability and abandon every in-flight delivery.
    pub async fn on_unload(&self) -> Vec<HostEffect> {
        self.dispatcher.shutdown().await;
        self.presence.clear();
        info!("Module {} unloaded", MODULE_NAME);
        vec![
            HostEffect::CapabilityRemoved(CAPABILITY),
            HostEffect::Status(format!("Module {} unloaded.", MODULE_NAME)),
        ]
    }

    pub fn client_attached(&self, ctx: &ConnectionContext) {
        debug!(account = %ctx.account, connection = ctx.id, "Client attached");
        self.presence.insert(
            ctx.id,
            Presence {
                account: ctx.account.clone(),
                network: ctx.network.clone(),
                away: false,
            },
        );
    }

    /// Forget the connection. Any open transaction in `session` is discarded.
    pub fn client_detached(&self, ctx: &ConnectionContext, session: RegistrationSession) {
        self.presence.remove(&ctx.id);
        debug!(
            account = %ctx.account,
            connection = ctx.id,
            state = session.state().as_str(),
            "Client detached"
        );
    }

    /// Whether `account` has an attached, non-away client on `network`.
    pub fn is_user_online(&self, account: &str, network: &str) -> bool {
        self.presence.iter().any(|entry| {
            let presence = entry.value();
            presence.account == account
                && !presence.away
                && presence.network.as_deref() == Some(network)
        })
    }

    pub fn handle_client_line(
        &self,
        ctx: &ConnectionContext,
        session: &mut RegistrationSession,
        line: &str,
    ) -> LineOutcome {
        let Some(command) = Command::parse(line) else {
            return LineOutcome::Passthrough;
        };

        match command {
            Command::Background => self.set_away(ctx, true),
            Command::Foreground => self.set_away(ctx, false),
            Command::Unknown(raw) => {
                debug!(account = %ctx.account, line = %raw, "Ignoring unknown PALAVER command");
                LineOutcome::Handled(Vec::new())
            }
            command => match session.handle(&ctx.account, command, &self.registry) {
                Ok(Step::Reply(reply)) => LineOutcome::Handled(vec![reply]),
                Ok(Step::Committed(record)) => {
                    info!(
                        account = %ctx.account,
                        device = %record.key,
                        token = %redact(record.bearer_token()),
                        "Device registration saved"
                    );
                    LineOutcome::Handled(Vec::new())
                }
                Ok(_) => LineOutcome::Handled(Vec::new()),
                Err(e) => {
                    warn!(account = %ctx.account, error = %e, "Failed to save device registration");
                    LineOutcome::Handled(Vec::new())
                }
            },
        }
    }

    fn set_away(&self, ctx: &ConnectionContext, away: bool) -> LineOutcome {
        if let Some(mut presence) = self.presence.get_mut(&ctx.id) {
            presence.away = away;
        }
        debug!(account = %ctx.account, connection = ctx.id, away, "Presence changed");
        LineOutcome::Handled(Vec::new())
    }

    /// Handle a line sent to `*palaver`. Returns the reply lines.
    pub fn handle_module_command(&self, ctx: &ConnectionContext, text: &str) -> Vec<String> {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or_default().to_ascii_lowercase();

        match command.as_str() {
            "help" | "" => help_lines(),
            "test" => vec![self.send_test(ctx).ack_line()],
            "list" => self.list_devices(ctx),
            "remove" => match parts.next() {
                Some(device_id) => self.remove_device(ctx, device_id),
                None => vec!["Usage: remove <device-id>".to_string()],
            },
            other => vec![format!("Unknown command [{}]. Try 'help'.", other)],
        }
    }

    /// Notify the account's devices about a chat message.
    ///
    /// Returns `None` when the account is present on the network or no device
    /// wants the message.
    pub fn on_chat_message(&self, message: &ChatMessage) -> Option<DispatchReceipt> {
        if self.is_user_online(&message.account, &message.network) {
            debug!(
                account = %message.account,
                network = %message.network,
                "Account is online, not notifying"
            );
            return None;
        }

        let event = message.to_event();
        let devices = self.registry.devices(&message.account);
        let targets: Vec<Arc<DeviceRecord>> = devices
            .into_iter()
            .filter(|record| self.matcher.wants(&event, record))
            .collect();
        if targets.is_empty() {
            return None;
        }

        Some(self.dispatch(&event, targets))
    }

    /// Send an administrative broadcast to every device of every account.
    pub fn broadcast(&self, sender: &str, text: &str) -> DispatchReceipt {
        let mut receipt = DispatchReceipt::empty();
        for account in self.registry.accounts() {
            let event = NotificationEvent::broadcast(&account, sender, text);
            let devices = self.registry.devices(&account);
            receipt.merge(self.dispatch(&event, devices));
        }
        info!(targeted = receipt.targeted(), "Broadcast dispatched");
        receipt
    }

    /// Cancel the account's deliveries and delete its registrations.
    pub fn purge_account(&self, account: &str) -> Result<bool> {
        self.dispatcher.cancel_account(account);
        self.registry.purge_account(account)
    }

    fn send_test(&self, ctx: &ConnectionContext) -> DispatchReceipt {
        let event = NotificationEvent::direct_message(
            &ctx.account,
            ctx.network.clone(),
            TEST_SENDER,
            TEST_MESSAGE,
        );
        let targets: Vec<Arc<DeviceRecord>> = self
            .registry
            .devices(&ctx.account)
            .into_iter()
            .filter(|record| {
                ctx.network
                    .as_deref()
                    .is_none_or(|network| network == record.key.network_id)
            })
            .collect();
        self.dispatch(&event, targets)
    }

    /// Bump badges, then hand the updated records to the dispatcher.
    fn dispatch(&self, event: &NotificationEvent, targets: Vec<Arc<DeviceRecord>>) -> DispatchReceipt {
        let keys: Vec<_> = targets.iter().map(|record| record.key.clone()).collect();
        let records = match self.registry.bump_badges(&event.account, &keys) {
            Ok(records) => records,
            Err(e) => {
                warn!(account = %event.account, error = %e, "Failed to persist badges");
                targets
            }
        };
        self.dispatcher.dispatch(event, records)
    }

    fn list_devices(&self, ctx: &ConnectionContext) -> Vec<String> {
        if !ctx.is_admin {
            return vec!["Permission denied".to_string()];
        }

        let mut lines: Vec<String> = self
            .registry
            .accounts()
            .into_iter()
            .flat_map(|account| {
                self.registry
                    .devices(&account)
                    .into_iter()
                    .map(move |record| {
                        format!(
                            "{} | {} | {} | {} | badge {}",
                            record.key.device_id,
                            account,
                            record.key.network_id,
                            record.version.as_deref().unwrap_or("-"),
                            record.badge
                        )
                    })
            })
            .collect();

        if lines.is_empty() {
            return vec!["There are no devices registered with this server.".to_string()];
        }

        lines.insert(0, "Device | User | Network | Version | Badge".to_string());
        lines
    }

    fn remove_device(&self, ctx: &ConnectionContext, device_id: &str) -> Vec<String> {
        match self.registry.remove_device(&ctx.account, device_id) {
            Err(Error::NotFound { .. }) => vec![format!("No device {} is registered.", device_id)],
            Ok(removed) => vec![format!(
                "Removed {} registration(s) of device {}.",
                removed, device_id
            )],
            Err(e) => {
                warn!(account = %ctx.account, device_id, error = %e, "Failed to remove device");
                vec![format!("Failed to remove device {}.", device_id)]
            }
        }
    }
}

fn help_lines() -> Vec<String> {
    [
        "help: Show this help",
        "test: Send notifications to registered devices",
        "list: List all registered devices",
        "remove <device-id>: Remove every registration of a device",
    ]
    .iter()
    .map(|line| line.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{AttemptOutcome, PushRequest, PushTransport, RetryPolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const PUSH_ID: &str = "9167e47b01598af7423e2ecd3d0a3ec4";
    const DEVICE_ID: &str = "611d3a30a3d666fc491cdea0d2e1dd6e";
    const NETWORK_ID: &str = "b758eaab1a4611a310642a6e8419fbff";

    #[derive(Default)]
    struct RecordingTransport {
        bodies: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn send(&self, request: &PushRequest) -> AttemptOutcome {
            self.bodies
                .lock()
                .push(serde_json::from_slice(&request.body).unwrap());
            AttemptOutcome::Delivered
        }
    }

    fn module() -> (PalaverModule, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone(), RetryPolicy::default());
        (
            PalaverModule::new(Arc::new(Registry::in_memory()), dispatcher),
            transport,
        )
    }

    fn ctx(id: u64, account: &str, network: Option<&str>) -> ConnectionContext {
        ConnectionContext {
            id,
            account: account.to_string(),
            network: network.map(str::to_string),
            is_admin: account == "admin",
        }
    }

    fn register(module: &PalaverModule, ctx: &ConnectionContext, lines: &[&str]) {
        let mut session = RegistrationSession::new();
        let identify = format!("PALAVER IDENTIFY {PUSH_ID} {DEVICE_ID} {NETWORK_ID}");
        assert_eq!(
            module.handle_client_line(ctx, &mut session, &identify),
            LineOutcome::Handled(vec!["PALAVER REQ *".to_string()])
        );
        let begin = format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}");
        module.handle_client_line(ctx, &mut session, &begin);
        module.handle_client_line(
            ctx,
            &mut session,
            "PALAVER SET PUSH-ENDPOINT http://127.0.0.1:1/push",
        );
        for line in lines {
            module.handle_client_line(ctx, &mut session, line);
        }
        module.handle_client_line(ctx, &mut session, "PALAVER END");
    }

    #[test]
    fn test_load_and_unload_effects() {
        let (module, _) = module();
        let effects = module.on_load();
        assert_eq!(
            effects[0].to_line("admin"),
            ":irc.znc.in CAP admin NEW :palaverapp.com"
        );

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let effects = runtime.block_on(module.on_unload());
        assert_eq!(
            effects[0].to_line("admin"),
            ":irc.znc.in CAP admin DEL :palaverapp.com"
        );
        assert_eq!(
            effects[1].to_line("admin"),
            ":*status!znc@znc.in PRIVMSG admin :Module palaver unloaded."
        );
        assert!(module.dispatcher().is_shut_down());
    }

    #[test]
    fn test_non_protocol_lines_pass_through() {
        let (module, _) = module();
        let ctx = ctx(1, "admin", None);
        let mut session = RegistrationSession::new();
        assert_eq!(
            module.handle_client_line(&ctx, &mut session, "PRIVMSG #rust :hello"),
            LineOutcome::Passthrough
        );
        assert_eq!(
            module.handle_client_line(&ctx, &mut session, "PALAVER FROBNICATE"),
            LineOutcome::Handled(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_test_command_reaches_every_network_without_one() {
        let (module, transport) = module();
        let ctx = ctx(1, "admin", None);
        register(&module, &ctx, &[]);

        let replies = module.handle_module_command(&ctx, "test");
        assert_eq!(replies, vec!["Notification sent to 1 clients.".to_string()]);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let bodies = transport.bodies.lock();
        assert_eq!(
            bodies[0],
            serde_json::json!({
                "badge": 1,
                "message": "Test notification",
                "sender": "palaver",
                "network": NETWORK_ID,
            })
        );
    }

    #[tokio::test]
    async fn test_test_command_filters_by_network() {
        let (module, _) = module();
        let ctx_none = ctx(1, "alice", None);
        register(&module, &ctx_none, &[]);

        let other = ctx(2, "alice", Some("libera"));
        assert_eq!(
            module.handle_module_command(&other, "test"),
            vec!["Notification sent to 0 clients.".to_string()]
        );
    }

    #[test]
    fn test_list_requires_admin() {
        let (module, _) = module();
        assert_eq!(
            module.handle_module_command(&ctx(1, "alice", None), "list"),
            vec!["Permission denied".to_string()]
        );
        assert_eq!(
            module.handle_module_command(&ctx(2, "admin", None), "LIST"),
            vec!["There are no devices registered with this server.".to_string()]
        );
    }

    #[test]
    fn test_list_and_remove() {
        let (module, _) = module();
        let admin = ctx(1, "admin", None);
        register(&module, &admin, &["PALAVER SET VERSION 1.0"]);

        let lines = module.handle_module_command(&admin, "list");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with(DEVICE_ID));
        assert!(lines[1].contains("1.0"));

        let replies = module.handle_module_command(&admin, &format!("remove {DEVICE_ID}"));
        assert_eq!(replies, vec![format!("Removed 1 registration(s) of device {DEVICE_ID}.")]);
        assert_eq!(module.registry().device_count(), 0);

        let replies = module.handle_module_command(&admin, "remove nothing");
        assert_eq!(replies, vec!["No device nothing is registered.".to_string()]);
    }

    #[tokio::test]
    async fn test_mentions_respect_presence() {
        let (module, transport) = module();
        let phone = ctx(1, "alice", Some(NETWORK_ID));
        register(&module, &phone, &["PALAVER ADD MENTION-KEYWORD {nick}"]);

        let message = ChatMessage {
            account: "alice".to_string(),
            network: NETWORK_ID.to_string(),
            channel: Some("#rust".to_string()),
            sender: "bob".to_string(),
            text: "ping Alice".to_string(),
            recipient_nick: "alice".to_string(),
        };

        // Desktop client attached and present.
        let desktop = ctx(2, "alice", Some(NETWORK_ID));
        module.client_attached(&desktop);
        assert!(module.on_chat_message(&message).is_none());

        let mut session = RegistrationSession::new();
        module.handle_client_line(&desktop, &mut session, "PALAVER BACKGROUND");
        let receipt = module.on_chat_message(&message).expect("dispatch");
        assert_eq!(receipt.targeted(), 1);
        receipt.wait().await;

        let bodies = transport.bodies.lock();
        assert_eq!(bodies[0]["channel"], "#rust");
        assert_eq!(bodies[0]["sender"], "bob");
        assert_eq!(bodies[0]["badge"], 1);
    }

    #[test]
    fn test_unmatched_mention_dispatches_nothing() {
        let (module, _) = module();
        let phone = ctx(1, "alice", Some(NETWORK_ID));
        register(&module, &phone, &["PALAVER ADD MENTION-KEYWORD {nick}"]);

        let message = ChatMessage {
            account: "alice".to_string(),
            network: NETWORK_ID.to_string(),
            channel: Some("#rust".to_string()),
            sender: "bob".to_string(),
            text: "nothing to see".to_string(),
            recipient_nick: "alice".to_string(),
        };
        assert!(module.on_chat_message(&message).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_covers_all_accounts_and_bumps_badges() {
        let (module, transport) = module();
        register(&module, &ctx(1, "admin", None), &[]);
        register(&module, &ctx(2, "alice", None), &[]);

        let receipt = module.broadcast("ZNC Admin", "test");
        assert_eq!(receipt.ack_line(), "Notification sent to 2 clients.");
        receipt.wait().await;

        let bodies = transport.bodies.lock();
        assert_eq!(bodies.len(), 2);
        assert!(bodies.iter().all(|body| body.get("network").is_none()));
        assert!(bodies.iter().all(|body| body["badge"] == 1));
        drop(bodies);

        let receipt = module.broadcast("ZNC Admin", "again");
        receipt.wait().await;
        let devices = module.registry().devices("alice");
        assert_eq!(devices[0].badge, 2);
    }

    #[test]
    fn test_purge_account() {
        let (module, _) = module();
        register(&module, &ctx(1, "alice", None), &[]);
        assert!(module.purge_account("alice").unwrap());
        assert!(module.registry().devices("alice").is_empty());
        assert!(!module.purge_account("alice").unwrap());
    }
}
