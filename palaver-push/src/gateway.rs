//! Stand-alone line gateway.
//!
//! A minimal bouncer front end for running the module without a real host.
//! Each TCP connection authenticates with `PASS <account>[/<network>]` and then
//! speaks a small subset of IRC: `PALAVER` lines, `PRIVMSG` to `*palaver`,
//! `*status`, a channel or another account, `PING` and `QUIT`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::GatewayConfig;
use crate::logging::LoggingConfig;
use crate::module::{CAPABILITY, ChatMessage, ConnectionContext, LineOutcome, MODULE_NAME, PalaverModule};
use crate::session::RegistrationSession;

/// Longest accepted client line.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Sender shown on administrative broadcasts.
pub const BROADCAST_SENDER: &str = "ZNC Admin";

/// Account name that is granted administrator rights.
pub const ADMIN_ACCOUNT: &str = "admin";

const SERVER_PREFIX: &str = ":irc.znc.in";

/// State of one client connection.
#[derive(Debug, Default)]
pub struct Connection {
    ctx: Option<ConnectionContext>,
    session: RegistrationSession,
    closed: bool,
}

impl Connection {
    pub fn context(&self) -> Option<&ConnectionContext> {
        self.ctx.as_ref()
    }

    pub fn session(&self) -> &RegistrationSession {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub struct Gateway {
    module: Arc<PalaverModule>,
    next_connection_id: AtomicU64,
    tracker: TaskTracker,
    cancel_token: CancellationToken,
    logging: Option<LoggingConfig>,
}

impl Gateway {
    pub fn new(module: Arc<PalaverModule>) -> Self {
        Self {
            module,
            next_connection_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
            cancel_token: CancellationToken::new(),
            logging: None,
        }
    }

    /// Let administrators change the log filter with `*status loglevel <directive>`.
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn module(&self) -> &Arc<PalaverModule> {
        &self.module
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub async fn bind(config: &GatewayConfig) -> Result<TcpListener> {
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        Ok(listener)
    }

    /// Accept connections until the gateway is shut down, then wait for them to close.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Gateway listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        self.tracker.spawn(async move {
                            gateway.handle_stream(stream, peer).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Gateway stopped");
        Ok(())
    }

    async fn handle_stream(&self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut connection = Connection::default();
        debug!(%peer, "Connection accepted");

        while !connection.closed {
            let line = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(%peer, "Failed to read line: {}", e);
                        break;
                    }
                    None => break,
                },
            };

            let replies = self.process_line(&mut connection, &line);
            if let Err(e) = write_lines(&mut write_half, &replies).await {
                debug!(%peer, "Failed to write reply: {}", e);
                break;
            }
        }

        self.close(connection);
        debug!(%peer, "Connection closed");
    }

    /// Handle one client line and return the lines to send back.
    pub fn process_line(&self, connection: &mut Connection, line: &str) -> Vec<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Vec::new();
        }

        let Some(ctx) = connection.ctx.clone() else {
            return self.process_unregistered(connection, line);
        };

        if let LineOutcome::Handled(replies) =
            self.module
                .handle_client_line(&ctx, &mut connection.session, line)
        {
            return replies;
        }

        let (verb, rest) = split_token(line);
        match verb.to_ascii_uppercase().as_str() {
            "QUIT" => {
                connection.closed = true;
                Vec::new()
            }
            "PING" => vec![format!("{} PONG {}", SERVER_PREFIX, rest)],
            "PRIVMSG" => self.privmsg(&ctx, rest),
            _ => {
                debug!(account = %ctx.account, verb, "Ignoring line");
                Vec::new()
            }
        }
    }

    /// Detach a finished connection from the module.
    pub fn close(&self, connection: Connection) {
        if let Some(ctx) = connection.ctx {
            self.module.client_detached(&ctx, connection.session);
        }
    }

    fn process_unregistered(&self, connection: &mut Connection, line: &str) -> Vec<String> {
        let (verb, rest) = split_token(line);
        match verb.to_ascii_uppercase().as_str() {
            "CAP" => cap_reply(rest),
            "NICK" | "USER" => Vec::new(),
            "QUIT" => {
                connection.closed = true;
                Vec::new()
            }
            "PASS" => match parse_pass(rest) {
                Some((account, network)) => {
                    let ctx = ConnectionContext {
                        id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
                        is_admin: account == ADMIN_ACCOUNT,
                        account,
                        network,
                    };
                    self.module.client_attached(&ctx);
                    info!(account = %ctx.account, network = ?ctx.network, "Client logged in");
                    let welcome = format!("{} 001 {} :Welcome to ZNC", SERVER_PREFIX, ctx.account);
                    connection.ctx = Some(ctx);
                    vec![welcome]
                }
                None => vec![format!("{} 464 * :Invalid password", SERVER_PREFIX)],
            },
            _ => vec![format!("{} 451 * :You have not registered", SERVER_PREFIX)],
        }
    }

    fn privmsg(&self, ctx: &ConnectionContext, rest: &str) -> Vec<String> {
        let (target, text) = split_token(rest);
        let text = text.strip_prefix(':').unwrap_or(text);

        if target.eq_ignore_ascii_case("*palaver") {
            return self
                .module
                .handle_module_command(ctx, text)
                .into_iter()
                .map(|reply| module_line(&ctx.account, &reply))
                .collect();
        }

        if target.eq_ignore_ascii_case("*status") {
            return self.status_command(ctx, text);
        }

        let Some(network) = ctx.network.clone() else {
            debug!(account = %ctx.account, "Dropping chat message without a network");
            return Vec::new();
        };

        if target.starts_with(['#', '&']) {
            for account in self.module.registry().accounts() {
                if account == ctx.account {
                    continue;
                }
                self.module.on_chat_message(&ChatMessage {
                    recipient_nick: account.clone(),
                    account,
                    network: network.clone(),
                    channel: Some(target.to_string()),
                    sender: ctx.account.clone(),
                    text: text.to_string(),
                });
            }
        } else {
            self.module.on_chat_message(&ChatMessage {
                account: target.to_string(),
                network,
                channel: None,
                sender: ctx.account.clone(),
                text: text.to_string(),
                recipient_nick: target.to_string(),
            });
        }

        Vec::new()
    }

    fn status_command(&self, ctx: &ConnectionContext, text: &str) -> Vec<String> {
        let (command, argument) = split_token(text);
        let command = command.to_ascii_lowercase();
        if !matches!(command.as_str(), "broadcast" | "loglevel") {
            return vec![status_line(&ctx.account, "Unknown command!")];
        }
        if !ctx.is_admin {
            return vec![status_line(&ctx.account, "Permission denied")];
        }

        if command == "broadcast" {
            let receipt = self.module.broadcast(BROADCAST_SENDER, argument);
            return vec![module_line(&ctx.account, &receipt.ack_line())];
        }

        let reply = match &self.logging {
            None => "Logging is not configured".to_string(),
            Some(logging) if argument.is_empty() => format!("Log filter: {}", logging.get_filter()),
            Some(logging) => match logging.set_filter(argument) {
                Ok(()) => format!("Log filter set to {}", argument),
                Err(e) => e.to_string(),
            },
        };
        vec![status_line(&ctx.account, &reply)]
    }
}

fn cap_reply(rest: &str) -> Vec<String> {
    let (subcommand, args) = split_token(rest);
    match subcommand.to_ascii_uppercase().as_str() {
        "LS" => vec![format!("{} CAP unknown-nick LS :{}", SERVER_PREFIX, CAPABILITY)],
        "REQ" => {
            let requested = args.strip_prefix(':').unwrap_or(args);
            let verdict = if requested.split_whitespace().all(|cap| cap == CAPABILITY) {
                "ACK"
            } else {
                "NAK"
            };
            vec![format!(
                "{} CAP unknown-nick {} :{}",
                SERVER_PREFIX, verdict, requested
            )]
        }
        _ => Vec::new(),
    }
}

/// Parse `PASS [:]<account>[/<network>][:<password>]`.
pub fn parse_pass(rest: &str) -> Option<(String, Option<String>)> {
    let (token, _) = split_token(rest);
    let token = token.strip_prefix(':').unwrap_or(token);
    let login = token.split_once(':').map_or(token, |(login, _)| login);

    let (account, network) = match login.split_once('/') {
        Some((account, network)) => (account, Some(network)),
        None => (login, None),
    };
    if account.is_empty() {
        return None;
    }

    let network = network.filter(|n| !n.is_empty()).map(str::to_string);
    Some((account.to_string(), network))
}

/// A reply from the module to `account`.
pub fn module_line(account: &str, text: &str) -> String {
    format!(":*{}!znc@znc.in PRIVMSG {} :{}", MODULE_NAME, account, text)
}

fn status_line(account: &str, text: &str) -> String {
    format!(":*status!znc@znc.in PRIVMSG {} :{}", account, text)
}

fn split_token(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.split_once(' ') {
        Some((token, rest)) => (token, rest.trim_start()),
        None => (line, ""),
    }
}

async fn write_lines(writer: &mut OwnedWriteHalf, lines: &[String]) -> std::io::Result<()> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push_str("\r\n");
    }
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await
}
