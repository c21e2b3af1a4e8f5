// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::{
    link, ChannelId, ConnectError, EventSender, ReconnectPolicy, Target, Transport,
    TransportCommand, TransportEvent, TransportHandle, TransportLink,
};

const IRC_MAX_LINE: usize = 512;
const CRLF_LEN: usize = 2;
const PRIVMSG_OVERHEAD: usize = "PRIVMSG ".len() + " :".len();
const MAX_TARGET_LEN: usize = 50;
/// Room for the `:nick!user@host ` prefix the server prepends on relay.
const PREFIX_ALLOWANCE: usize = 100;

/// Longest payload that still fits a relayed PRIVMSG.
pub const IRC_MAX_PAYLOAD: usize =
    IRC_MAX_LINE - CRLF_LEN - PRIVMSG_OVERHEAD - MAX_TARGET_LEN - PREFIX_ALLOWANCE;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest line accepted from the server, CRLF included.
const MAX_INBOUND_LINE: usize = 2 * IRC_MAX_LINE;

/// Installs the process-wide rustls provider. Later calls are no-ops.
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[derive(Clone, Debug)]
pub struct IrcConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub realname: String,
    pub password: Option<String>,
    pub policy: ReconnectPolicy,
}

impl IrcConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: false,
            username: "username".into(),
            realname: "realname".into(),
            password: None,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

pub struct IrcTransport {
    config: IrcConfig,
}

impl IrcTransport {
    pub fn new(config: IrcConfig) -> Self {
        Self { config }
    }
}

impl Transport for IrcTransport {
    fn name(&self) -> &str {
        &self.config.host
    }

    fn max_line_len(&self) -> usize {
        IRC_MAX_PAYLOAD
    }

    fn start(self: Box<Self>, channel: ChannelId, nick: String, events: EventSender) -> TransportHandle {
        let (handle, link) = link(channel, events, IRC_MAX_PAYLOAD);
        tokio::spawn(run(self.config, nick, link));
        handle
    }
}

trait IrcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IrcStream for T {}

async fn connect(config: &IrcConfig) -> std::result::Result<Box<dyn IrcStream>, String> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| format!("TCP connect to {addr} timed out"))?
        .map_err(|e| format!("TCP connect to {addr}: {e}"))?;

    if !config.tls {
        return Ok(Box::new(tcp));
    }

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(config.host.as_str())
        .map_err(|_| format!("Invalid server name: {}", config.host))?
        .to_owned();

    let tls = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| format!("TLS handshake with {} timed out", config.host))?
        .map_err(|e| format!("TLS handshake with {}: {e}", config.host))?;
    Ok(Box::new(tls))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct IrcMessage {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split('!').next().unwrap_or(p))
    }
}

pub(crate) fn parse_irc_line(line: &str) -> Option<IrcMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut rest = line;

    let prefix = if let Some(stripped) = rest.strip_prefix(':') {
        let (p, r) = stripped.split_once(' ')?;
        rest = r;
        Some(p.to_string())
    } else {
        None
    };

    let (head, trailing) = match rest.split_once(" :") {
        Some((h, t)) => (h, Some(t)),
        None => (rest, None),
    };
    let mut parts = head.split(' ').filter(|s| !s.is_empty());
    let command = parts.next()?.to_string();
    let mut params: Vec<String> = parts.map(str::to_string).collect();
    if let Some(t) = trailing {
        params.push(t.to_string());
    }

    Some(IrcMessage {
        prefix,
        command,
        params,
    })
}

fn is_room_name(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

enum SessionEnd {
    Stopped,
    Lost(String),
    EventsClosed,
}

async fn run(config: IrcConfig, mut nick: String, mut link: TransportLink) {
    let mut failures = 0u32;
    let mut last_error = String::new();
    loop {
        if failures > 0 {
            let Some(delay) = config.policy.delay(failures - 1) else {
                warn!(host = %config.host, attempts = failures, "giving up on IRC server");
                let _ = link
                    .emit(TransportEvent::Fatal(ConnectError::RetriesExhausted {
                        attempts: failures,
                        last_error,
                    }))
                    .await;
                return;
            };
            if !wait_backoff(&mut link, &mut nick, delay).await {
                return;
            }
        }

        let stream = match connect(&config).await {
            Ok(s) => s,
            Err(e) => {
                debug!(host = %config.host, error = %e, "IRC connect failed");
                last_error = e;
                failures += 1;
                continue;
            }
        };

        match session(&config, stream, &mut nick, &mut link, &mut failures).await {
            SessionEnd::Stopped | SessionEnd::EventsClosed => {
                link.set_link_up(false);
                let _ = link
                    .emit(TransportEvent::Disconnected("disconnect requested".into()))
                    .await;
                return;
            }
            SessionEnd::Lost(reason) => {
                link.set_link_up(false);
                info!(host = %config.host, reason = %reason, "IRC connection lost");
                if !link.emit(TransportEvent::Disconnected(reason.clone())).await {
                    return;
                }
                last_error = reason;
                failures += 1;
            }
        }
    }
}

/// Splits server output into lines, refusing any longer than
/// [`MAX_INBOUND_LINE`]. A partial line survives a cancelled read.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let room = MAX_INBOUND_LINE.saturating_sub(self.buf.len());
            let read = (&mut self.reader)
                .take(room as u64)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if self.buf.ends_with(b"\n") {
                let mut line = std::mem::take(&mut self.buf);
                line.pop();
                if line.ends_with(b"\r") {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.buf.len() >= MAX_INBOUND_LINE {
                self.buf.clear();
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("server line exceeds {MAX_INBOUND_LINE} bytes"),
                ));
            }
            if read == 0 {
                self.buf.clear();
                return Ok(None);
            }
        }
    }
}

async fn session(
    config: &IrcConfig,
    stream: Box<dyn IrcStream>,
    nick: &mut String,
    link: &mut TransportLink,
    failures: &mut u32,
) -> SessionEnd {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = LineReader::new(reader);
    let mut room: Option<String> = None;

    let mut greeting = String::new();
    if let Some(password) = &config.password {
        greeting.push_str(&format!("PASS {password}\r\n"));
    }
    greeting.push_str(&format!("NICK {nick}\r\n"));
    greeting.push_str(&format!(
        "USER {} 0 * :{}\r\n",
        config.username, config.realname
    ));
    if let Err(e) = writer.write_all(greeting.as_bytes()).await {
        return SessionEnd::Lost(e.to_string());
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    Ok(None) => return SessionEnd::Lost("server closed connection".into()),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                };
                let Some(msg) = parse_irc_line(&line) else {
                    continue;
                };
                let mut reply = None;
                let mut events = Vec::new();
                match msg.command.as_str() {
                    "PING" => {
                        let token = msg.params.first().cloned().unwrap_or_default();
                        reply = Some(format!("PONG :{token}\r\n"));
                    }
                    "001" => {
                        if let Some(accepted) = msg.params.first() {
                            *nick = accepted.clone();
                        }
                        *failures = 0;
                        link.set_link_up(true);
                        events.push(TransportEvent::Connected { nick: nick.clone() });
                    }
                    "433" => {
                        let taken = msg.params.get(1).cloned().unwrap_or_else(|| nick.clone());
                        events.push(TransportEvent::NickInUse { nick: taken });
                    }
                    "353" => {
                        if let Some(names) = msg.params.last() {
                            for name in names.split(' ').filter(|n| !n.is_empty()) {
                                let name = name.trim_start_matches(['@', '+', '%', '~', '&']);
                                if name != nick.as_str() {
                                    events.push(TransportEvent::PeerJoined(name.to_string()));
                                }
                            }
                        }
                    }
                    "JOIN" => {
                        let joined = msg.params.first().cloned().unwrap_or_default();
                        match msg.source_nick() {
                            Some(n) if n == nick.as_str() => {
                                room = Some(joined.clone());
                                events.push(TransportEvent::Joined { room: joined });
                            }
                            Some(n) => events.push(TransportEvent::PeerJoined(n.to_string())),
                            None => {}
                        }
                    }
                    "PART" | "QUIT" => {
                        if let Some(n) = msg.source_nick() {
                            if n != nick.as_str() {
                                events.push(TransportEvent::PeerLeft(n.to_string()));
                            }
                        }
                    }
                    "KICK" => {
                        if let Some(kicked) = msg.params.get(1) {
                            if kicked.as_str() == nick.as_str() {
                                return SessionEnd::Lost("kicked from room".into());
                            }
                            events.push(TransportEvent::PeerLeft(kicked.clone()));
                        }
                    }
                    "NICK" => {
                        if let (Some(old), Some(new)) = (msg.source_nick(), msg.params.first()) {
                            if old == nick.as_str() {
                                *nick = new.clone();
                            } else {
                                events.push(TransportEvent::PeerLeft(old.to_string()));
                                events.push(TransportEvent::PeerJoined(new.clone()));
                            }
                        }
                    }
                    "PRIVMSG" => {
                        if let (Some(from), Some(target), Some(text)) =
                            (msg.source_nick(), msg.params.first(), msg.params.get(1))
                        {
                            events.push(TransportEvent::LineReceived {
                                from: from.to_string(),
                                private: !is_room_name(target),
                                line: text.clone(),
                            });
                        }
                    }
                    "ERROR" => {
                        let reason = msg.params.last().cloned().unwrap_or_default();
                        return SessionEnd::Lost(format!("server error: {reason}"));
                    }
                    _ => {}
                }

                if let Some(reply) = reply {
                    if let Err(e) = writer.write_all(reply.as_bytes()).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                for event in events {
                    if !link.emit(event).await {
                        return SessionEnd::EventsClosed;
                    }
                }
            }
            cmd = link.commands.recv() => {
                let out = match cmd {
                    None | Some(TransportCommand::Disconnect) => {
                        let _ = writer.write_all(b"QUIT :leaving\r\n").await;
                        let _ = writer.flush().await;
                        return SessionEnd::Stopped;
                    }
                    Some(TransportCommand::Join(r)) => format!("JOIN {r}\r\n"),
                    Some(TransportCommand::SetNick(n)) => {
                        *nick = n;
                        format!("NICK {nick}\r\n")
                    }
                    Some(TransportCommand::Send { target, line }) => {
                        let to = match &target {
                            Target::Room => match &room {
                                Some(r) => r.clone(),
                                None => {
                                    debug!("dropping room line sent before join");
                                    continue;
                                }
                            },
                            Target::Nick(n) => n.clone(),
                        };
                        format!("PRIVMSG {to} :{line}\r\n")
                    }
                    Some(TransportCommand::Leave) => match room.take() {
                        Some(r) => format!("PART {r}\r\n"),
                        None => continue,
                    },
                };
                if let Err(e) = writer.write_all(out.as_bytes()).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
        }
    }
}

async fn wait_backoff(link: &mut TransportLink, nick: &mut String, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = link.commands.recv() => match cmd {
                Some(TransportCommand::Disconnect) | None => return false,
                Some(TransportCommand::SetNick(n)) => *nick = n,
                Some(_) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_privmsg() {
        let msg = parse_irc_line(":CJ1abc!user@host PRIVMSG #cojo :CJ1abc !orderbook 1/1 0\r\n")
            .unwrap();
        assert_eq!(msg.source_nick(), Some("CJ1abc"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#cojo", "CJ1abc !orderbook 1/1 0"]);
    }

    #[test]
    fn test_parse_numeric_and_ping() {
        let msg = parse_irc_line(":irc.example.net 433 * CJ1abc :Nickname is already in use")
            .unwrap();
        assert_eq!(msg.command, "433");
        assert_eq!(msg.params[1], "CJ1abc");

        let ping = parse_irc_line("PING :irc.example.net").unwrap();
        assert_eq!(ping.prefix, None);
        assert_eq!(ping.params, vec!["irc.example.net"]);
    }

    #[test]
    fn test_room_detection() {
        assert!(is_room_name("#cojo"));
        assert!(!is_room_name("CJ1abc"));
    }

    #[test]
    fn test_payload_limit_fits_line() {
        let target = "#".repeat(MAX_TARGET_LEN);
        let prefix = "x".repeat(PREFIX_ALLOWANCE);
        let payload = "y".repeat(IRC_MAX_PAYLOAD);
        let line = format!("{prefix}PRIVMSG {target} :{payload}\r\n");
        assert_eq!(line.len(), IRC_MAX_LINE);
    }

    #[tokio::test]
    async fn test_line_reader_splits_and_strips() {
        let input: &[u8] = b"PING :a\r\n:srv 001 CJ1x :hi\npartial";
        let mut reader = LineReader::new(input);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("PING :a"));
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some(":srv 001 CJ1x :hi")
        );
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_rejects_oversized_line() {
        let mut input = vec![b'x'; MAX_INBOUND_LINE * 4];
        input.extend_from_slice(b"\r\n");
        let mut reader = LineReader::new(input.as_slice());
        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let exact = format!("{}\r\n", "y".repeat(MAX_INBOUND_LINE - 2));
        let mut reader = LineReader::new(exact.as_bytes());
        assert_eq!(
            reader.next_line().await.unwrap().map(|l| l.len()),
            Some(MAX_INBOUND_LINE - 2)
        );
    }
}
