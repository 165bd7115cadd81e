//! The command surface: one method per protocol verb, each formatting
//! its arguments and delegating to [`crate::mux::Engine::exec`].
//!
//! None of the formatting here is generic string-building — every
//! non-trivial rule (hex-encoding `AUTHENTICATE`'s argument, dot-stuffing
//! `LOADCONF`'s body, the `IFUNUSED` suffix, `SERVER=` repetition) is
//! called out in its own method so it is easy to audit against the
//! control-spec text it implements.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::dispatcher::{EventHandler, ListenerId};
use crate::error::Error;
use crate::mux::Engine;
use crate::reply::Reply;
use crate::tap::DebugTap;

const KNOWN_EVENTS: &[&str] = &[
    "CIRC", "STREAM", "ORCONN", "BW", "DEBUG", "INFO", "NOTICE", "WARN", "ERR", "NEWDESC",
    "ADDRMAP", "AUTHDIR_NEWDESCS", "DESCCHANGED", "STATUS_GENERAL", "STATUS_CLIENT",
    "STATUS_SERVER", "GUARD", "NS", "STREAM_BW", "CLIENTS_SEEN", "NEWCONSENSUS",
    "BUILDTIMEOUT_SET", "SIGNAL", "CONF_CHANGED", "CIRC_BW", "TRANSPORT_LAUNCHED",
    "CONN_BW", "CELL_STATS", "TB_EMPTY", "HS_DESC", "HS_DESC_CONTENT", "NETWORK_LIVENESS",
    "PT_LOG", "PT_STATUS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnectionState {
    Fresh = 0,
    Authenticated = 1,
    Closed = 2,
}

/// Parsed `PROTOCOLINFO` reply.
#[derive(Debug, Clone, Default)]
pub struct ProtocolInfo {
    pub protocol_version: Option<String>,
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<String>,
    pub tor_version: Option<String>,
}

/// Parsed `AUTHCHALLENGE` reply.
#[derive(Debug, Clone)]
pub struct AuthChallengeReply {
    pub server_hash: String,
    pub server_nonce: String,
}

/// Parsed `ADD_ONION` reply.
#[derive(Debug, Clone)]
pub struct AddOnionReply {
    pub service_id: String,
    pub private_key: Option<String>,
}

/// The Tor control connection façade: authenticate once, then issue any
/// number of commands and register event callbacks.
///
/// Wraps an [`Engine`], so cloning a `Controller` shares the same
/// background reader and write lock (spec.md §5's "safe for use from
/// multiple concurrent callers").
#[derive(Clone)]
pub struct Controller {
    engine: Engine,
    state: Arc<AtomicU8>,
}

impl Controller {
    pub fn new(
        reader: Box<dyn AsyncRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> Self {
        Controller {
            engine: Engine::new(reader, writer),
            state: Arc::new(AtomicU8::new(ConnectionState::Fresh as u8)),
        }
    }

    /// Starts the background reader explicitly; otherwise it is started
    /// lazily by the first command.
    pub async fn start(&self) {
        self.engine.start().await;
    }

    pub fn add_raw_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.engine.add_raw_listener(listener)
    }

    pub fn remove_raw_listener(&self, id: ListenerId) {
        self.engine.remove_raw_listener(id);
    }

    pub fn set_typed_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        self.engine.set_typed_handler(handler);
    }

    pub fn set_debug_tap(&self, tap: Option<Arc<dyn DebugTap>>) {
        self.engine.set_debug_tap(tap);
    }

    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Fresh,
            1 => ConnectionState::Authenticated,
            _ => ConnectionState::Closed,
        }
    }

    fn require_authenticated(&self, verb: &str) -> Result<(), Error> {
        match self.state() {
            ConnectionState::Fresh => Err(Error::invalid_argument(format!(
                "{verb} is not valid before AUTHENTICATE"
            ))),
            ConnectionState::Closed => Err(Error::invalid_argument(format!(
                "{verb} is not valid after the connection is closed"
            ))),
            ConnectionState::Authenticated => Ok(()),
        }
    }

    async fn exec(&self, command: &str, body: Option<&str>) -> Result<Reply, Error> {
        self.engine.exec(command, body).await
    }

    // ---- Fresh-state verbs ---- //

    /// `AUTHENTICATE`. `secret` is lower-case hex-encoded; an empty
    /// secret produces `AUTHENTICATE ` with no argument, matching a
    /// cookie-less or already-open control port.
    pub async fn authenticate(&self, secret: &[u8]) -> Result<(), Error> {
        let command = if secret.is_empty() {
            "AUTHENTICATE ".to_owned()
        } else {
            format!("AUTHENTICATE {}", hex_encode(secret))
        };

        self.exec(&command, None).await?;
        self.state.store(ConnectionState::Authenticated as u8, Ordering::Release);
        Ok(())
    }

    /// `PROTOCOLINFO`.
    pub async fn protocolinfo(&self) -> Result<ProtocolInfo, Error> {
        let reply = self.exec("PROTOCOLINFO 1", None).await?;
        let mut info = ProtocolInfo::default();

        for line in reply.lines() {
            let message = line.message.as_str();
            if let Some(rest) = message.strip_prefix("PROTOCOLINFO ") {
                info.protocol_version = Some(rest.trim().to_owned());
            } else if let Some(rest) = message.strip_prefix("AUTH ") {
                for token in rest.split_whitespace() {
                    if let Some(methods) = token.strip_prefix("METHODS=") {
                        info.auth_methods = methods.split(',').map(str::to_owned).collect();
                    } else if let Some(path) = token.strip_prefix("COOKIEFILE=") {
                        info.cookie_file = Some(unquote_best_effort(path));
                    }
                }
            } else if let Some(rest) = message.strip_prefix("VERSION ") {
                for token in rest.split_whitespace() {
                    if let Some(version) = token.strip_prefix("Tor=") {
                        info.tor_version = Some(unquote_best_effort(version));
                    }
                }
            }
        }

        Ok(info)
    }

    /// `AUTHCHALLENGE SAFECOOKIE <nonce>`.
    pub async fn authchallenge(&self, nonce: &[u8]) -> Result<AuthChallengeReply, Error> {
        let command = format!("AUTHCHALLENGE SAFECOOKIE {}", hex_encode(nonce));
        let reply = self.exec(&command, None).await?;
        let message = &reply.first().message;

        let mut server_hash = None;
        let mut server_nonce = None;
        for token in message.split_whitespace() {
            if let Some(v) = token.strip_prefix("SERVERHASH=") {
                server_hash = Some(v.to_owned());
            } else if let Some(v) = token.strip_prefix("SERVERNONCE=") {
                server_nonce = Some(v.to_owned());
            }
        }

        Ok(AuthChallengeReply {
            server_hash: server_hash
                .ok_or_else(|| Error::protocol("AUTHCHALLENGE reply missing SERVERHASH"))?,
            server_nonce: server_nonce
                .ok_or_else(|| Error::protocol("AUTHCHALLENGE reply missing SERVERNONCE"))?,
        })
    }

    /// `QUIT`, fire-and-forget. Tears down the local reader afterwards;
    /// the daemon may close the connection without replying.
    pub async fn close(&self) -> Result<(), Error> {
        let _ = self.engine.send_fire_and_forget("QUIT").await;
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.engine.shutdown().await;
        Ok(())
    }

    /// Aborts the reader immediately without attempting `QUIT` first.
    pub async fn shutdown(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.engine.shutdown().await;
    }

    // ---- Authenticated-state verbs ---- //

    /// `SETCONF k1=v1 k2 ...`. A `None` value resets that key.
    pub async fn setconf(&self, pairs: &[(&str, Option<&str>)]) -> Result<(), Error> {
        self.require_authenticated("SETCONF")?;
        let command = format!("SETCONF {}", format_kv_list(pairs));
        self.exec(&command, None).await.map(drop)
    }

    /// `RESETCONF k1=v1 k2 ...`.
    pub async fn resetconf(&self, pairs: &[(&str, Option<&str>)]) -> Result<(), Error> {
        self.require_authenticated("RESETCONF")?;
        let command = format!("RESETCONF {}", format_kv_list(pairs));
        self.exec(&command, None).await.map(drop)
    }

    /// `GETCONF k1 k2 ...`, returning each `key=value` (or bare key with
    /// an empty value) line of the reply.
    pub async fn getconf(&self, keys: &[&str]) -> Result<Vec<(String, String)>, Error> {
        self.require_authenticated("GETCONF")?;
        let command = format!("GETCONF {}", keys.join(" "));
        let reply = self.exec(&command, None).await?;
        Ok(reply.lines().iter().map(|line| split_kv(&line.message)).collect())
    }

    /// `LOADCONF`; `config_text` is sent as the command's data body,
    /// joined by `\n` if the caller assembled it from separate lines.
    pub async fn loadconf(&self, config_text: &str) -> Result<(), Error> {
        self.require_authenticated("LOADCONF")?;
        self.exec("LOADCONF", Some(config_text)).await.map(drop)
    }

    /// `SAVECONF`, optionally forcing a save even with non-persistable
    /// options present.
    pub async fn saveconf(&self, force: bool) -> Result<(), Error> {
        self.require_authenticated("SAVECONF")?;
        let command = if force { "SAVECONF FORCE".to_owned() } else { "SAVECONF".to_owned() };
        self.exec(&command, None).await.map(drop)
    }

    /// `SETEVENTS e1 e2 ...`. Unknown event names fail with
    /// [`Error::InvalidArgument`] before any bytes are sent.
    pub async fn setevents(&self, names: &[&str]) -> Result<(), Error> {
        self.require_authenticated("SETEVENTS")?;

        for name in names {
            let upper = name.to_ascii_uppercase();
            if !KNOWN_EVENTS.contains(&upper.as_str()) {
                return Err(Error::invalid_argument(format!("unknown event name: {name}")));
            }
        }

        let command = format!("SETEVENTS {}", names.join(" "));
        self.exec(&command, None).await.map(drop)
    }

    /// `SIGNAL <name>`.
    pub async fn signal(&self, name: &str) -> Result<(), Error> {
        self.require_authenticated("SIGNAL")?;
        self.exec(&format!("SIGNAL {name}"), None).await.map(drop)
    }

    /// `MAPADDRESS from=quote(to) ...`, returning the `=`-separated pairs
    /// of the reply.
    pub async fn mapaddress(&self, pairs: &[(&str, &str)]) -> Result<Vec<(String, String)>, Error> {
        self.require_authenticated("MAPADDRESS")?;

        if pairs.is_empty() {
            return Err(Error::invalid_argument("MAPADDRESS requires at least one pair"));
        }

        let args = pairs
            .iter()
            .map(|(from, to)| format!("{from}={}", crate::codec::quote(to)))
            .collect::<Vec<_>>()
            .join(" ");

        let reply = self.exec(&format!("MAPADDRESS {args}"), None).await?;
        Ok(reply.lines().iter().map(|line| split_kv(&line.message)).collect())
    }

    /// `GETINFO k1 k2 ...`, returning each `key=value` line of the
    /// reply.
    pub async fn getinfo(&self, keys: &[&str]) -> Result<Vec<(String, String)>, Error> {
        self.require_authenticated("GETINFO")?;
        let command = format!("GETINFO {}", keys.join(" "));
        let reply = self.exec(&command, None).await?;
        Ok(reply
            .lines()
            .iter()
            .filter(|line| line.message != "OK")
            .map(|line| split_kv(&line.message))
            .collect())
    }

    /// Convenience over [`Controller::getinfo`] for the common case of a
    /// single key (spec.md's S2 scenario: `getInfo("version")`).
    pub async fn getinfo_single(&self, key: &str) -> Result<String, Error> {
        let mut values = self.getinfo(&[key]).await?;
        values
            .pop()
            .map(|(_, value)| value)
            .ok_or_else(|| Error::protocol(format!("GETINFO {key} returned no value")))
    }

    /// `EXTENDCIRCUIT <circ_id> <path> [purpose=<purpose>]`, returning
    /// the (possibly newly allocated, when `circ_id` was `0`) circuit
    /// id from the reply.
    pub async fn extendcircuit(&self, circ_id: &str, path: &[&str], purpose: Option<&str>) -> Result<String, Error> {
        self.require_authenticated("EXTENDCIRCUIT")?;

        let mut command = format!("EXTENDCIRCUIT {circ_id} {}", path.join(","));
        if let Some(purpose) = purpose {
            command.push_str(&format!(" purpose={purpose}"));
        }

        let reply = self.exec(&command, None).await?;
        reply
            .first()
            .message
            .strip_prefix("EXTENDED ")
            .map(str::to_owned)
            .ok_or_else(|| Error::protocol("EXTENDCIRCUIT reply missing EXTENDED circuit id"))
    }

    /// `SETCIRCUITPURPOSE <circ_id> purpose=<purpose>`.
    pub async fn setcircuitpurpose(&self, circ_id: &str, purpose: &str) -> Result<(), Error> {
        self.require_authenticated("SETCIRCUITPURPOSE")?;
        self.exec(&format!("SETCIRCUITPURPOSE {circ_id} purpose={purpose}"), None)
            .await
            .map(drop)
    }

    /// `ATTACHSTREAM <stream_id> <circ_id> [HOP=<hop>]`.
    pub async fn attachstream(&self, stream_id: &str, circ_id: &str, hop: Option<u32>) -> Result<(), Error> {
        self.require_authenticated("ATTACHSTREAM")?;
        let mut command = format!("ATTACHSTREAM {stream_id} {circ_id}");
        if let Some(hop) = hop {
            command.push_str(&format!(" HOP={hop}"));
        }
        self.exec(&command, None).await.map(drop)
    }

    /// `+POSTDESCRIPTOR [purpose=<purpose>] [cache=<yes|no>]`, body is
    /// the descriptor text.
    pub async fn postdescriptor(&self, descriptor: &str, purpose: Option<&str>, cache: Option<bool>) -> Result<(), Error> {
        self.require_authenticated("POSTDESCRIPTOR")?;

        let mut command = "POSTDESCRIPTOR".to_owned();
        if let Some(purpose) = purpose {
            command.push_str(&format!(" purpose={purpose}"));
        }
        if let Some(cache) = cache {
            command.push_str(if cache { " cache=yes" } else { " cache=no" });
        }

        self.exec(&command, Some(descriptor)).await.map(drop)
    }

    /// `REDIRECTSTREAM <stream_id> <address> [port]`.
    pub async fn redirectstream(&self, stream_id: &str, address: &str, port: Option<u16>) -> Result<(), Error> {
        self.require_authenticated("REDIRECTSTREAM")?;
        let mut command = format!("REDIRECTSTREAM {stream_id} {address}");
        if let Some(port) = port {
            command.push_str(&format!(" {port}"));
        }
        self.exec(&command, None).await.map(drop)
    }

    /// `CLOSESTREAM <stream_id> <reason>`.
    pub async fn closestream(&self, stream_id: &str, reason: u8) -> Result<(), Error> {
        self.require_authenticated("CLOSESTREAM")?;
        self.exec(&format!("CLOSESTREAM {stream_id} {reason}"), None).await.map(drop)
    }

    /// `CLOSECIRCUIT <circ_id>`, appending `IFUNUSED` only when
    /// `if_unused` is set.
    pub async fn closecircuit(&self, circ_id: &str, if_unused: bool) -> Result<(), Error> {
        self.require_authenticated("CLOSECIRCUIT")?;
        let command = if if_unused {
            format!("CLOSECIRCUIT {circ_id} IFUNUSED")
        } else {
            format!("CLOSECIRCUIT {circ_id}")
        };
        self.exec(&command, None).await.map(drop)
    }

    /// `USEFEATURE f1 f2 ...`.
    pub async fn usefeature(&self, features: &[&str]) -> Result<(), Error> {
        self.require_authenticated("USEFEATURE")?;
        self.exec(&format!("USEFEATURE {}", features.join(" ")), None).await.map(drop)
    }

    /// `RESOLVE [mode=reverse] <address>`.
    pub async fn resolve(&self, address: &str, reverse: bool) -> Result<(), Error> {
        self.require_authenticated("RESOLVE")?;
        let command = if reverse {
            format!("RESOLVE mode=reverse {address}")
        } else {
            format!("RESOLVE {address}")
        };
        self.exec(&command, None).await.map(drop)
    }

    /// `DROPGUARDS`.
    pub async fn dropguards(&self) -> Result<(), Error> {
        self.require_authenticated("DROPGUARDS")?;
        self.exec("DROPGUARDS", None).await.map(drop)
    }

    /// `HSFETCH <address> [SERVER=<server>] ...`.
    pub async fn hsfetch(&self, address: &str, servers: &[&str]) -> Result<(), Error> {
        self.require_authenticated("HSFETCH")?;

        let mut command = format!("HSFETCH {address}");
        for server in servers.iter().filter(|s| !s.is_empty()) {
            command.push_str(&format!(" SERVER={server}"));
        }

        self.exec(&command, None).await.map(drop)
    }

    /// `+HSPOST [SERVER=<server>] ...`, body is the descriptor text.
    pub async fn hspost(&self, descriptor: &str, servers: &[&str]) -> Result<(), Error> {
        self.require_authenticated("HSPOST")?;

        let mut command = "HSPOST".to_owned();
        for server in servers.iter().filter(|s| !s.is_empty()) {
            command.push_str(&format!(" SERVER={server}"));
        }

        self.exec(&command, Some(descriptor)).await.map(drop)
    }

    /// `ADD_ONION <key_spec> [Flags=<f1,f2,...>] Port=<virt>[,<target>]
    /// ...`, returning the assigned `ServiceID` and, when a new key was
    /// generated, `PrivateKey`.
    pub async fn add_onion(
        &self,
        key_spec: &str,
        ports: &[(u16, Option<&str>)],
        flags: &[&str],
    ) -> Result<AddOnionReply, Error> {
        self.require_authenticated("ADD_ONION")?;

        if ports.is_empty() {
            return Err(Error::invalid_argument("ADD_ONION requires at least one port mapping"));
        }

        let mut command = format!("ADD_ONION {key_spec}");
        if !flags.is_empty() {
            command.push_str(&format!(" Flags={}", flags.join(",")));
        }
        for (virt, target) in ports {
            match target {
                Some(target) => command.push_str(&format!(" Port={virt},{target}")),
                None => command.push_str(&format!(" Port={virt}")),
            }
        }

        let reply = self.exec(&command, None).await?;

        let mut service_id = None;
        let mut private_key = None;
        for line in reply.lines() {
            if let Some(id) = line.message.strip_prefix("ServiceID=") {
                service_id = Some(id.to_owned());
            } else if let Some(key) = line.message.strip_prefix("PrivateKey=") {
                private_key = Some(key.to_owned());
            }
        }

        Ok(AddOnionReply {
            service_id: service_id.ok_or_else(|| Error::protocol("ADD_ONION reply missing ServiceID"))?,
            private_key,
        })
    }

    /// `DEL_ONION <service_id>`.
    pub async fn del_onion(&self, service_id: &str) -> Result<(), Error> {
        self.require_authenticated("DEL_ONION")?;
        self.exec(&format!("DEL_ONION {service_id}"), None).await.map(drop)
    }

    /// `TAKEOWNERSHIP`.
    pub async fn takeownership(&self) -> Result<(), Error> {
        self.require_authenticated("TAKEOWNERSHIP")?;
        self.exec("TAKEOWNERSHIP", None).await.map(drop)
    }

    /// `DROPOWNERSHIP`.
    pub async fn dropownership(&self) -> Result<(), Error> {
        self.require_authenticated("DROPOWNERSHIP")?;
        self.exec("DROPOWNERSHIP", None).await.map(drop)
    }

    /// `SIGNAL <name>`, fire-and-forget: used for the shutdown signals
    /// (`SHUTDOWN`, `HALT`) where the daemon may tear down the control
    /// connection before a reply is sent.
    pub async fn shutdown_tor(&self, signal: &str) -> Result<(), Error> {
        self.require_authenticated("SIGNAL")?;
        self.engine.send_fire_and_forget(&format!("SIGNAL {signal}")).await
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn format_kv_list(pairs: &[(&str, Option<&str>)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{key}={}", crate::codec::quote(value)),
            None => (*key).to_owned(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_kv(message: &str) -> (String, String) {
    match message.split_once('=') {
        Some((key, value)) => (key.to_owned(), value.to_owned()),
        None => (message.to_owned(), String::new()),
    }
}

/// Strips a pair of surrounding double quotes if present; does not
/// process backslash escapes, which `PROTOCOLINFO`'s `COOKIEFILE` and
/// `VERSION` fields do not use in practice.
fn unquote_best_effort(s: &str) -> String {
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_matches_expected_form() {
        assert_eq!(hex_encode(&[]), "");
        assert_eq!(hex_encode(&[0x00, 0xAB, 0xff]), "00abff");
    }

    #[test]
    fn format_kv_list_quotes_values_and_leaves_bare_keys_alone() {
        let pairs: &[(&str, Option<&str>)] = &[("Nickname", Some("X Y")), ("BadOption", None)];
        assert_eq!(format_kv_list(pairs), "Nickname=\"X Y\" BadOption");
    }

    #[test]
    fn split_kv_handles_bare_keys() {
        assert_eq!(split_kv("key=value"), ("key".to_owned(), "value".to_owned()));
        assert_eq!(split_kv("default"), ("default".to_owned(), String::new()));
    }
}
