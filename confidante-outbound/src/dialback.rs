//! XEP-0220 dialback: the outbound half of s2s identity checking.
//!
//! Grounded on `pthsock_server`'s dialback.c: `_pthsock_server_merlin`'s
//! three chained SHA-1 rounds for the dialback key, per-remote-domain
//! connection reuse while a host is `htype_OUT`, and the periodic sweep
//! that times out hosts still unvalidated after 120 seconds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Error, anyhow, bail};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt, split};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use confidante_core::xml::stream_parser::{Frame, StreamParser};
use confidante_core::xml::stream_writer::StreamWriter;
use confidante_core::xml::{Element, namespaces};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream_error::StreamError;
use confidante_core::xmpp::stream_header::StreamId;

const OUTBOUND_QUEUE_BUFFER_SIZE: usize = 64;
const MANAGEMENT_CHANNEL_BUFFER_SIZE: usize = 16;
const S2S_PORT: u16 = 5269;

/// Runs the three chained SHA-1 rounds used to derive a dialback key:
/// each round hex-encodes `sha1` of the previous round's hex digest
/// concatenated with the next piece of context.
pub fn dialback_key(secret: &str, to: &str, challenge: &str) -> String {
    fn round(input: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }

    let k1 = round(secret);
    let k2 = round(&format!("{k1}{to}"));
    round(&format!("{k2}{challenge}"))
}

#[derive(Debug, Clone)]
pub struct DialbackConfig {
    pub secret: String,
    pub legacy_compat: bool,
    pub not_yet_valid_sweep_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    Invalid,
}

/// Connects to `from` and asks it to confirm a dialback key we received
/// on its behalf, mirroring the "B->A: db:verify" leg of the dialback
/// exchange.
pub async fn verify_with_originating_server(
    from: &Jid,
    to: &Jid,
    stream_id: &str,
    key: &str,
) -> Result<VerifyOutcome, Error> {
    let address = format!("{}:{S2S_PORT}", from.domain());
    let stream = TcpStream::connect(&address).await?;
    let (read_half, mut write_half) = split(stream);

    let opening = format!(
        "<stream:stream xmlns:stream='{}' xmlns='jabber:server' xmlns:db='{}' to='{}' from='{}'>",
        namespaces::XMPP_STREAMS,
        namespaces::DIALBACK,
        from.domain(),
        to.domain(),
    );
    write_half.write_all(opening.as_bytes()).await?;
    write_half.flush().await?;

    let mut parser = RustyXmlStreamParser::new(read_half);
    let mut writer = StreamWriter::new(write_half);

    let Some(Ok(Frame::StreamStart(_))) = parser.next().await else {
        bail!("peer did not open a stream for dialback verification");
    };

    let mut verify = Element::new("db:verify", Some(namespaces::DIALBACK));
    verify.set_attribute("db", Some(namespaces::XMLNS), namespaces::DIALBACK);
    verify.set_attribute("to", None, from.domain());
    verify.set_attribute("from", None, to.domain());
    verify.set_attribute("id", None, stream_id);
    verify.add_text(key.to_string());
    writer.write_xml_element(&verify).await?;

    loop {
        let Some(Ok(frame)) = parser.next().await else {
            bail!("connection closed before verification completed");
        };

        let Frame::XmlFragment(element) = frame else {
            continue;
        };

        if element.validate("db:verify", Some(namespaces::DIALBACK)) {
            return Ok(match element.attribute("type", None) {
                Some("valid") => VerifyOutcome::Valid,
                _ => VerifyOutcome::Invalid,
            });
        }

        warn!("unexpected element while awaiting dialback verification result, ignoring");
    }
}

/// Handles one accepted s2s TCP connection end to end: the stream-root
/// exchange, then either answering a `db:verify` request made of us or
/// confirming a peer's `db:result` claim by verifying it with the
/// claimed originating server, per `pthsock_server_inx`.
pub async fn accept_connection(
    stream: TcpStream,
    own_domain: &Jid,
    config: &DialbackConfig,
    inbound_tx: mpsc::Sender<Element>,
) -> Result<(), Error> {
    let (read_half, mut write_half) = split(stream);
    let mut parser = RustyXmlStreamParser::new(read_half);

    let Some(Ok(Frame::StreamStart(_))) = parser.next().await else {
        bail!("peer did not open a stream");
    };

    let stream_id = StreamId::new();
    let opening = format!(
        "<stream:stream xmlns:stream='{}' xmlns='jabber:server' xmlns:db='{}' id='{}'>",
        namespaces::XMPP_STREAMS,
        namespaces::DIALBACK,
        stream_id.as_str(),
    );
    write_half.write_all(opening.as_bytes()).await?;
    write_half.flush().await?;
    let mut writer = StreamWriter::new(write_half);

    let mut peer_validated = false;

    loop {
        let Some(Ok(frame)) = parser.next().await else {
            return Ok(());
        };

        let Frame::XmlFragment(element) = frame else {
            continue;
        };

        if element.validate("db:verify", Some(namespaces::DIALBACK)) {
            answer_verify_request(&mut writer, config, &element).await?;
            continue;
        }

        if element.validate("db:result", Some(namespaces::DIALBACK)) {
            let outcome = answer_result_claim(&mut writer, own_domain, &stream_id, &element).await?;
            peer_validated = outcome == VerifyOutcome::Valid;
            continue;
        }

        if !peer_validated && !config.legacy_compat {
            warn!("rejecting stanza from an unvalidated s2s peer, legacy dialback compat is disabled");
            writer
                .write_xml_element(&StreamError::NotAuthorized.to_element())
                .await?;
            return Ok(());
        }

        if inbound_tx.send(element).await.is_err() {
            return Ok(());
        }
    }
}

async fn answer_verify_request<W: AsyncWrite + Unpin>(
    writer: &mut StreamWriter<W>,
    config: &DialbackConfig,
    element: &Element,
) -> Result<(), Error> {
    let from = element.attribute("from", None).unwrap_or_default().to_string();
    let to = element.attribute("to", None).unwrap_or_default().to_string();
    let id = element.attribute("id", None).unwrap_or_default().to_string();
    let claimed_key = element.text();

    let expected_key = dialback_key(&config.secret, &from, &id);
    let valid = claimed_key == expected_key;

    let mut reply = Element::new("db:verify", Some(namespaces::DIALBACK));
    reply.set_attribute("db", Some(namespaces::XMLNS), namespaces::DIALBACK);
    reply.set_attribute("to", None, from);
    reply.set_attribute("from", None, to);
    reply.set_attribute("id", None, id);
    reply.set_attribute("type", None, if valid { "valid" } else { "invalid" });
    writer.write_xml_element(&reply).await
}

async fn answer_result_claim<W: AsyncWrite + Unpin>(
    writer: &mut StreamWriter<W>,
    own_domain: &Jid,
    stream_id: &StreamId,
    element: &Element,
) -> Result<VerifyOutcome, Error> {
    let from = element.attribute("from", None).unwrap_or_default().to_string();
    let to = element.attribute("to", None).unwrap_or_default().to_string();
    let key = element.text();

    let from_jid = from
        .parse::<Jid>()
        .map_err(|_| anyhow!("db:result from a peer with an unparsable domain"))?;

    let outcome = verify_with_originating_server(&from_jid, own_domain, stream_id.as_str(), &key)
        .await
        .unwrap_or(VerifyOutcome::Invalid);

    let mut reply = Element::new("db:result", Some(namespaces::DIALBACK));
    reply.set_attribute("db", Some(namespaces::XMLNS), namespaces::DIALBACK);
    reply.set_attribute("to", None, from);
    reply.set_attribute("from", None, to);
    reply.set_attribute(
        "type",
        None,
        match outcome {
            VerifyOutcome::Valid => "valid",
            VerifyOutcome::Invalid => "invalid",
        },
    );
    writer.write_xml_element(&reply).await?;
    Ok(outcome)
}

enum HostState {
    Pending {
        queued: Vec<Stanza>,
        created: Instant,
    },
    Valid {
        tx: mpsc::Sender<Stanza>,
    },
}

enum DialbackCommand {
    Send {
        from: Jid,
        to: Jid,
        stanza: Stanza,
    },
    Validated {
        from: Jid,
        to: Jid,
        tx: mpsc::Sender<Stanza>,
    },
    Failed {
        from: Jid,
        to: Jid,
    },
}

struct DialbackTable {
    commands: mpsc::Receiver<DialbackCommand>,
    self_tx: mpsc::Sender<DialbackCommand>,
    config: DialbackConfig,
    inbound_tx: mpsc::Sender<Element>,
    hosts: HashMap<(Jid, Jid), HostState>,
}

impl DialbackTable {
    async fn run(mut self) {
        let mut sweep = interval(self.config.not_yet_valid_sweep_interval);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => return,
                    }
                }
                _ = sweep.tick() => self.sweep_stale_hosts(),
            }
        }
    }

    async fn handle_command(&mut self, command: DialbackCommand) {
        match command {
            DialbackCommand::Send { from, to, stanza } => self.handle_send(from, to, stanza).await,
            DialbackCommand::Validated { from, to, tx } => {
                self.handle_validated(from, to, tx).await
            }
            DialbackCommand::Failed { from, to } => {
                debug!(%from, %to, "dialback connection failed, dropping queued stanzas");
                self.hosts.remove(&(from, to));
            }
        }
    }

    async fn handle_send(&mut self, from: Jid, to: Jid, stanza: Stanza) {
        match self.hosts.get_mut(&(from.clone(), to.clone())) {
            Some(HostState::Valid { tx }) => {
                if tx.send(stanza).await.is_err() {
                    self.hosts.remove(&(from, to));
                }
            }
            Some(HostState::Pending { queued, .. }) => queued.push(stanza),
            None => {
                self.hosts.insert(
                    (from.clone(), to.clone()),
                    HostState::Pending {
                        queued: vec![stanza],
                        created: Instant::now(),
                    },
                );
                self.spawn_connection(from, to);
            }
        }
    }

    async fn handle_validated(&mut self, from: Jid, to: Jid, tx: mpsc::Sender<Stanza>) {
        let queued = match self.hosts.remove(&(from.clone(), to.clone())) {
            Some(HostState::Pending { queued, .. }) => queued,
            _ => Vec::new(),
        };

        for stanza in queued {
            if tx.send(stanza).await.is_err() {
                break;
            }
        }

        self.hosts.insert((from, to), HostState::Valid { tx });
    }

    fn sweep_stale_hosts(&mut self) {
        let threshold = self.config.not_yet_valid_sweep_interval;
        self.hosts.retain(|(from, to), state| {
            let stale = matches!(state, HostState::Pending { created, .. } if created.elapsed() > threshold);
            if stale {
                warn!(%from, %to, "dialback host never validated, timing out");
            }
            !stale
        });
    }

    fn spawn_connection(&self, from: Jid, to: Jid) {
        let (stanza_tx, stanza_rx) = mpsc::channel(OUTBOUND_QUEUE_BUFFER_SIZE);
        let (validated_tx, validated_rx) = oneshot::channel();
        let config = self.config.clone();
        let inbound_tx = self.inbound_tx.clone();
        let self_tx = self.self_tx.clone();

        let from_for_connect = from.clone();
        let to_for_connect = to.clone();
        tokio::spawn(async move {
            if let Err(error) = connect_and_serve(
                from_for_connect,
                to_for_connect,
                config,
                stanza_rx,
                inbound_tx,
                validated_tx,
            )
            .await
            {
                warn!(%from, %to, %error, "outbound dialback connection failed");
            }
        });

        tokio::spawn(async move {
            let command = match validated_rx.await {
                Ok(true) => DialbackCommand::Validated {
                    from,
                    to,
                    tx: stanza_tx,
                },
                _ => DialbackCommand::Failed { from, to },
            };
            let _ = self_tx.send(command).await;
        });
    }
}

async fn connect_and_serve(
    from: Jid,
    to: Jid,
    config: DialbackConfig,
    mut stanza_rx: mpsc::Receiver<Stanza>,
    inbound_tx: mpsc::Sender<Element>,
    validated_tx: oneshot::Sender<bool>,
) -> Result<(), Error> {
    let address = format!("{}:{S2S_PORT}", to.domain());
    let stream = TcpStream::connect(&address).await?;
    let (read_half, mut write_half) = split(stream);

    let opening = format!(
        "<stream:stream xmlns:stream='{}' xmlns='jabber:server' xmlns:db='{}' to='{}' from='{}'>",
        namespaces::XMPP_STREAMS,
        namespaces::DIALBACK,
        to.domain(),
        from.domain(),
    );
    write_half.write_all(opening.as_bytes()).await?;
    write_half.flush().await?;

    let mut parser = RustyXmlStreamParser::new(read_half);
    let mut writer = StreamWriter::new(write_half);

    let Some(Ok(Frame::StreamStart(header))) = parser.next().await else {
        bail!("remote server did not open a stream for dialback");
    };
    let stream_id = header
        .id
        .ok_or_else(|| anyhow!("remote server stream header has no id"))?;

    let key = dialback_key(&config.secret, to.domain(), stream_id.as_str());
    let mut result = Element::new("db:result", Some(namespaces::DIALBACK));
    result.set_attribute("db", Some(namespaces::XMLNS), namespaces::DIALBACK);
    result.set_attribute("to", None, to.domain());
    result.set_attribute("from", None, from.domain());
    result.add_text(key);
    writer.write_xml_element(&result).await?;

    let valid = loop {
        let Some(Ok(frame)) = parser.next().await else {
            bail!("connection closed before dialback result arrived");
        };

        let Frame::XmlFragment(element) = frame else {
            continue;
        };

        if element.validate("db:result", Some(namespaces::DIALBACK)) {
            break element.attribute("type", None) == Some("valid");
        }

        warn!("unexpected element while awaiting dialback result, ignoring");
    };

    let _ = validated_tx.send(valid);
    if !valid {
        bail!("remote server rejected our dialback key");
    }

    loop {
        tokio::select! {
            stanza = stanza_rx.recv() => {
                match stanza {
                    Some(stanza) => writer.write_xml_element(&stanza.element).await?,
                    None => return Ok(()),
                }
            }
            frame = parser.next() => {
                match frame {
                    Some(Ok(Frame::XmlFragment(element))) => {
                        if inbound_tx.send(element).await.is_err() {
                            return Ok(());
                        }
                    }
                    _ => return Ok(()),
                }
            }
        }
    }
}

/// Handle to the background task owning every outbound s2s connection
/// for this process, keyed by `(local domain, remote domain)`.
#[derive(Clone)]
pub struct DialbackHandle {
    commands: mpsc::Sender<DialbackCommand>,
}

impl DialbackHandle {
    /// Spawns the dialback table. Stanzas arriving over any validated
    /// outbound connection are forwarded on `inbound_tx` for routing.
    pub fn new(config: DialbackConfig, inbound_tx: mpsc::Sender<Element>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(MANAGEMENT_CHANNEL_BUFFER_SIZE);

        let table = DialbackTable {
            commands: commands_rx,
            self_tx: commands_tx.clone(),
            config,
            inbound_tx,
            hosts: HashMap::new(),
        };

        tokio::spawn(table.run());

        DialbackHandle {
            commands: commands_tx,
        }
    }

    /// Queues `stanza` for delivery from `from` to `to`, connecting (or
    /// reusing an already-validated connection) as needed.
    pub async fn send(&self, from: Jid, to: Jid, stanza: Stanza) -> Result<(), Error> {
        self.commands
            .send(DialbackCommand::Send { from, to, stanza })
            .await
            .map_err(|_| anyhow!("dialback table is gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialback_key_is_forty_lowercase_hex_chars() {
        let key = dialback_key("secret", "to.example.com", "stream-id");
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn dialback_key_is_deterministic_and_context_dependent() {
        let a = dialback_key("secret", "to.example.com", "stream-id");
        let b = dialback_key("secret", "to.example.com", "stream-id");
        assert_eq!(a, b);

        let different_secret = dialback_key("other-secret", "to.example.com", "stream-id");
        let different_to = dialback_key("secret", "other.example.com", "stream-id");
        let different_challenge = dialback_key("secret", "to.example.com", "other-stream-id");

        assert_ne!(a, different_secret);
        assert_ne!(a, different_to);
        assert_ne!(a, different_challenge);
    }

    #[tokio::test]
    async fn unvalidated_peer_is_rejected_unless_legacy_compat_is_set() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        async fn run_probe(legacy_compat: bool) -> (bool, bool) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let own_domain = "b.example.com".parse::<Jid>().unwrap();
            let config = DialbackConfig {
                secret: "secret".to_string(),
                legacy_compat,
                not_yet_valid_sweep_interval: Duration::from_secs(120),
            };
            let (inbound_tx, mut inbound_rx) = mpsc::channel(4);

            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let _ = accept_connection(stream, &own_domain, &config, inbound_tx).await;
            });

            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(
                    b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:server' to='b.example.com' from='a.example.com'>",
                )
                .await
                .unwrap();

            // Drain our own stream root before sending a bare stanza with
            // no prior db:result claim on this connection.
            let mut buf = vec![0u8; 4096];
            let n = client.read(&mut buf).await.unwrap();
            let _opening = String::from_utf8_lossy(&buf[..n]).to_string();

            client
                .write_all(b"<message to='user@b.example.com' from='user@a.example.com'/>")
                .await
                .unwrap();

            let forwarded = tokio::time::timeout(Duration::from_millis(200), inbound_rx.recv())
                .await
                .ok()
                .flatten()
                .is_some();

            let mut buf = vec![0u8; 4096];
            let rejected = match tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buf[..n]).contains("not-authorized"),
                _ => false,
            };

            server.abort();
            (forwarded, rejected)
        }

        let (forwarded, rejected) = run_probe(false).await;
        assert!(!forwarded, "unvalidated stanza must not be forwarded without legacy compat");
        assert!(rejected, "connection must be rejected with a stream error without legacy compat");

        let (forwarded, _rejected) = run_probe(true).await;
        assert!(forwarded, "unvalidated stanza must be forwarded when legacy compat is enabled");
    }

    #[tokio::test]
    async fn verify_with_originating_server_fails_on_unresolvable_domain() {
        // "invalid" is reserved by RFC 2606 to never resolve.
        let from = Jid::new(None, "dialback-test.invalid".to_string(), None);
        let to = "b.example.com".parse::<Jid>().unwrap();

        let result = verify_with_originating_server(&from, &to, "stream-id", "key").await;
        assert!(result.is_err());
    }
}
