//! The long-lived outbound connection to the session manager: the
//! `jabber:component:accept` handshake, `<route>` framing, and
//! reconnect-with-backoff.

use std::time::Duration;

use anyhow::{anyhow, bail, Error};
use sha1::{Digest, Sha1};
use tokio::io::{split, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use confidante_core::xml::stream_parser::{Frame, StreamParser};
use confidante_core::xml::stream_writer::StreamWriter;
use confidante_core::xml::{namespaces, Element};

const OUTBOUND_CHANNEL_BUFFER_SIZE: usize = 64;

#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// `host:port` of the session manager.
    pub address: String,
    /// Component id this process authenticates as (the `to` of the
    /// outbound stream root, and the `from` of every outbound route).
    pub component_id: String,
    pub shared_secret: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

/// Handle to the background task that owns the SM connection.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<Element>,
}

impl LinkHandle {
    pub fn spawn(config: LinkConfig, inbound: mpsc::Sender<Element>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER_SIZE);

        tokio::spawn(run(config, outbound_rx, inbound));

        Self {
            outbound: outbound_tx,
        }
    }

    pub async fn send(&self, element: Element) -> Result<(), Error> {
        self.outbound
            .send(element)
            .await
            .map_err(|_| anyhow!("router link is gone"))
    }
}

async fn run(
    config: LinkConfig,
    mut outbound_rx: mpsc::Receiver<Element>,
    inbound: mpsc::Sender<Element>,
) {
    let mut pending: Vec<Element> = Vec::new();
    let mut attempt = 0u32;

    loop {
        match connect_and_serve(&config, &mut outbound_rx, &inbound, &mut pending).await {
            Ok(()) => {
                info!("router link closed");
                return;
            }
            Err(err) => {
                warn!(error = %err, attempt, "router link connection failed");
            }
        }

        attempt += 1;
        if attempt > config.reconnect_attempts {
            error!("router link exhausted its reconnect budget, giving up");
            return;
        }

        sleep(config.reconnect_delay).await;
    }
}

fn handshake_digest(stream_id: &str, shared_secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(shared_secret.as_bytes());
    hex::encode(hasher.finalize())
}

async fn connect_and_serve(
    config: &LinkConfig,
    outbound_rx: &mut mpsc::Receiver<Element>,
    inbound: &mpsc::Sender<Element>,
    pending: &mut Vec<Element>,
) -> Result<(), Error> {
    let stream = TcpStream::connect(&config.address).await?;
    let (read_half, mut write_half) = split(stream);

    let opening = format!(
        "<stream:stream xmlns:stream='{}' xmlns='{}' to='{}'>",
        namespaces::XMPP_STREAMS,
        namespaces::COMPONENT_ACCEPT,
        config.component_id,
    );
    write_half.write_all(opening.as_bytes()).await?;
    write_half.flush().await?;

    let mut parser = RustyXmlStreamParser::new(read_half);
    let mut writer = StreamWriter::new(write_half);

    let Some(Ok(Frame::StreamStart(header))) = parser.next().await else {
        bail!("session manager did not send a stream header");
    };
    let stream_id = header
        .id
        .ok_or_else(|| anyhow!("session manager stream header has no id"))?;

    let digest = handshake_digest(stream_id.as_str(), &config.shared_secret);

    let mut handshake = Element::new("handshake", Some(namespaces::COMPONENT_ACCEPT));
    handshake.set_attribute("xmlns", None, namespaces::COMPONENT_ACCEPT);
    handshake.add_text(digest);
    writer.write_xml_element(&handshake).await?;

    let Some(Ok(Frame::XmlFragment(ack))) = parser.next().await else {
        bail!("session manager did not ack the handshake");
    };
    if !ack.validate("handshake", Some(namespaces::COMPONENT_ACCEPT)) {
        bail!("session manager rejected the handshake");
    }

    info!(address = %config.address, "router link established with the session manager");

    for queued in pending.drain(..) {
        writer.write_xml_element(&queued).await?;
    }

    loop {
        tokio::select! {
            maybe_element = outbound_rx.recv() => {
                let Some(element) = maybe_element else {
                    return Ok(());
                };
                if let Err(err) = writer.write_xml_element(&element).await {
                    pending.push(element);
                    return Err(err);
                }
            }
            frame = parser.next() => {
                match frame {
                    Some(Ok(Frame::XmlFragment(element))) => {
                        if inbound.send(element).await.is_err() {
                            bail!("router actor is gone");
                        }
                    }
                    Some(Ok(Frame::StreamStart(_))) => {
                        warn!("session manager restarted its stream root unexpectedly");
                    }
                    Some(Err(err)) => return Err(err),
                    None => bail!("session manager closed the router link"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::handshake_digest;

    #[test]
    fn handshake_digest_is_forty_lowercase_hex_chars() {
        let digest = handshake_digest("some-stream-id", "shared-secret");
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn handshake_digest_is_deterministic_and_key_dependent() {
        assert_eq!(
            handshake_digest("abc", "secret"),
            handshake_digest("abc", "secret")
        );
        assert_ne!(
            handshake_digest("abc", "secret"),
            handshake_digest("abc", "other-secret")
        );
        assert_ne!(
            handshake_digest("abc", "secret"),
            handshake_digest("xyz", "secret")
        );
    }
}
