use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Error, anyhow, bail};
use sasl::StoredPasswordLookup;
use tokio::io::ReadHalf;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::interval;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use confidante_core::karma::{self, Karma, KarmaConfig};
use confidante_core::xml::namespaces;
use confidante_core::xml::stream_parser::StreamParser;
use confidante_core::xml::{Element, stream_parser::Frame};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream::Connection;
use confidante_core::xmpp::stream::XmppStream;
use confidante_core::xmpp::stream_error::StreamError;
use confidante_core::xmpp::stream_header::LanguageTag;
use confidante_core::xmpp::stream_header::StreamHeader;
use confidante_core::xmpp::stream_header::StreamId;
use confidante_core::xmpp::stream_header::StreamVersion;
use confidante_services::router::ManagementCommand;
use confidante_services::router::RouterHandle;

use self::sasl::SaslNegotiator;
use bind::ResourceBindingNegotiator;
use legacy_auth::LegacyAuthNegotiator;
use starttls::StarttlsNegotiator;

mod bind;
pub mod connection;
mod legacy_auth;
pub mod sasl;
mod starttls;

const STANZA_CHANNEL_BUFFER_SIZE: usize = 8;

#[derive(Clone, Copy)]
pub enum ConnectionType {
    Client,
    Server,
}

#[derive(Debug, Hash, Eq, PartialEq)]
enum StreamFeatures {
    Tls,
    Authentication,
    ResourceBinding,
}

struct StreamInfo {
    stream_id: StreamId,
    jid: Option<Jid>,
    peer_jid: Option<Jid>,
    peer_language: Option<LanguageTag>,
    connection_type: Option<ConnectionType>,
    version: Option<StreamVersion>,
    features: HashSet<StreamFeatures>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        StreamInfo {
            stream_id: StreamId::new(),
            jid: None,
            peer_jid: None,
            peer_language: None,
            connection_type: None,
            version: None,
            features: HashSet::new(),
        }
    }
}

pub struct InboundStreamSettings {
    pub connection_type: ConnectionType,
    pub domain: Jid,
    pub tls_required: bool,
    pub karma: KarmaConfig,
    pub auth_timeout: Duration,
    pub idle_ping_interval: Duration,
}

pub struct InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    stream: XmppStream<C, P>,
    info: StreamInfo,
    router: RouterHandle,
    stanza_tx: Sender<Stanza>,
    stanza_rx: Receiver<Stanza>,
    store: S,
    karma: Karma,
    shutdown: broadcast::Receiver<()>,
    settings: InboundStreamSettings,
}

impl<C, P, S> InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(
        connection: C,
        router: RouterHandle,
        store: S,
        settings: InboundStreamSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let stream = XmppStream::new(connection);
        let info = StreamInfo::default();
        let (stanza_tx, stanza_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);
        let karma = Karma::new(settings.karma);

        InboundStream {
            stream,
            info,
            router,
            stanza_tx,
            stanza_rx,
            store,
            karma,
            shutdown,
            settings,
        }
    }

    pub async fn handle(&mut self) {
        let result = self.inner_handle().await;

        self.bounce_pending_stanzas().await;
        self.unregister_peer().await;

        if let Err(error) = result {
            let _ = self.handle_unrecoverable_error(error).await;
        }
    }

    async fn bounce_pending_stanzas(&mut self) {
        while let Ok(Stanza { mut element }) = self.stanza_rx.try_recv() {
            element.set_attribute("type", None, "error");
            if self
                .router
                .stanzas
                .send(Stanza { element })
                .await
                .is_err()
            {
                break;
            }
        }
    }

    async fn unregister_peer(&mut self) {
        if let Some(entity) = self.info.peer_jid.take()
            && self
                .router
                .management
                .send(ManagementCommand::Unregister(entity))
                .await
                .is_err()
        {
            warn!("router is gone, could not unregister entity on close");
        }
    }

    async fn inner_handle(&mut self) -> Result<(), Error> {
        self.exchange_stream_headers().await?;
        self.advertise_features().await?;

        let mut karma_tick = interval(karma::HEARTBEAT);
        let mut idle_ping = interval(self.settings.idle_ping_interval);
        let mut auth_timeout = interval(self.settings.auth_timeout);
        karma_tick.tick().await;
        idle_ping.tick().await;
        auth_timeout.tick().await;

        loop {
            select! {
                frame = self.stream.reader().next(), if self.karma.is_readable() => {
                    match frame {
                        Some(Ok(Frame::XmlFragment(element))) => {
                            self.karma.record_read(element.approximate_wire_size());
                            self.process_element(element).await?
                        }
                        _ => {
                            // assume peer terminated stream
                            let _ = self.stream.writer().write_stream_close().await;
                            return Ok(());
                        }
                    }
                }
                Some(Stanza { element }) = self.stanza_rx.recv() => {
                    let is_stream_error = element.validate("error", Some(namespaces::XMPP_STREAMS));
                    self.stream.writer().write_xml_element(&element).await?;
                    if is_stream_error {
                        let _ = self.stream.writer().write_stream_close().await;
                        return Ok(());
                    }
                }
                _ = karma_tick.tick() => {
                    self.karma.tick();
                }
                _ = idle_ping.tick() => {
                    let _ = self.stream.writer().write_whitespace_keepalive().await;
                }
                _ = auth_timeout.tick() => {
                    if !self.info.features.contains(&StreamFeatures::Authentication) {
                        self.close_with_stream_error(StreamError::ConnectionTimeout).await?;
                        return Ok(());
                    }
                }
                _ = self.shutdown.recv() => {
                    self.close_with_stream_error(StreamError::SystemShutdown).await?;
                    return Ok(());
                }
            }
        }
    }

    fn is_modern_stream(&self) -> bool {
        self.info.version.as_ref().is_some_and(StreamVersion::is_modern)
    }

    fn is_legacy_auth_candidate(&self, element: &Element) -> bool {
        matches!(self.info.connection_type, Some(ConnectionType::Client))
            && !self.is_modern_stream()
            && !self.info.features.contains(&StreamFeatures::Authentication)
            && element.validate("iq", Some(namespaces::XMPP_CLIENT))
            && element.find_child("query", Some(namespaces::IQ_AUTH)).is_some()
    }

    async fn handle_legacy_auth(&mut self, element: Element) -> Result<(), Error> {
        match LegacyAuthNegotiator::negotiate_feature(
            &mut self.stream,
            &element,
            self.settings.domain.domain(),
            self.store.clone(),
        )
        .await
        {
            Ok(Some(jid)) => {
                debug!(%jid, "authenticated peer via legacy iq:auth");
                self.info.features.insert(StreamFeatures::Authentication);
                self.info.features.insert(StreamFeatures::ResourceBinding);
                self.register_peer_jid(Some(jid)).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                debug!(%error, "legacy authentication attempt failed");
                Ok(())
            }
        }
    }

    fn is_session_establishment(&self, element: &Element) -> bool {
        element.validate("iq", Some(namespaces::XMPP_CLIENT))
            && element.attribute("type", None) == Some("set")
            && element
                .find_child("session", Some(namespaces::XMPP_SESSION))
                .is_some()
    }

    async fn answer_session_establishment(&mut self, element: &Element) -> Result<(), Error> {
        let Some(request_id) = element.attribute("id", None) else {
            bail!("session establishment IQ is missing an id");
        };

        // The session manager already saw `sc:session action=start` when
        // the resource was bound (see `register_peer_jid`); this reply is
        // answered locally rather than round-tripped through
        // `action=started`, since there's no request/response channel for
        // that confirmation between the router and the session manager.
        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id.to_string());
        response.set_attribute("type", None, "result");

        self.stream.writer().write_xml_element(&response).await
    }

    async fn process_element(&mut self, element: Element) -> Result<(), Error> {
        if self.is_legacy_auth_candidate(&element) {
            return self.handle_legacy_auth(element).await;
        }

        for feature in self.negotiable_features() {
            match self.negotiate_feature(feature, &element).await {
                Ok(()) => return Ok(()),
                Err(err) => debug!(error = %err, "feature negotiation attempt did not match"),
            }
        }

        if self.is_session_establishment(&element) {
            return self.answer_session_establishment(&element).await;
        }

        // element must be a stanza at this point
        self.router
            .stanzas
            .send(Stanza { element })
            .await
            .map_err(|_| anyhow!("failed to route stanza"))
    }

    fn negotiable_features(&self) -> Vec<StreamFeatures> {
        let mut features = vec![];

        if !self.is_modern_stream() {
            return features;
        }

        if self.stream.is_starttls_allowed() && !self.info.features.contains(&StreamFeatures::Tls) {
            features.push(StreamFeatures::Tls);
        }

        if (!self.settings.tls_required || self.info.features.contains(&StreamFeatures::Tls))
            && !self.info.features.contains(&StreamFeatures::Authentication)
        {
            features.push(StreamFeatures::Authentication);
        }

        if let Some(ConnectionType::Client) = self.info.connection_type
            && self.info.features.contains(&StreamFeatures::Authentication)
            && !self
                .info
                .features
                .contains(&StreamFeatures::ResourceBinding)
        {
            features.push(StreamFeatures::ResourceBinding);
        }

        features
    }

    async fn negotiate_feature(
        &mut self,
        feature: StreamFeatures,
        element: &Element,
    ) -> Result<(), Error> {
        match feature {
            StreamFeatures::Tls => {
                StarttlsNegotiator::negotiate_feature(&mut self.stream, element).await?;
                self.info.features.insert(StreamFeatures::Tls);
                self.stream.reset();
                self.exchange_stream_headers().await?;
                self.advertise_features().await?;
            }
            StreamFeatures::Authentication => {
                let peer_jid = Some(
                    SaslNegotiator::negotiate_feature(
                        &mut self.stream,
                        element,
                        self.store.clone(),
                    )
                    .await?,
                );
                debug!(?peer_jid, "authenticated peer");
                self.register_peer_jid(peer_jid).await;
                self.info.features.insert(StreamFeatures::Authentication);
                self.stream.reset();
                self.exchange_stream_headers().await?;
                self.advertise_features().await?;
            }
            StreamFeatures::ResourceBinding => {
                let peer_jid = Some(
                    ResourceBindingNegotiator::negotiate_feature(
                        &mut self.stream,
                        element,
                        &self.info.peer_jid,
                    )
                    .await?,
                );
                self.register_peer_jid(peer_jid).await;
                self.info.features.insert(StreamFeatures::ResourceBinding);
            }
        }

        Ok(())
    }

    async fn register_peer_jid(&mut self, peer_jid: Option<Jid>) {
        if let Some(entity) = self.info.peer_jid.take()
            && self
                .router
                .management
                .send(ManagementCommand::Unregister(entity))
                .await
                .is_err()
        {
            warn!("router is gone, could not unregister previous entity");
        }

        self.info.peer_jid = peer_jid;

        if let Some(entity) = self.info.peer_jid.clone()
            && self
                .router
                .management
                .send(ManagementCommand::Register(entity, self.stanza_tx.clone()))
                .await
                .is_err()
        {
            warn!("router is gone, could not register entity");
        }
    }

    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        for feature in self.negotiable_features() {
            let feature = match feature {
                StreamFeatures::Tls => StarttlsNegotiator::advertise_feature(),
                StreamFeatures::Authentication => SaslNegotiator::advertise_feature(
                    self.stream.is_secure(),
                    self.stream.is_authenticated(),
                ),
                StreamFeatures::ResourceBinding => ResourceBindingNegotiator::advertise_feature(),
            };
            features.add_child(feature);
        }

        self.stream.writer().write_xml_element(&features).await
    }

    async fn exchange_stream_headers(&mut self) -> Result<(), Error> {
        let Ok(frame) = self
            .stream
            .reader()
            .next()
            .await
            .ok_or(anyhow!("stream closed by peer"))?
        else {
            self.send_stream_header(None).await?;
            self.handle_unrecoverable_error(anyhow!("expected xml frame"))
                .await?;
            bail!("expected xml frame");
        };

        let Frame::StreamStart(inbound_header) = frame else {
            self.send_stream_header(None).await?;
            self.handle_unrecoverable_error(anyhow!("expected stream header"))
                .await?;
            bail!("expected stream header");
        };

        if inbound_header.to.is_none() {
            self.send_stream_header(None).await?;
            self.close_with_stream_error(StreamError::HostUnknown).await?;
            bail!("stream root is missing the mandatory `to` attribute");
        }

        if inbound_header
            .to
            .as_ref()
            .is_some_and(|to| to.domain() != self.settings.domain.domain())
        {
            self.send_stream_header(None).await?;
            self.close_with_stream_error(StreamError::HostUnknown).await?;
            bail!("stream root addressed an unknown host");
        }

        let expected_namespace = match self.settings.connection_type {
            ConnectionType::Client => namespaces::XMPP_CLIENT,
            ConnectionType::Server => namespaces::XMPP_SERVER,
        };
        if inbound_header.default_namespace.as_deref() != Some(expected_namespace) {
            self.send_stream_header(None).await?;
            self.close_with_stream_error(StreamError::InvalidNamespace)
                .await?;
            bail!("stream root declared an unexpected default namespace");
        }

        self.info.jid = inbound_header.to;
        self.info.peer_language = inbound_header.language;
        self.info.version = inbound_header.version;
        self.info.connection_type = Some(self.settings.connection_type);

        self.send_stream_header(self.info.peer_jid.clone()).await
    }

    async fn send_stream_header(&mut self, to: Option<Jid>) -> Result<(), Error> {
        let default_namespace = match self.settings.connection_type {
            ConnectionType::Client => namespaces::XMPP_CLIENT,
            ConnectionType::Server => namespaces::XMPP_SERVER,
        };
        let outbound_header = StreamHeader {
            from: Some(self.settings.domain.clone()),
            to,
            id: Some(self.info.stream_id.clone()),
            language: None,
            version: Some(StreamVersion::V1_0),
            default_namespace: Some(default_namespace.to_string()),
        };

        self.stream
            .writer()
            .write_stream_header(&outbound_header, true)
            .await
    }

    async fn handle_unrecoverable_error(&mut self, error: Error) -> Result<(), Error> {
        warn!(%error, "closing stream after unrecoverable error");
        self.close_with_stream_error(StreamError::InternalServerError)
            .await
    }

    async fn close_with_stream_error(&mut self, error: StreamError) -> Result<(), Error> {
        self.stream.writer().write_xml_element(&error.to_element()).await?;
        self.stream.writer().write_stream_close().await
    }
}
