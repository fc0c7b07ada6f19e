//! The in-process routing table: which locally-terminated connection
//! owns a given JID, keeping stanzas flowing between those connections
//! and the session manager link.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use confidante_core::xml::{namespaces, Element};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream_error::{from_sm_error, StreamError};
use confidante_outbound::dialback::DialbackHandle;

pub mod link;

use link::{LinkConfig, LinkHandle};

const MANAGEMENT_CHANNEL_BUFFER_SIZE: usize = 8;
const STANZA_CHANNEL_BUFFER_SIZE: usize = 8;
const FROM_LINK_CHANNEL_BUFFER_SIZE: usize = 64;

#[derive(Debug)]
pub enum ManagementCommand {
    Register(Jid, mpsc::Sender<Stanza>),
    Unregister(Jid),
}

struct Router {
    stanzas: mpsc::Receiver<Stanza>,
    management: mpsc::Receiver<ManagementCommand>,
    from_link: mpsc::Receiver<Element>,
    from_s2s: mpsc::Receiver<Element>,
    link: LinkHandle,
    dialback: Option<DialbackHandle>,
    component_id: String,
    own_domain: Jid,
    entities: HashMap<Jid, mpsc::Sender<Stanza>>,
}

impl Router {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                stanza = self.stanzas.recv() => {
                    match stanza {
                        Some(stanza) => self.send_to_link(stanza).await,
                        None => break,
                    }
                }
                command = self.management.recv() => {
                    match command {
                        Some(command) => self.handle_management_command(command).await,
                        None => break,
                    }
                }
                routed = self.from_link.recv() => {
                    match routed {
                        Some(element) => self.route_inbound(element).await,
                        None => break,
                    }
                }
                s2s = self.from_s2s.recv() => {
                    match s2s {
                        Some(element) => self.route_from_s2s(element).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn send_to_link(&mut self, stanza: Stanza) {
        let foreign_destination = stanza
            .element
            .attribute("to", None)
            .and_then(|s| s.parse::<Jid>().ok())
            .filter(|to| to.domain() != self.own_domain.domain());

        if let Some(to) = foreign_destination {
            if let Some(dialback) = &self.dialback {
                let from = stanza
                    .element
                    .attribute("from", None)
                    .and_then(|s| s.parse::<Jid>().ok())
                    .unwrap_or_else(|| self.own_domain.clone());

                if dialback.send(from, to, stanza).await.is_err() {
                    warn!("dialback table is gone, dropping outbound s2s stanza");
                }
            } else {
                warn!(%to, "no dialback handle configured, dropping outbound s2s stanza");
            }
            return;
        }

        let mut route = Element::new("route", Some(namespaces::COMPONENT_ACCEPT));
        route.set_attribute("xmlns", None, namespaces::COMPONENT_ACCEPT);
        route.set_attribute("from", None, self.component_id.clone());
        route.add_child(stanza.element);

        if self.link.send(route).await.is_err() {
            warn!("router link is gone, dropping outbound stanza");
        }
    }

    /// A stanza a remote server delivered to us over s2s, received raw
    /// (not wrapped in a `<route>`) straight from `dialback::accept_connection`
    /// or an outbound-verified connection. It's handed to the session
    /// manager the same way a locally-originated stanza would be, since
    /// the session manager is the only party that knows which bound
    /// resource a bare-JID stanza should land on.
    async fn route_from_s2s(&mut self, element: Element) {
        let mut route = Element::new("route", Some(namespaces::COMPONENT_ACCEPT));
        route.set_attribute("xmlns", None, namespaces::COMPONENT_ACCEPT);
        route.set_attribute("from", None, self.component_id.clone());
        route.add_child(element);

        if self.link.send(route).await.is_err() {
            warn!("router link is gone, dropping inbound s2s stanza");
        }
    }

    async fn handle_management_command(&mut self, command: ManagementCommand) {
        match command {
            ManagementCommand::Register(jid, tx) => {
                debug!(%jid, "registering local entity");

                let mut session_start = Element::new("sc:session", Some(namespaces::SESSION_CONTROL));
                session_start.set_attribute("sc", Some(namespaces::XMLNS), namespaces::SESSION_CONTROL);
                session_start.set_attribute("action", None, "start");
                session_start.set_attribute("target", None, jid.to_string());

                let mut route = Element::new("route", Some(namespaces::COMPONENT_ACCEPT));
                route.set_attribute("xmlns", None, namespaces::COMPONENT_ACCEPT);
                route.set_attribute("from", None, self.component_id.clone());
                route.add_child(session_start);

                if self.link.send(route).await.is_err() {
                    warn!(%jid, "router link is gone, could not start session");
                }

                self.entities.insert(jid, tx);
            }
            ManagementCommand::Unregister(jid) => {
                debug!(%jid, "unregistering local entity");
                self.entities.remove(&jid);

                let mut session_end = Element::new("sc:session", Some(namespaces::SESSION_CONTROL));
                session_end.set_attribute("sc", Some(namespaces::XMLNS), namespaces::SESSION_CONTROL);
                session_end.set_attribute("action", None, "end");
                session_end.set_attribute("target", None, jid.to_string());

                let mut route = Element::new("route", Some(namespaces::COMPONENT_ACCEPT));
                route.set_attribute("xmlns", None, namespaces::COMPONENT_ACCEPT);
                route.set_attribute("from", None, self.component_id.clone());
                route.add_child(session_end);

                if self.link.send(route).await.is_err() {
                    warn!(%jid, "router link is gone, could not end session");
                }
            }
        }
    }

    async fn route_inbound(&mut self, element: Element) {
        if element.validate("sc:session", Some(namespaces::SESSION_CONTROL)) {
            self.handle_session_control(element).await;
            return;
        }

        if !element.validate("route", Some(namespaces::COMPONENT_ACCEPT)) {
            warn!("discarding non-route element received from the session manager");
            return;
        }

        let Some(to) = element
            .attribute("to", None)
            .and_then(|s| s.parse::<Jid>().ok())
        else {
            warn!("route element from session manager is missing a valid `to` address");
            return;
        };

        if element.attribute("type", None) == Some("error") {
            let reason = element.attribute("error", None).unwrap_or("unknown");
            self.fail_entity(&to, from_sm_error(reason, false)).await;
            return;
        }

        let Some(tx) = self.entities.get(&to) else {
            debug!(%to, "no local entity for routed stanza, dropping");
            return;
        };

        for stanza in element.into_children() {
            if tx.send(Stanza::new(stanza)).await.is_err() {
                debug!(%to, "local entity is gone, dropping routed stanza");
                return;
            }
        }
    }

    /// The session manager reports a session it tore down on its end
    /// (e.g. it lost its own connection to a resource, or killed one for
    /// policy reasons) via `action='end'`; the owning local connection
    /// needs to hear about that so it can close instead of sitting idle
    /// on a session the session manager no longer tracks.
    async fn handle_session_control(&mut self, element: Element) {
        if element.attribute("action", None) != Some("end") {
            return;
        }

        let Some(target) = element
            .attribute("target", None)
            .and_then(|s| s.parse::<Jid>().ok())
        else {
            warn!("sc:session end from session manager is missing a valid target");
            return;
        };

        let reason = element.attribute("reason", None).unwrap_or("Disconnected");
        self.fail_entity(&target, from_sm_error(reason, true)).await;
    }

    async fn fail_entity(&mut self, jid: &Jid, error: StreamError) {
        let Some(tx) = self.entities.get(jid) else {
            debug!(%jid, "no local entity to notify of session failure");
            return;
        };

        if tx.send(Stanza::new(error.to_element())).await.is_err() {
            debug!(%jid, "local entity is gone, dropping session failure notice");
            self.entities.remove(jid);
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub sm_address: String,
    pub component_id: String,
    pub shared_secret: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub own_domain: Jid,
}

#[derive(Clone)]
pub struct RouterHandle {
    pub stanzas: mpsc::Sender<Stanza>,
    pub management: mpsc::Sender<ManagementCommand>,
}

impl RouterHandle {
    /// `dialback` is `None` when s2s federation is disabled; outbound
    /// stanzas addressed to a foreign domain are then dropped rather
    /// than queued with nowhere to go. `from_s2s` feeds in stanzas
    /// accepted over s2s (see `confidante-outbound::dialback`), which
    /// this router forwards to the session manager link exactly like a
    /// locally-originated stanza.
    pub fn new(
        settings: RouterSettings,
        dialback: Option<DialbackHandle>,
        from_s2s: mpsc::Receiver<Element>,
    ) -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);
        let (management_tx, management_rx) = mpsc::channel(MANAGEMENT_CHANNEL_BUFFER_SIZE);
        let (from_link_tx, from_link_rx) = mpsc::channel(FROM_LINK_CHANNEL_BUFFER_SIZE);

        let link = LinkHandle::spawn(
            LinkConfig {
                address: settings.sm_address,
                component_id: settings.component_id.clone(),
                shared_secret: settings.shared_secret,
                reconnect_attempts: settings.reconnect_attempts,
                reconnect_delay: settings.reconnect_delay,
            },
            from_link_tx,
        );

        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            from_link: from_link_rx,
            from_s2s,
            link,
            dialback,
            component_id: settings.component_id,
            own_domain: settings.own_domain,
            entities: HashMap::new(),
        };

        tokio::spawn(async move {
            router.run().await;
        });

        RouterHandle {
            stanzas: stanzas_tx,
            management: management_tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confidante_core::xml::Element;

    #[tokio::test]
    async fn unregistered_entity_drops_routed_stanza_without_panicking() {
        let (_from_link_tx, from_link_rx) = mpsc::channel(1);
        let (_stanzas_tx, stanzas_rx) = mpsc::channel(1);
        let (_management_tx, management_rx) = mpsc::channel(1);
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let (_from_s2s_tx, from_s2s_rx) = mpsc::channel(1);

        let link = LinkHandle::spawn(
            LinkConfig {
                address: "127.0.0.1:0".to_string(),
                component_id: "c2s.example.com".to_string(),
                shared_secret: "secret".to_string(),
                reconnect_attempts: 0,
                reconnect_delay: Duration::from_millis(1),
            },
            inbound_tx,
        );

        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            from_link: from_link_rx,
            from_s2s: from_s2s_rx,
            link,
            dialback: None,
            component_id: "c2s.example.com".to_string(),
            own_domain: "example.com".parse().unwrap(),
            entities: HashMap::new(),
        };

        let mut route = Element::new("route", Some(namespaces::COMPONENT_ACCEPT));
        route.set_attribute("to", None, "nobody@example.com");
        router.route_inbound(route).await;
    }

    #[tokio::test]
    async fn session_control_end_notifies_the_local_entity_with_a_stream_error() {
        let (_from_link_tx, from_link_rx) = mpsc::channel(1);
        let (_stanzas_tx, stanzas_rx) = mpsc::channel(1);
        let (_management_tx, management_rx) = mpsc::channel(1);
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let (_from_s2s_tx, from_s2s_rx) = mpsc::channel(1);

        let link = LinkHandle::spawn(
            LinkConfig {
                address: "127.0.0.1:0".to_string(),
                component_id: "c2s.example.com".to_string(),
                shared_secret: "secret".to_string(),
                reconnect_attempts: 0,
                reconnect_delay: Duration::from_millis(1),
            },
            inbound_tx,
        );

        let (entity_tx, mut entity_rx) = mpsc::channel(1);
        let target: Jid = "juliet@example.com/balcony".parse().unwrap();

        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            from_link: from_link_rx,
            from_s2s: from_s2s_rx,
            link,
            dialback: None,
            component_id: "c2s.example.com".to_string(),
            own_domain: "example.com".parse().unwrap(),
            entities: HashMap::from([(target.clone(), entity_tx)]),
        };

        let mut session_end = Element::new("sc:session", Some(namespaces::SESSION_CONTROL));
        session_end.set_attribute("action", None, "end");
        session_end.set_attribute("target", None, target.to_string());
        router.route_inbound(session_end).await;

        let notice = entity_rx.try_recv().expect("entity should be notified");
        assert!(notice.element.validate("error", Some(namespaces::XMPP_STREAMS)));
    }
}
