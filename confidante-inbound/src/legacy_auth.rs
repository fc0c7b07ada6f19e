//! Legacy (pre-XMPP-1.0) authentication, `jabber:iq:auth` (XEP-0078).
//!
//! Grounded on `jabberd14`'s `mod_auth_plain.c`: clients that never
//! declare `version='1.0'` skip SASL/bind entirely and authenticate by
//! sending a plaintext username/password inside an `iq`. Digest auth
//! (the `<digest/>` form, SHA1 over `stream_id + password`) isn't
//! offered since passwords are stored as Argon2 hashes rather than
//! plaintext, so there's no secret to hash on the server side.

use anyhow::{bail, Error};
use argon2::{password_hash::PasswordVerifier, Argon2};
use tokio::io::ReadHalf;

use confidante_core::xml::{namespaces, Element};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stream::{Connection, XmppStream};
use confidante_core::xml::stream_parser::StreamParser;

use crate::sasl::{StoredPasswordArgon2, StoredPasswordLookup};

pub(super) struct LegacyAuthNegotiator {
    _private: (),
}

impl LegacyAuthNegotiator {
    /// Handles one `jabber:iq:auth` request: a `type='get'` form request,
    /// or a `type='set'` credential submission. Returns the bound JID on
    /// successful authentication, `None` for a form request or any
    /// non-matching element, and propagates malformed-request errors.
    pub async fn negotiate_feature<C, P, S>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        domain: &str,
        store: S,
    ) -> Result<Option<Jid>, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
        S: StoredPasswordLookup + Send + Sync,
    {
        let Some(query) = element.find_child("query", Some(namespaces::IQ_AUTH)) else {
            bail!("expected a jabber:iq:auth query");
        };

        let Some(request_id) = element.attribute("id", None) else {
            bail!("jabber:iq:auth IQ is missing an id");
        };

        match element.attribute("type", None) {
            Some("get") => {
                Self::send_form(stream, request_id).await?;
                Ok(None)
            }
            Some("set") => {
                Self::authenticate(stream, request_id, query, domain, store).await
            }
            _ => bail!("jabber:iq:auth IQ has an unexpected type"),
        }
    }

    async fn send_form<C, P>(
        stream: &mut XmppStream<C, P>,
        request_id: &str,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id.to_string());
        response.set_attribute("type", None, "result");
        response.with_child("query", Some(namespaces::IQ_AUTH), |query| {
            query.set_attribute("xmlns", None, namespaces::IQ_AUTH);
            query.add_child(Element::new("username", None));
            query.add_child(Element::new("password", None));
            query.add_child(Element::new("resource", None));
        });

        stream.writer().write_xml_element(&response).await
    }

    async fn authenticate<C, P, S>(
        stream: &mut XmppStream<C, P>,
        request_id: &str,
        query: &Element,
        domain: &str,
        store: S,
    ) -> Result<Option<Jid>, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
        S: StoredPasswordLookup + Send + Sync,
    {
        let Some(username) = query
            .find_child("username", Some(namespaces::IQ_AUTH))
            .map(|e| e.text())
        else {
            bail!("jabber:iq:auth set is missing username");
        };
        let Some(password) = query
            .find_child("password", Some(namespaces::IQ_AUTH))
            .map(|e| e.text())
        else {
            bail!("jabber:iq:auth set is missing password");
        };
        let resource = query
            .find_child("resource", Some(namespaces::IQ_AUTH))
            .map(|e| e.text())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let jid = Jid::new(Some(username), domain.to_string(), None);

        let authenticated = store
            .get_stored_password_argon2(jid.clone())
            .await
            .ok()
            .and_then(|stored| stored.parse::<StoredPasswordArgon2>().ok())
            .is_some_and(|stored| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &stored.hash.password_hash())
                    .is_ok()
            });

        if !authenticated {
            Self::send_not_authorized(stream, request_id).await?;
            return Ok(None);
        }

        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id.to_string());
        response.set_attribute("type", None, "result");
        stream.writer().write_xml_element(&response).await?;

        Ok(Some(jid.bind(resource)))
    }

    async fn send_not_authorized<C, P>(
        stream: &mut XmppStream<C, P>,
        request_id: &str,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id.to_string());
        response.set_attribute("type", None, "error");
        response.with_child("error", None, |error| {
            error.set_attribute("type", None, "auth");
            error.set_attribute("code", None, "401");
            error.with_child("not-authorized", Some(namespaces::XMPP_STANZA_ERRORS), |el| {
                el.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
            });
        });

        stream.writer().write_xml_element(&response).await
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

    use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;

    use crate::sasl::StoredPassword;

    use super::*;

    struct TestConnection(DuplexStream);

    impl AsyncRead for TestConnection {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TestConnection {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl Connection for TestConnection {
        type Upgrade = std::future::Ready<Result<Self, Error>>;

        fn upgrade(self) -> Result<Self::Upgrade, Error> {
            bail!("TLS upgrade is not supported in tests")
        }

        fn is_starttls_allowed(&self) -> bool {
            false
        }

        fn is_secure(&self) -> bool {
            true
        }

        fn is_authenticated(&self) -> bool {
            false
        }
    }

    #[derive(Clone, Debug, Default)]
    struct FakeStore {
        password: Option<String>,
    }

    impl StoredPasswordLookup for FakeStore {
        fn get_stored_password_argon2(
            &self,
            _jid: Jid,
        ) -> impl Future<Output = Result<String, Error>> + Send {
            let password = self.password.clone();
            async move { password.ok_or_else(|| anyhow::anyhow!("no such user")) }
        }

        fn get_stored_password_scram_sha1(
            &self,
            _jid: Jid,
        ) -> impl Future<Output = Result<String, Error>> + Send {
            async move { bail!("not used by legacy auth") }
        }

        fn get_stored_password_scram_sha256(
            &self,
            _jid: Jid,
        ) -> impl Future<Output = Result<String, Error>> + Send {
            async move { bail!("not used by legacy auth") }
        }
    }

    fn test_stream() -> (XmppStream<TestConnection, RustyXmlStreamParser<ReadHalf<TestConnection>>>, DuplexStream) {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let stream = XmppStream::new(TestConnection(server_io));
        (stream, client_io)
    }

    fn auth_request(kind: &str, id: &str) -> Element {
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None, id.to_string());
        element.set_attribute("type", None, kind.to_string());
        element.with_child("query", Some(namespaces::IQ_AUTH), |_| {});
        element
    }

    fn auth_submission(id: &str, username: &str, password: &str, resource: Option<&str>) -> Element {
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None, id.to_string());
        element.set_attribute("type", None, "set");
        element.with_child("query", Some(namespaces::IQ_AUTH), |query| {
            query.with_child("username", Some(namespaces::IQ_AUTH), |el| {
                el.add_text(username.to_string())
            });
            query.with_child("password", Some(namespaces::IQ_AUTH), |el| {
                el.add_text(password.to_string())
            });
            if let Some(resource) = resource {
                query.with_child("resource", Some(namespaces::IQ_AUTH), |el| {
                    el.add_text(resource.to_string())
                });
            }
        });
        element
    }

    async fn read_response(client_io: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(std::time::Duration::from_millis(200), client_io.read(&mut buf))
            .await
            .expect("response was not written in time")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn get_request_returns_a_credential_form() {
        let (mut stream, mut client_io) = test_stream();
        let request = auth_request("get", "auth1");

        let result = LegacyAuthNegotiator::negotiate_feature(
            &mut stream,
            &request,
            "example.com",
            FakeStore::default(),
        )
        .await
        .unwrap();

        assert!(result.is_none());
        let response = read_response(&mut client_io).await;
        assert!(response.contains("jabber:iq:auth"));
        assert!(response.contains("username"));
        assert!(response.contains("password"));
        assert!(response.contains("resource"));
    }

    #[tokio::test]
    async fn correct_credentials_bind_a_jid() {
        let (mut stream, mut client_io) = test_stream();
        let store = FakeStore {
            password: Some(StoredPasswordArgon2::new("secret").unwrap().to_string()),
        };
        let request = auth_submission("auth2", "romeo", "secret", Some("balcony"));

        let result = LegacyAuthNegotiator::negotiate_feature(&mut stream, &request, "example.com", store)
            .await
            .unwrap();

        let jid = result.expect("credentials should have authenticated");
        assert_eq!(jid.local(), Some("romeo"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("balcony"));

        let response = read_response(&mut client_io).await;
        assert!(response.contains(r#"type="result""#));
    }

    #[tokio::test]
    async fn incorrect_password_is_rejected() {
        let (mut stream, mut client_io) = test_stream();
        let store = FakeStore {
            password: Some(StoredPasswordArgon2::new("secret").unwrap().to_string()),
        };
        let request = auth_submission("auth3", "romeo", "wrong", None);

        let result = LegacyAuthNegotiator::negotiate_feature(&mut stream, &request, "example.com", store)
            .await
            .unwrap();

        assert!(result.is_none());
        let response = read_response(&mut client_io).await;
        assert!(response.contains("not-authorized"));
    }

    #[tokio::test]
    async fn missing_query_is_rejected() {
        let (mut stream, _client_io) = test_stream();
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None, "auth4");
        element.set_attribute("type", None, "get");

        let result = LegacyAuthNegotiator::negotiate_feature(
            &mut stream,
            &element,
            "example.com",
            FakeStore::default(),
        )
        .await;

        assert!(result.is_err());
    }
}
