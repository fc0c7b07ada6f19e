use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

use confidante_core::xmpp::stream::Connection;

enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A plain or TLS-wrapped TCP connection.
///
/// Built with a pre-built [`ServerConfig`] so that STARTTLS doesn't have to
/// reload certificates and rebuild the client-cert verifier on every upgrade.
pub struct TcpConnection {
    socket: Socket,
    tls_config: Arc<ServerConfig>,
    starttls_allowed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, tls_config: Arc<ServerConfig>, starttls_allowed: bool) -> Self {
        Self {
            socket: Socket::Plain(stream),
            tls_config,
            starttls_allowed,
        }
    }

    pub fn new_tls(stream: TlsStream<TcpStream>, tls_config: Arc<ServerConfig>) -> Self {
        Self {
            socket: Socket::Tls(Box::new(stream)),
            tls_config,
            starttls_allowed: false,
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match &self.socket {
            Socket::Plain(stream) => stream.peer_addr(),
            Socket::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = TcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let Socket::Plain(stream) = self.socket else {
            anyhow::bail!("connection is already using TLS");
        };

        let acceptor = TlsAcceptor::from(self.tls_config.clone());

        Ok(TcpConnectionUpgrade {
            accept: acceptor.accept(stream),
            tls_config: self.tls_config,
        })
    }

    fn is_starttls_allowed(&self) -> bool {
        self.starttls_allowed && matches!(self.socket, Socket::Plain(_))
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket, Socket::Tls(_))
    }

    fn is_authenticated(&self) -> bool {
        match &self.socket {
            Socket::Plain(_) => false,
            Socket::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty()),
        }
    }
}

pub struct TcpConnectionUpgrade {
    accept: Accept<TcpStream>,
    tls_config: Arc<ServerConfig>,
}

impl Future for TcpConnectionUpgrade {
    type Output = Result<TcpConnection, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.accept).poll(cx) {
            Poll::Ready(Ok(stream)) => {
                Poll::Ready(Ok(TcpConnection::new_tls(stream, this.tls_config.clone())))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
