use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use confidante_core::utils::recorder::StreamRecorder;
use confidante_core::xmpp::stream::Connection;

/// Wraps a connection so that everything read from and written to it is also
/// appended to `log/<uuid>.in.xml` and `log/<uuid>.out.xml`.
pub struct DebugConnection<C> {
    uuid: Uuid,
    recorder: StreamRecorder<C>,
}

impl<C> DebugConnection<C> {
    pub async fn try_new(inner: C) -> std::io::Result<Self> {
        let uuid = Uuid::new_v4();
        let recorder = StreamRecorder::try_new(inner, uuid).await?;

        Ok(Self { uuid, recorder })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<C> AsyncRead for DebugConnection<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for DebugConnection<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().recorder).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_shutdown(cx)
    }
}

impl<C> Connection for DebugConnection<C>
where
    C: Connection,
{
    type Upgrade = DebugConnectionUpgrade<C>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let uuid = self.uuid;
        let inner = self.recorder.into_inner();

        let upgrade = inner.upgrade()?;

        let inner = Box::pin(async move {
            let connection = upgrade.await?;
            let recorder = StreamRecorder::try_new(connection, uuid).await?;
            Ok(DebugConnection { uuid, recorder })
        });

        Ok(DebugConnectionUpgrade { inner })
    }

    fn is_starttls_allowed(&self) -> bool {
        self.recorder.get_ref().is_starttls_allowed()
    }

    fn is_secure(&self) -> bool {
        self.recorder.get_ref().is_secure()
    }

    fn is_authenticated(&self) -> bool {
        self.recorder.get_ref().is_authenticated()
    }
}

pub struct DebugConnectionUpgrade<C>
where
    C: Connection,
{
    inner: Pin<Box<dyn Future<Output = Result<DebugConnection<C>, Error>> + Send>>,
}

impl<C> Future for DebugConnectionUpgrade<C>
where
    C: Connection,
{
    type Output = Result<DebugConnection<C>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}
