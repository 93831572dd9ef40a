//! Abstractions over different socket types of crates in the Rust ecosystem.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_tls::client::TlsStream as TlsStreamCli;
use async_tls::server::TlsStream as TlsStreamSrv;
use futures::io::{AsyncRead, AsyncWrite};

use crate::hub::error::*;

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_async_std_tcp")]
mod async_std_tcp;

#[cfg(feature = "socket_tokio_tcp")]
use self::tokio_tcp as socket_impl;

#[cfg(feature = "socket_async_std_tcp")]
use self::async_std_tcp as socket_impl;

/// A `Listener` represents a socket listening on new communications
/// initiated by peer nodes.
pub struct Listener {
    inner: socket_impl::Listener,
}

/// A `Socket` represents a connection between two peer processes
/// in the network.
pub struct Socket {
    inner: socket_impl::Socket,
}

/// Initialize the sockets module.
pub(crate) unsafe fn init() -> Result<()> {
    socket_impl::init()?;
    Ok(())
}

/// Drops the global data associated with sockets.
pub(crate) unsafe fn drop() -> Result<()> {
    socket_impl::drop()?;
    Ok(())
}

/// Creates a new `Listener` socket, bound to the address `addr`.
pub async fn bind<A: Into<SocketAddr>>(addr: A) -> Result<Listener> {
    let inner = socket_impl::bind(addr.into())
        .await
        .wrapped(ErrorKind::Communication)?;
    Ok(Listener { inner })
}

/// Connects to the remote node pointed to by the address `addr`.
pub async fn connect<A: Into<SocketAddr>>(addr: A) -> Result<Socket> {
    let inner = socket_impl::connect(addr.into())
        .await
        .wrapped(ErrorKind::Communication)?;
    Ok(Socket { inner })
}

impl Listener {
    /// Accepts a new connection, yielding the socket
    /// and the address of the remote peer.
    pub async fn accept(&self) -> Result<(Socket, SocketAddr)> {
        self.inner
            .accept()
            .await
            .map(|(inner, addr)| (Socket { inner }, addr))
            .wrapped(ErrorKind::Communication)
    }

    /// Reports the local address this `Listener` is bound to.
    ///
    /// Useful when binding to port 0, to learn the port the
    /// operating system picked.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().wrapped(ErrorKind::Communication)
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// A socket running either in the clear or through a TLS session,
/// depending on how the endpoints were configured.
///
/// Owned by exactly one connection task; every other task reaches
/// the peer through that task's message channel.
pub enum Transport {
    /// TLS disabled on both endpoints.
    Plain(Socket),
    /// Server side of a TLS session.
    TlsServer(TlsStreamSrv<Socket>),
    /// Client side of a TLS session.
    TlsClient(TlsStreamCli<Socket>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::TlsServer(s) => Pin::new(s).poll_read(cx, buf),
            Transport::TlsClient(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::TlsServer(s) => Pin::new(s).poll_write(cx, buf),
            Transport::TlsClient(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::TlsServer(s) => Pin::new(s).poll_flush(cx),
            Transport::TlsClient(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_close(cx),
            Transport::TlsServer(s) => Pin::new(s).poll_close(cx),
            Transport::TlsClient(s) => Pin::new(s).poll_close(cx),
        }
    }
}
