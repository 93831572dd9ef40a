//! Communication primitives for `hermod`: peer naming, wire message
//! formats, framing, and the codec seam.

#[cfg(not(feature = "expose_impl"))]
pub(crate) mod socket;

#[cfg(feature = "expose_impl")]
pub mod socket;

pub mod channel;
pub mod framing;
pub mod message;
pub mod serialize;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::{self, Either};
use futures_timer::Delay;
use serde::{Deserialize, Serialize};

use crate::hub::error::*;

/// The default port a Manager listens on.
pub const DEFAULT_PORT: u16 = 1875;

/// The canonical `host:port` name of a peer socket.
///
/// Loopback peers are normalized to `localhost:<port>`, so the same
/// peer is always indexed under the same key regardless of which
/// loopback alias it connected through.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PeerAddr(String);

impl PeerAddr {
    /// Derives the canonical address of a connected socket.
    pub fn canonical(addr: SocketAddr) -> Self {
        if addr.ip().is_loopback() {
            PeerAddr(format!("localhost:{}", addr.port()))
        } else {
            PeerAddr(format!("{}:{}", addr.ip(), addr.port()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerAddr {
    fn from(addr: String) -> Self {
        PeerAddr(addr)
    }
}

impl From<&str> for PeerAddr {
    fn from(addr: &str) -> Self {
        PeerAddr(addr.into())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The host part a remote peer is known by.
///
/// The local machine carries no reverse resolver, so a non loopback
/// peer is known by its IP address, which is also what a forward
/// resolver reports for an unresolvable host. Loopback peers are
/// known as `localhost`.
pub fn peer_hostname(addr: SocketAddr) -> String {
    if addr.ip().is_loopback() {
        "localhost".into()
    } else {
        addr.ip().to_string()
    }
}

/// The name of the local machine.
pub fn hostname() -> String {
    for var in &["HOSTNAME", "COMPUTERNAME", "HOST"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }
    "localhost".into()
}

/// Every name the local machine answers to.
pub fn localhost_aliases() -> Vec<String> {
    let mut aliases = vec!["localhost".to_string(), "127.0.0.1".into(), "::1".into()];
    let name = hostname();
    if !aliases.contains(&name) {
        aliases.push(name);
    }
    aliases
}

/// The language string peers advertise in their identity.
pub fn language() -> String {
    "Rust 2021".into()
}

/// The operating system string peers advertise in their identity.
pub fn os_string() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Awaits `future` for at most `duration`.
pub async fn with_deadline<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    futures::pin_mut!(future);
    match future::select(future, Delay::new(duration)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(Error::simple(ErrorKind::Timeout)),
    }
}

/// A command consumed by a socket's writer task.
pub enum WriteCmd {
    /// Write one frame, terminator appended.
    Frame(Vec<u8>),
    /// Flush and close the socket.
    Close,
}

/// A non-owning handle to a socket's writer task.
///
/// Every task holding a clone may queue frames; the writer task owns
/// the socket and serializes the writes.
pub type PeerTx = channel::ChannelTx<WriteCmd>;

/// Drains a write channel into the socket until it closes.
pub(crate) async fn writer_task<W>(mut writer: W, mut rx: channel::ChannelRx<WriteCmd>)
where
    W: futures::io::AsyncWrite + Unpin,
{
    use futures::io::AsyncWriteExt;

    while let Ok(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Frame(payload) => {
                if let Err(e) = framing::write_frame(&mut writer, &payload).await {
                    tracing::debug!(error = %e, "write failed, dropping writer");
                    break;
                }
            }
            WriteCmd::Close => break,
        }
    }
    writer.close().await.unwrap_or(());
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::PeerAddr;

    #[test]
    fn test_loopback_is_canonicalized() {
        let v4: SocketAddr = "127.0.0.1:1875".parse().unwrap();
        assert_eq!(PeerAddr::canonical(v4).as_str(), "localhost:1875");

        let v6: SocketAddr = "[::1]:1875".parse().unwrap();
        assert_eq!(PeerAddr::canonical(v6).as_str(), "localhost:1875");

        let remote: SocketAddr = "10.0.0.7:40123".parse().unwrap();
        assert_eq!(PeerAddr::canonical(remote).as_str(), "10.0.0.7:40123");
    }
}
