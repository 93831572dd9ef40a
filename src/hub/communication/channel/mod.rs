//! FIFO channels used to send messages between async tasks.
//!
//! Each socket writer is fed through one of these channels, which is
//! what serializes the writes of the many tasks holding a handle to
//! the same peer.

#[cfg(feature = "channel_futures_mpsc")]
use futures::channel::mpsc;

#[cfg(feature = "channel_futures_mpsc")]
use futures::sink::SinkExt;

#[cfg(feature = "channel_futures_mpsc")]
use futures::stream::StreamExt;

use crate::hub::error::*;

/// The sending half of a bounded async channel.
pub struct ChannelTx<T> {
    #[cfg(feature = "channel_futures_mpsc")]
    inner: mpsc::Sender<T>,

    #[cfg(feature = "channel_flume_mpmc")]
    inner: ::flume::Sender<T>,

    #[cfg(feature = "channel_async_channel_mpmc")]
    inner: ::async_channel::Sender<T>,
}

/// The receiving half of a bounded async channel.
pub struct ChannelRx<T> {
    #[cfg(feature = "channel_futures_mpsc")]
    inner: mpsc::Receiver<T>,

    #[cfg(feature = "channel_flume_mpmc")]
    inner: ::flume::Receiver<T>,

    #[cfg(feature = "channel_async_channel_mpmc")]
    inner: ::async_channel::Receiver<T>,
}

/// Creates a new bounded channel with room for `bound` messages.
pub fn new_bounded<T>(bound: usize) -> (ChannelTx<T>, ChannelRx<T>) {
    #[cfg(feature = "channel_futures_mpsc")]
    let (tx, rx) = mpsc::channel(bound);

    #[cfg(feature = "channel_flume_mpmc")]
    let (tx, rx) = ::flume::bounded(bound);

    #[cfg(feature = "channel_async_channel_mpmc")]
    let (tx, rx) = ::async_channel::bounded(bound);

    let tx = ChannelTx { inner: tx };
    let rx = ChannelRx { inner: rx };

    (tx, rx)
}

impl<T> Clone for ChannelTx<T> {
    fn clone(&self) -> Self {
        let inner = self.inner.clone();
        Self { inner }
    }
}

impl<T> ChannelTx<T> {
    /// Sends a message through the channel, waiting if it is full.
    ///
    /// Fails if the receiving half has been dropped, i.e. the task
    /// owning the other side of this channel has ended.
    pub async fn send(&mut self, message: T) -> Result<()> {
        #[cfg(feature = "channel_futures_mpsc")]
        {
            self.inner
                .send(message)
                .await
                .simple_msg(ErrorKind::CommunicationChannel, "Channel receiver dropped")
        }

        #[cfg(feature = "channel_flume_mpmc")]
        {
            self.inner
                .send_async(message)
                .await
                .simple_msg(ErrorKind::CommunicationChannel, "Channel receiver dropped")
        }

        #[cfg(feature = "channel_async_channel_mpmc")]
        {
            self.inner
                .send(message)
                .await
                .simple_msg(ErrorKind::CommunicationChannel, "Channel receiver dropped")
        }
    }

    /// Attempts to send a message without waiting.
    ///
    /// The message is dropped, and an error returned, if the channel
    /// is full or disconnected.
    pub fn try_send(&mut self, message: T) -> Result<()> {
        #[cfg(feature = "channel_futures_mpsc")]
        {
            self.inner
                .try_send(message)
                .simple_msg(ErrorKind::CommunicationChannel, "Channel full or disconnected")
        }

        #[cfg(feature = "channel_flume_mpmc")]
        {
            self.inner
                .try_send(message)
                .simple_msg(ErrorKind::CommunicationChannel, "Channel full or disconnected")
        }

        #[cfg(feature = "channel_async_channel_mpmc")]
        {
            self.inner
                .try_send(message)
                .simple_msg(ErrorKind::CommunicationChannel, "Channel full or disconnected")
        }
    }
}

impl<T> ChannelRx<T> {
    /// Receives the next message from the channel.
    ///
    /// Fails once every sending handle has been dropped.
    pub async fn recv(&mut self) -> Result<T> {
        #[cfg(feature = "channel_futures_mpsc")]
        {
            self.inner
                .next()
                .await
                .ok_or_else(|| Error::simple(ErrorKind::CommunicationChannel))
        }

        #[cfg(feature = "channel_flume_mpmc")]
        {
            self.inner
                .recv_async()
                .await
                .simple(ErrorKind::CommunicationChannel)
        }

        #[cfg(feature = "channel_async_channel_mpmc")]
        {
            self.inner
                .recv()
                .await
                .simple(ErrorKind::CommunicationChannel)
        }
    }
}
