//! Channel forwarder
//!
//! Relays bytes read from a channel's outbound connection back through the
//! tunnel as DATA frames. One task per open channel.

use crate::channel::{Channel, ChannelTable};
use crate::proto::Frame;
use crate::session::FrameWriter;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Read buffer per channel
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Why a forwarder stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The outbound side sent EOF
    EndOfStream,
    /// Reading the outbound side failed
    ReadError,
    /// The tunnel connection could not be written
    TunnelError,
    /// Channel closed or session ended elsewhere
    Stopped,
}

pub struct Forwarder {
    channel: Arc<Channel>,
    reader: OwnedReadHalf,
    table: Arc<ChannelTable>,
    writer: FrameWriter,
    notify_peer: bool,
}

impl Forwarder {
    pub fn new(
        channel: Arc<Channel>,
        reader: OwnedReadHalf,
        table: Arc<ChannelTable>,
        writer: FrameWriter,
    ) -> Self {
        Self {
            channel,
            reader,
            table,
            writer,
            notify_peer: false,
        }
    }

    /// Send CLOSE to the peer when the outbound side ends on its own
    pub fn notify_peer(mut self, notify: bool) -> Self {
        self.notify_peer = notify;
        self
    }

    pub fn spawn(self) -> JoinHandle<Exit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Exit {
        let id = self.channel.id();
        let stop = self.channel.stop_token().clone();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let exit = loop {
            buf.reserve(READ_BUFFER_SIZE);
            let read = tokio::select! {
                _ = stop.cancelled() => break Exit::Stopped,
                read = self.reader.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => break Exit::EndOfStream,
                Ok(n) => trace!("Channel {}: {} bytes from {}", id, n, self.channel.target()),
                Err(e) => {
                    debug!("Channel {}: read error: {}", id, e);
                    break Exit::ReadError;
                }
            }

            let frame = Frame::data(id, buf.split().freeze());
            match self.writer.send_for(&self.channel, &frame).await {
                Ok(true) => {}
                Ok(false) => break Exit::Stopped,
                Err(e) => {
                    debug!("Channel {}: tunnel write failed: {}", id, e);
                    break Exit::TunnelError;
                }
            }
        };

        self.table.release(&self.channel);
        let closed_here = self.channel.close().await;
        if closed_here
            && self.notify_peer
            && matches!(exit, Exit::EndOfStream | Exit::ReadError)
        {
            let _ = self.writer.send(&Frame::close(id)).await;
        }

        debug!("Channel {} forwarder finished: {:?}", id, exit);
        exit
    }
}
