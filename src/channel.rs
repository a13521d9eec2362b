//! Channel table
//!
//! A channel is one logical TCP stream inside a session. The table maps the
//! 16-bit id chosen by the CONNECT initiator to the open outbound connection.
//! The session loop inserts and removes entries; forwarders look entries up
//! and remove their own entry when their connection ends.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;

/// An open channel: the write side of its outbound connection plus the
/// signal its forwarder watches.
#[derive(Debug)]
pub struct Channel {
    id: u16,
    target: String,
    created_at: Instant,
    /// Per-channel write lock; `None` once closed
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    stop: CancellationToken,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(id: u16, target: impl Into<String>, writer: OwnedWriteHalf, stop: CancellationToken) -> Self {
        Self {
            id,
            target: target.into(),
            created_at: Instant::now(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            stop,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// `host:port` (or local peer address on the client side), for logs
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Cancelled when the channel is closed or its session ends
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.stop.is_cancelled()
    }

    /// Write bytes to the outbound connection
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel closed"))?;
        writer.write_all(data).await
    }

    /// Stop the forwarder and shut the outbound connection down.
    ///
    /// Returns `true` only for the call that actually closed the channel.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        true
    }
}

/// Concurrency-safe registry of the channels open in one session
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: Mutex<HashMap<u16, Arc<Channel>>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, Arc<Channel>>> {
        // the map stays consistent even if a holder panicked
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `channel` under `id`; `false` (and no change) if `id` is taken
    pub fn insert(&self, id: u16, channel: Arc<Channel>) -> bool {
        let mut channels = self.lock();
        if channels.contains_key(&id) {
            return false;
        }
        channels.insert(id, channel);
        true
    }

    pub fn get(&self, id: u16) -> Option<Arc<Channel>> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.lock().contains_key(&id)
    }

    /// Remove and return the entry; a second call returns `None`
    pub fn remove(&self, id: u16) -> Option<Arc<Channel>> {
        self.lock().remove(&id)
    }

    /// Remove `channel` only if it is still the entry for its id.
    ///
    /// Forwarders use this so that a channel closed and reopened under the same
    /// id is not evicted by the old forwarder.
    pub fn release(&self, channel: &Arc<Channel>) -> bool {
        let mut channels = self.lock();
        match channels.get(&channel.id()) {
            Some(current) if Arc::ptr_eq(current, channel) => {
                channels.remove(&channel.id());
                true
            }
            _ => false,
        }
    }

    /// Empty the table, returning every channel that was open
    pub fn remove_all(&self) -> Vec<Arc<Channel>> {
        self.lock().drain().map(|(_, channel)| channel).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// A connected loopback pair: (our side, remote side)
    pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ours, theirs) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (ours.unwrap(), theirs.unwrap().0)
    }

    async fn channel(id: u16) -> (Arc<Channel>, TcpStream) {
        let (ours, theirs) = tcp_pair().await;
        let (_read, write) = ours.into_split();
        let channel = Channel::new(id, "test", write, CancellationToken::new());
        (Arc::new(channel), theirs)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let table = ChannelTable::new();
        let (first, _r1) = channel(7).await;
        let (second, _r2) = channel(7).await;

        assert!(table.insert(7, first.clone()));
        assert!(!table.insert(7, second));
        assert!(Arc::ptr_eq(&table.get(7).unwrap(), &first));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let table = ChannelTable::new();
        let (c, _remote) = channel(1).await;
        table.insert(1, c);

        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert!(table.get(1).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_newer_channel() {
        let table = ChannelTable::new();
        let (old, _r1) = channel(3).await;
        let (new, _r2) = channel(3).await;

        table.insert(3, old.clone());
        table.remove(3);
        table.insert(3, new.clone());

        assert!(!table.release(&old));
        assert!(table.contains(3));
        assert!(table.release(&new));
        assert!(!table.contains(3));
    }

    #[tokio::test]
    async fn test_remove_all() {
        let table = ChannelTable::new();
        let mut remotes = Vec::new();
        for id in 0..5 {
            let (c, remote) = channel(id).await;
            remotes.push(remote);
            table.insert(id, c);
        }

        let mut ids: Vec<u16> = table.remove_all().iter().map(|c| c.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let table = Arc::new(ChannelTable::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let (c, remote) = channel(42).await;
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let won = table.insert(42, c);
                (won, remote)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().0 {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_close_once() {
        let (c, mut remote) = channel(9).await;
        c.write(b"ping").await.unwrap();

        assert!(c.close().await);
        assert!(!c.close().await);
        assert!(c.is_closed());
        assert!(c.stop_token().is_cancelled());
        assert!(c.write(b"late").await.is_err());

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
    }
}
