//! In-process channel transport.
//!
//! Every successful [`MemoryConnector::connect`] hands out a [`MemoryPeer`],
//! the far end of the new channel: it pushes frames to the client and reads
//! what the client wrote. Dropping the peer closes the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

use super::{ChannelIo, Connector};
use crate::error::{SyncError, SyncResult};
use crate::models::Credential;
use crate::protocol::{ClientEvent, ServerEvent};

/// Server end of one established in-memory channel.
pub struct MemoryPeer {
    to_client: fmpsc::UnboundedSender<SyncResult<String>>,
    from_client: fmpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Push an event to the client. Returns false once the client is gone.
    pub fn push(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(frame) => self.push_frame(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode server event");
                false
            }
        }
    }

    /// Push a raw text frame, well-formed or not.
    pub fn push_frame(&self, frame: impl Into<String>) -> bool {
        self.to_client.unbounded_send(Ok(frame.into())).is_ok()
    }

    /// Surface a read error on the client side of the channel.
    pub fn fail(&self, error: SyncError) -> bool {
        self.to_client.unbounded_send(Err(error)).is_ok()
    }

    /// Next event the client sent. `None` once the client closed its end.
    /// Frames that do not decode are skipped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        while let Some(frame) = self.from_client.next().await {
            match serde_json::from_str(&frame) {
                Ok(event) => return Some(event),
                Err(e) => warn!(error = %e, "ignoring undecodable client frame"),
            }
        }
        None
    }

    /// Events the client already sent, without waiting.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Some(Some(frame)) = self.from_client.next().now_or_never() {
            if let Ok(event) = serde_json::from_str(&frame) {
                events.push(event);
            }
        }
        events
    }
}

/// [`Connector`] that establishes in-memory channels and hands their far ends
/// to whoever holds the peer receiver.
#[derive(Default)]
pub struct MemoryConnector {
    refuse: AtomicBool,
    refuse_next: AtomicU32,
    attempts: AtomicU32,
    peers: Option<mpsc::UnboundedSender<MemoryPeer>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: Some(tx),
            ..Default::default()
        });
        (connector, rx)
    }

    /// While set, every handshake fails.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `count` handshakes.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.fetch_add(count, Ordering::SeqCst);
    }

    /// Handshakes attempted so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_refusal(&self) -> bool {
        self.refuse.load(Ordering::SeqCst)
            || self
                .refuse_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _credential: &Credential) -> SyncResult<ChannelIo> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_refusal() {
            return Err(SyncError::Channel("connection refused".into()));
        }

        let (to_client, client_rx) = fmpsc::unbounded();
        let (client_tx, from_client) = fmpsc::unbounded();
        if let Some(peers) = &self.peers {
            let _ = peers.send(MemoryPeer {
                to_client,
                from_client,
            });
        }
        Ok(ChannelIo {
            sink: Box::pin(client_tx.sink_map_err(|e| SyncError::Channel(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}
