//! Downstream endpoints: the game clients attached to a session.
//!
//! The proxy is the server side of these connections. An endpoint is
//! *active* while it takes part in fan-out, *zombie* once the session has
//! disassociated it without closing the socket (reconnect migrations), and
//! disposed when its socket goes away.

use bytes::Bytes;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;

use crate::proto::ProtocolVersion;

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Active,
    /// Excluded from fan-out; the socket may still drain queued writes.
    Zombie,
}

#[derive(Debug)]
pub struct Downstream {
    pub id: ClientId,
    pub protocol: ProtocolVersion,
    pub state: EndpointState,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Downstream {
    pub fn new(id: ClientId, protocol: ProtocolVersion, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            protocol,
            state: EndpointState::Active,
            tx,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == EndpointState::Active
    }

    pub fn zombify(&mut self) {
        self.state = EndpointState::Zombie;
    }

    /// Queue a packet toward the client. A closed writer is not an error
    /// here; the reader side reports the disposal.
    pub fn send(&self, data: Bytes) {
        if self.tx.send(data).is_err() {
            debug!("client {} writer is gone", self.id);
        }
    }
}

/// Drain a packet queue into the socket until the queue closes or the
/// socket errors.
pub fn spawn_writer(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = half.write_all(&data).await {
                debug!("downstream write failed: {e}");
                break;
            }
        }
        let _ = half.shutdown().await;
    });
}
