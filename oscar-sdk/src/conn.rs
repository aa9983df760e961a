//! Connections: one socket to the service or to a peer, plus the protocol
//! metadata that rides along with it.
//!
//! Connections are identified by a [`ConnId`] handle into the session's
//! table, never by pointer, so closing one cannot dangle references held
//! elsewhere. Closing marks the slot dead and purges its queued frames; the
//! slot itself is only detached by the session's reaper, which keeps a
//! frame that is still in flight from dispatching against freed state.

use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;

/// Stable handle for one connection within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    /// Authorizer.
    Auth,
    /// The main service ("BOS") connection.
    Bos,
    /// Chat room navigation service.
    ChatNav,
    /// One chat room.
    Chat,
    /// A direct peer socket (direct IM, file transfer, ...).
    Rendezvous,
    /// A listening socket awaiting an inbound peer connection.
    RendezvousListener,
}

/// The purpose of a rendezvous connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousKind {
    DirectIm,
    FileGet,
    FileSend,
    BuddyIcon,
    Voice,
}

bitflags::bitflags! {
    /// Connection status bits. Resolve and connect failures are distinct so
    /// a caller can tell "host unreachable" from "service down"; an
    /// in-progress connect is a retryable state of its own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnStatus: u8 {
        const READY = 0x01;
        const INTERNAL_ERR = 0x02;
        const RESOLVE_ERR = 0x04;
        const CONNECT_ERR = 0x08;
        const IN_PROGRESS = 0x10;
    }
}

/// Typed per-connection module data (what the original stashed behind an
/// opaque pointer).
#[derive(Debug, Default)]
pub enum ConnData {
    #[default]
    None,
    /// Peer identity for a direct-IM socket.
    DirectIm { peer: String, cookie: [u8; 8] },
    /// State of a file transfer riding this socket.
    FileTransfer(Box<FileTransferState>),
}

/// Progress of one OFT exchange.
#[derive(Debug)]
pub struct FileTransferState {
    pub peer: String,
    pub cookie: [u8; 8],
    /// True when we are the sender.
    pub sending: bool,
    pub file_name: String,
    pub total_size: u32,
    pub bytes_moved: u64,
    pub checksum: oscar_proto::OftChecksum,
    /// Checksum the sender declared in its prompt.
    pub declared_checksum: u32,
    /// Prompt exchanged; raw file bytes are flowing.
    pub transferring: bool,
}

/// One socket plus protocol metadata. Owned exclusively by the session.
pub struct Connection {
    pub id: ConnId,
    pub conn_type: ConnType,
    pub rendezvous: Option<RendezvousKind>,
    pub status: ConnStatus,
    pub data: ConnData,
    /// Forced minimum delay between sends. A crude congestion valve, not
    /// real rate-limit compliance.
    pub forced_latency: Option<Duration>,
    pub(crate) seq: u16,
    pub(crate) last_send: Option<Instant>,
    pub(crate) writer: Option<OwnedWriteHalf>,
    pub(crate) reader_task: Option<JoinHandle<()>>,
    /// Dead and awaiting detachment by the reaper.
    pub(crate) reap: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnId, conn_type: ConnType) -> Self {
        Connection {
            id,
            conn_type,
            rendezvous: None,
            status: ConnStatus::default(),
            data: ConnData::None,
            forced_latency: None,
            seq: 0,
            last_send: None,
            writer: None,
            reader_task: None,
            reap: false,
        }
    }

    /// Next FLAP sequence number; wraps.
    pub(crate) fn next_seq(&mut self) -> u16 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    pub fn is_alive(&self) -> bool {
        !self.reap && self.writer.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.status.contains(ConnStatus::IN_PROGRESS)
    }

    /// Whether the forced-latency valve currently blocks a send.
    pub(crate) fn send_blocked(&self, now: Instant) -> bool {
        match (self.forced_latency, self.last_send) {
            (Some(latency), Some(last)) => now.duration_since(last) < latency,
            _ => false,
        }
    }

    /// Release the socket and mark the slot dead. Does not detach it from
    /// the session; the reaper does that once no frame references it.
    pub(crate) fn close(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.status.remove(ConnStatus::READY | ConnStatus::IN_PROGRESS);
        self.reap = true;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("type", &self.conn_type)
            .field("rendezvous", &self.rendezvous)
            .field("status", &self.status)
            .field("seq", &self.seq)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_wrap() {
        let mut conn = Connection::new(ConnId(1), ConnType::Bos);
        conn.seq = u16::MAX;
        assert_eq!(conn.next_seq(), u16::MAX);
        assert_eq!(conn.next_seq(), 0);
    }

    #[test]
    fn forced_latency_blocks_until_elapsed() {
        let mut conn = Connection::new(ConnId(1), ConnType::Bos);
        let now = Instant::now();
        conn.forced_latency = Some(Duration::from_secs(5));
        assert!(!conn.send_blocked(now)); // nothing sent yet
        conn.last_send = Some(now);
        assert!(conn.send_blocked(now + Duration::from_secs(2)));
        assert!(!conn.send_blocked(now + Duration::from_secs(6)));
    }

    #[test]
    fn close_marks_for_reaping() {
        let mut conn = Connection::new(ConnId(3), ConnType::Rendezvous);
        conn.status = ConnStatus::READY;
        conn.close();
        assert!(conn.reap);
        assert!(!conn.is_alive());
        assert!(!conn.status.contains(ConnStatus::READY));
    }
}
