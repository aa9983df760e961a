//! Events emitted by the engine for the embedding client to consume.
//!
//! Each variant carries a fully decoded payload shape; nothing here requires
//! the consumer to re-parse wire bytes.

use std::net::SocketAddrV4;

use oscar_proto::fingerprint::ClientKind;
use oscar_proto::userinfo::UserInfo;

use crate::conn::{ConnId, ConnStatus};
use crate::cookie::CookieKind;

/// An incoming channel-1 instant message, decoded.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: UserInfo,
    /// The primary message body, chosen by charset priority when the message
    /// is multipart. Empty when no readable section was present.
    pub body: Vec<u8>,
    pub charset: u16,
    /// All message sections in wire order (charset, subset, bytes).
    pub parts: Vec<(u16, u16, Vec<u8>)>,
    pub ack_requested: bool,
    pub auto_response: bool,
    pub buddy_icon_requested: bool,
    /// Advertised icon metadata when the sender has one (sum, len, stamp).
    pub icon_info: Option<(u32, u32, u32)>,
    pub sender_client: ClientKind,
}

/// A decoded channel-2 rendezvous proposal, by purpose.
#[derive(Debug, Clone)]
pub enum RendezvousPayload {
    DirectIm {
        addr: SocketAddrV4,
    },
    FileSend {
        addr: SocketAddrV4,
        description: Option<String>,
        file_count: u16,
        total_size: u32,
        file_name: String,
    },
    FileGet {
        addr: SocketAddrV4,
    },
    BuddyIcon {
        checksum: u32,
        stamp: u32,
        icon: Vec<u8>,
    },
    Voice,
    ChatInvite {
        exchange: u16,
        room: String,
        instance: u16,
        message: Option<String>,
    },
}

/// Events that the engine emits to the consumer (UI, bot, test harness).
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection finished its TCP (and proxy) handshake.
    Connected { conn: ConnId },

    /// A connection attempt failed; the status says how (resolve vs connect).
    ConnectFailed { conn: ConnId, status: ConnStatus },

    /// A connection was closed, by us or by the peer.
    Disconnected { conn: ConnId, reason: String },

    /// The server announced the families it serves on this connection.
    ServerReady { conn: ConnId, families: Vec<u16> },

    /// Rate-limit classes arrived (count only; classes are acked wholesale).
    RateInfo { conn: ConnId, classes: u16 },

    /// The server asked us to pause or told us to resume.
    ServerPaused { conn: ConnId },
    ServerResumed { conn: ConnId },

    /// Migration notice: reconnect to `host` for the listed families.
    Migrate { conn: ConnId, host: Option<String> },

    /// Message of the day.
    Motd { kind: u16, text: Option<String> },

    /// Our own user info, as the server sees it.
    SelfInfo(UserInfo),

    /// Our warning level changed (possibly anonymously).
    WarningLevel { level: u16, by: Option<UserInfo> },

    /// An instant message arrived.
    Message(IncomingMessage),

    /// A message arrived over an established direct-IM socket.
    DirectMessage {
        conn: ConnId,
        from: String,
        body: Vec<u8>,
        encoding: u16,
    },

    /// The peer on a direct-IM socket started or stopped typing.
    Typing { conn: ConnId, from: String, typing: bool },

    /// A peer proposed a rendezvous. Accept or deny via the session handle,
    /// quoting the cookie.
    RendezvousRequest {
        from: UserInfo,
        cookie: [u8; 8],
        payload: RendezvousPayload,
    },

    /// The peer accepted a rendezvous we initiated.
    RendezvousAccepted { cookie: [u8; 8], kind: CookieKind },

    /// The peer denied or cancelled a rendezvous. A normal outcome, not an
    /// error.
    RendezvousCanceled {
        cookie: [u8; 8],
        kind: CookieKind,
        reason: u16,
    },

    /// ICBM parameter info from the server.
    IcbmParams {
        max_channel: u16,
        flags: u32,
        max_msg_len: u16,
        max_sender_warning: u16,
        max_receiver_warning: u16,
        min_interval: u32,
    },

    /// The server acknowledged delivery of a message we sent.
    MessageAck { cookie: [u8; 8], to: String },

    /// A message we sent failed, either at the far client (0x0004/0x000B)
    /// or at the server (family error referencing our request).
    MessageError {
        cookie: [u8; 8],
        from: String,
        reason: u16,
    },

    /// Messages to us were dropped before delivery.
    MissedCalls {
        channel: u16,
        from: UserInfo,
        count: u16,
        reason: u16,
    },

    /// A buddy came online.
    BuddyOnline(UserInfo),

    /// A buddy went offline.
    BuddyOffline { screen_name: String },

    /// Buddy-list rights limits.
    BuddyRights { max_buddies: u16, max_watchers: u16 },

    /// Administration reply (account info / confirm).
    AdminReply { subtype: u16, permissions: u16 },

    /// Chat navigation rights/exchange info.
    ChatNavInfo { max_rooms: u8 },

    /// Connection-level error delivered on FLAP channel 4.
    ConnError {
        conn: ConnId,
        code: Option<u16>,
        message: Option<String>,
    },

    /// Bytes moved on a file transfer.
    FileTransferProgress {
        conn: ConnId,
        received: u64,
        total: u32,
    },

    /// A file transfer finished cleanly.
    FileTransferDone { conn: ConnId, file_name: String },

    /// The received bytes did not match the sender's checksum.
    FileTransferChecksumMismatch {
        conn: ConnId,
        expected: u32,
        actual: u32,
    },
}
