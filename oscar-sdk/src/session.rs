//! The session: root object for one logged-in identity.
//!
//! A session exclusively owns its connections, frame queues, module
//! registry, and cookie cache. All protocol logic runs single-owner inside
//! whichever task holds the `Session` value; the embedding client talks to
//! it through the command/event channels (see [`crate::handle`]). Network
//! readiness arrives over an internal channel fed by per-connection reader
//! tasks and connect tasks, so the session itself never blocks beyond its
//! own bounded `wait`.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use oscar_proto::flap::{FlapChannel, FlapFrame, FLAP_VERSION_PROBE};
use oscar_proto::peer::PeerFrame;
use oscar_proto::snac::SnacHeader;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::conn::{ConnId, ConnStatus, ConnType, Connection, RendezvousKind};
use crate::cookie::CookieCache;
use crate::dispatch::{Registry, SnacHandler};
use crate::event::Event;
use crate::modules;
use crate::reqcache::{PendingRequest, RequestCache};
use crate::socks;

/// A frame on the session queues, in either direction.
#[derive(Debug, Clone)]
pub enum WireFrame {
    Flap(FlapFrame),
    /// A peer frame header plus its trailing body bytes (direct-IM message
    /// payloads arrive after the declared header).
    Peer { frame: PeerFrame, payload: Vec<u8> },
    /// Unframed bytes: the data phase of a file transfer.
    Raw(Vec<u8>),
}

/// An incoming frame awaiting dispatch.
#[derive(Debug)]
pub struct RxFrame {
    pub conn: ConnId,
    pub frame: WireFrame,
    /// Consumed by the dispatcher; purged afterwards.
    pub handled: bool,
}

/// An outgoing frame awaiting flush.
#[derive(Debug)]
pub struct TxFrame {
    pub conn: ConnId,
    pub frame: WireFrame,
}

/// Builder for an outgoing SNAC frame. The frame counts as locked while the
/// payload is being assembled; finishing the builder unlocks it for the
/// queue. This is a construction invariant, not a concurrency primitive.
pub struct SnacFrameBuilder {
    conn: ConnId,
    payload: BytesMut,
    locked: bool,
    pub request_id: u32,
}

impl SnacFrameBuilder {
    fn new(conn: ConnId, header: SnacHeader) -> Self {
        let mut payload = BytesMut::with_capacity(64);
        header.encode(&mut payload);
        SnacFrameBuilder {
            conn,
            payload,
            locked: true,
            request_id: header.request_id,
        }
    }

    pub fn payload(&mut self) -> &mut BytesMut {
        debug_assert!(self.locked, "writing into a finished frame");
        &mut self.payload
    }

    /// Unlock and produce the queueable frame.
    pub fn finish(mut self) -> TxFrame {
        self.locked = false;
        TxFrame {
            conn: self.conn,
            frame: WireFrame::Flap(FlapFrame::new(FlapChannel::Snac, self.payload.to_vec())),
        }
    }
}

/// Internal readiness events from reader/connect tasks.
#[derive(Debug)]
pub(crate) enum NetEvent {
    Connected {
        conn: ConnId,
        stream: TcpStream,
    },
    ConnectFailed {
        conn: ConnId,
        status: ConnStatus,
        error: String,
    },
    Frame {
        conn: ConnId,
        frame: WireFrame,
    },
    Closed {
        conn: ConnId,
        reason: String,
    },
    Accepted {
        listener: ConnId,
        stream: TcpStream,
    },
}

/// What `wait` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Incoming frames were queued; run the dispatcher.
    FramesQueued,
    /// Nothing is connecting and the outgoing queue has frames; flush.
    OutgoingPending,
    /// A dead connection is awaiting the reaper.
    DeadConnection(ConnId),
    /// The timeout elapsed.
    TimedOut,
}

pub struct Session {
    config: SessionConfig,
    conns: BTreeMap<ConnId, Connection>,
    next_conn_id: u64,
    incoming: VecDeque<RxFrame>,
    outgoing: VecDeque<TxFrame>,
    pub(crate) cookies: CookieCache,
    pub(crate) requests: RequestCache,
    registry: Registry,
    dispatching: bool,
    events: mpsc::UnboundedSender<Event>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    net_rx: mpsc::UnboundedReceiver<NetEvent>,
}

impl Session {
    /// Create a session and the event stream its consumer reads.
    pub fn new(config: SessionConfig) -> (Session, mpsc::UnboundedReceiver<Event>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let mut sess = Session {
            config,
            conns: BTreeMap::new(),
            next_conn_id: 1,
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            cookies: CookieCache::new(),
            requests: RequestCache::new(),
            registry: Registry::default(),
            dispatching: false,
            events,
            net_tx,
            net_rx,
        };
        modules::register_defaults(&mut sess.registry);
        (sess, event_rx)
    }

    pub fn screen_name(&self) -> &str {
        &self.config.screen_name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a protocol-family module.
    pub fn register_module(&mut self, module: Box<dyn crate::dispatch::Module>) {
        self.registry.register(module);
    }

    /// Register a callback for (family, subtype); `SUBTYPE_DEFAULT` for the
    /// family default.
    pub fn register_handler(&mut self, family: u16, subtype: u16, handler: SnacHandler) {
        self.registry.register_handler(family, subtype, handler);
    }

    pub(crate) fn emit(&self, event: Event) {
        // The receiver living shorter than the session just means nobody is
        // listening any more.
        let _ = self.events.send(event);
    }

    // ---- connection management ----------------------------------------

    /// Allocate an empty connection attached to this session.
    pub fn alloc_connection(&mut self, conn_type: ConnType) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        self.conns.insert(id, Connection::new(id, conn_type));
        debug!(conn = %id, ?conn_type, "allocated connection");
        id
    }

    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// First live connection of the given type that is not still connecting.
    pub fn find_by_type(&self, conn_type: ConnType) -> Option<ConnId> {
        self.conns
            .values()
            .find(|c| c.conn_type == conn_type && !c.is_connecting() && !c.reap)
            .map(|c| c.id)
    }

    /// Begin an active connect of `conn` to `dest` (`host` or `host:port`),
    /// through the session proxy when one is configured. The connect runs in
    /// its own task; completion arrives as readiness and is applied by the
    /// explicit completion step inside `wait`/`run`.
    pub fn connect(&mut self, conn: ConnId, dest: &str) {
        let (host, port) = split_host_port(dest, 5190);
        let Some(c) = self.conn_mut(conn) else {
            warn!(conn = %conn, "connect on unknown connection");
            return;
        };
        c.status.insert(ConnStatus::IN_PROGRESS);
        let proxy = self.config.proxy.clone();
        let net_tx = self.net_tx.clone();
        info!(conn = %conn, host, port, proxied = proxy.is_some(), "connecting");
        tokio::spawn(async move {
            let result = async {
                match &proxy {
                    Some(p) => {
                        let (proxy_host, proxy_port) = split_host_port(&p.server, 1080);
                        let mut stream =
                            TcpStream::connect((proxy_host.as_str(), proxy_port))
                                .await
                                .map_err(|e| (ConnStatus::CONNECT_ERR, e.to_string()))?;
                        socks::handshake(&mut stream, p, &host, port)
                            .await
                            .map_err(|e| (ConnStatus::CONNECT_ERR, e.to_string()))?;
                        Ok(stream)
                    }
                    None => {
                        // Resolve separately so a DNS failure is
                        // distinguishable from a refused connection.
                        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
                            .await
                            .map_err(|e| (ConnStatus::RESOLVE_ERR, e.to_string()))?;
                        let addr = addrs
                            .next()
                            .ok_or((ConnStatus::RESOLVE_ERR, "no addresses".to_string()))?;
                        TcpStream::connect(addr)
                            .await
                            .map_err(|e| (ConnStatus::CONNECT_ERR, e.to_string()))
                    }
                }
            }
            .await;

            let event = match result {
                Ok(stream) => NetEvent::Connected { conn, stream },
                Err((status, error)) => NetEvent::ConnectFailed {
                    conn,
                    status,
                    error,
                },
            };
            let _ = net_tx.send(event);
        });
    }

    /// Bind a listening socket for an inbound peer connection. Each accepted
    /// stream arrives as readiness and is attached as a rendezvous
    /// connection.
    pub async fn listen_rendezvous(&mut self, kind: RendezvousKind) -> anyhow::Result<(ConnId, u16)> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let id = self.alloc_connection(ConnType::RendezvousListener);
        if let Some(c) = self.conn_mut(id) {
            c.rendezvous = Some(kind);
            c.status.insert(ConnStatus::READY);
        }
        let net_tx = self.net_tx.clone();
        tokio::spawn(async move {
            // One peer per negotiation; accept a single stream.
            if let Ok((stream, peer)) = listener.accept().await {
                debug!(%peer, "accepted rendezvous connection");
                let _ = net_tx.send(NetEvent::Accepted { listener: id, stream });
            }
        });
        Ok((id, port))
    }

    /// Close a connection: release the socket, clear its state, mark it dead,
    /// and purge queued frames referencing it — in the same step, so nothing
    /// stale can dispatch afterwards. The slot stays until the reaper runs.
    pub fn close_connection(&mut self, id: ConnId, reason: &str) {
        let Some(c) = self.conns.get_mut(&id) else { return };
        if c.reap {
            return; // already closed
        }
        info!(conn = %id, reason, "closing connection");
        c.close();
        self.incoming.retain(|f| f.conn != id);
        self.outgoing.retain(|f| f.conn != id);
        self.emit(Event::Disconnected {
            conn: id,
            reason: reason.to_string(),
        });
    }

    /// Detach and free connections that were closed. Only the session calls
    /// this, after dispatch, so no queued frame can reference a freed slot.
    pub fn reap_connections(&mut self) {
        self.conns.retain(|_, c| !c.reap);
    }

    /// Tear down every connection and both queues.
    pub fn logoff(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.close_connection(id, "logoff");
        }
        self.reap_connections();
        self.incoming.clear();
        self.outgoing.clear();
        self.cookies.sweep(Duration::ZERO);
        info!("session logged off");
    }

    // ---- frame queues --------------------------------------------------

    /// Start an outgoing SNAC on `conn`, allocating a request id.
    pub fn start_snac(&mut self, conn: ConnId, family: u16, subtype: u16) -> SnacFrameBuilder {
        let request_id = self.requests.next_id();
        SnacFrameBuilder::new(conn, SnacHeader::new(family, subtype, request_id))
    }

    /// Start an outgoing SNAC and remember what it was about, so an error
    /// or ack referencing the request id can be attributed.
    pub fn start_snac_cached(
        &mut self,
        conn: ConnId,
        family: u16,
        subtype: u16,
        target: Option<String>,
    ) -> SnacFrameBuilder {
        let builder = self.start_snac(conn, family, subtype);
        self.requests.cache(
            builder.request_id,
            PendingRequest {
                family,
                subtype,
                target,
            },
        );
        builder
    }

    /// Append a frame to the outgoing queue.
    pub fn enqueue(&mut self, frame: TxFrame) {
        self.outgoing.push_back(frame);
    }

    /// Enqueue a raw FLAP frame (version probe, keepalive).
    pub fn enqueue_flap(&mut self, conn: ConnId, channel: FlapChannel, payload: Vec<u8>) {
        self.enqueue(TxFrame {
            conn,
            frame: WireFrame::Flap(FlapFrame::new(channel, payload)),
        });
    }

    /// Feed a received frame into the incoming queue. Reader tasks use this
    /// path; an embedding client doing its own I/O may too.
    pub fn push_incoming(&mut self, conn: ConnId, frame: WireFrame) {
        self.incoming.push_back(RxFrame {
            conn,
            frame,
            handled: false,
        });
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Number of rendezvous cookies currently cached.
    pub fn cookies_len(&self) -> usize {
        self.cookies.len()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Encode and write every flushable outgoing frame, FIFO. Frames for
    /// connections that are dead are dropped; frames for connections still
    /// connecting or held by the forced-latency valve stay queued.
    pub async fn flush(&mut self) {
        let now = Instant::now();
        let mut keep: VecDeque<TxFrame> = VecDeque::new();
        while let Some(tx) = self.outgoing.pop_front() {
            let Some(conn) = self.conns.get_mut(&tx.conn) else {
                continue; // connection gone; drop the frame
            };
            if conn.reap {
                continue;
            }
            if conn.writer.is_none() || conn.is_connecting() || conn.send_blocked(now) {
                keep.push_back(tx);
                continue;
            }
            let mut buf = BytesMut::new();
            match &tx.frame {
                WireFrame::Flap(flap) => {
                    let seq = conn.next_seq();
                    flap.encode(seq, &mut buf);
                }
                WireFrame::Peer { frame, payload } => {
                    frame.encode(&mut buf);
                    buf.put_slice(payload);
                }
                WireFrame::Raw(bytes) => buf.put_slice(bytes),
            }
            let Some(writer) = conn.writer.as_mut() else {
                keep.push_back(tx);
                continue;
            };
            if let Err(e) = writer.write_all(&buf).await {
                warn!(conn = %tx.conn, error = %e, "write failed");
                self.close_connection(tx.conn, "write error");
                continue;
            }
            if let Some(conn) = self.conns.get_mut(&tx.conn) {
                conn.last_send = Some(now);
            }
        }
        self.outgoing = keep;
    }

    // ---- readiness -----------------------------------------------------

    /// The multiplex step: wait until something needs the session's
    /// attention, up to `timeout`. Synthetic readiness (pending outgoing
    /// data, a connection needing the reaper) is reported without waiting.
    pub async fn wait(&mut self, timeout: Duration) -> Readiness {
        if let Some(id) = self.conns.values().find(|c| c.reap).map(|c| c.id) {
            return Readiness::DeadConnection(id);
        }
        let connecting = self.conns.values().any(|c| c.is_connecting());
        if !connecting && !self.outgoing.is_empty() {
            return Readiness::OutgoingPending;
        }

        let first = tokio::select! {
            ev = self.net_rx.recv() => ev,
            _ = tokio::time::sleep(timeout) => return Readiness::TimedOut,
        };
        if let Some(ev) = first {
            self.apply_net_event(ev);
        }
        // Drain whatever else is immediately available.
        while let Ok(ev) = self.net_rx.try_recv() {
            self.apply_net_event(ev);
        }
        Readiness::FramesQueued
    }

    /// Apply one readiness event: completed connects, arrived frames,
    /// closed sockets.
    pub(crate) fn apply_net_event(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Connected { conn, stream } => self.attach_stream(conn, stream),
            NetEvent::ConnectFailed {
                conn,
                status,
                error,
            } => {
                warn!(conn = %conn, %error, ?status, "connect failed");
                if let Some(c) = self.conn_mut(conn) {
                    c.status.remove(ConnStatus::IN_PROGRESS);
                    c.status.insert(status);
                }
                self.emit(Event::ConnectFailed { conn, status });
            }
            NetEvent::Frame { conn, frame } => {
                // A frame racing a close gets dropped here rather than
                // queued against a dead slot.
                if self.conn(conn).map(|c| !c.reap).unwrap_or(false) {
                    self.push_incoming(conn, frame);
                }
            }
            NetEvent::Closed { conn, reason } => {
                self.close_connection(conn, &reason);
            }
            NetEvent::Accepted { listener, stream } => {
                let kind = self.conn(listener).and_then(|c| c.rendezvous);
                let data = match self.conn_mut(listener) {
                    Some(c) => std::mem::take(&mut c.data),
                    None => return,
                };
                self.close_connection(listener, "listener satisfied");
                let id = self.alloc_connection(ConnType::Rendezvous);
                if let Some(c) = self.conn_mut(id) {
                    c.rendezvous = kind;
                    c.data = data;
                }
                self.attach_stream(id, stream);
            }
        }
    }

    /// The explicit connect-completion step: store the writer half, start
    /// the reader task, and mark the connection ready.
    fn attach_stream(&mut self, conn: ConnId, stream: TcpStream) {
        let Some(c) = self.conns.get_mut(&conn) else {
            return; // closed while connecting
        };
        let (read_half, write_half) = stream.into_split();
        let peer_framing = c.conn_type == ConnType::Rendezvous;
        let net_tx = self.net_tx.clone();
        let task = tokio::spawn(crate::reader::run(conn, read_half, peer_framing, net_tx));
        c.writer = Some(write_half);
        c.reader_task = Some(task);
        c.status.remove(ConnStatus::IN_PROGRESS);
        c.status.insert(ConnStatus::READY);
        info!(conn = %conn, "connection ready");
        if !peer_framing {
            // Every control connection opens with the FLAP version probe.
            self.send_version_probe(conn);
        }
        self.emit(Event::Connected { conn });
    }

    // ---- dispatch ------------------------------------------------------

    /// Run the dispatcher over the whole incoming queue, then purge handled
    /// frames and sweep stale cookies. Re-entrant calls are no-ops; the
    /// outer call processes everything.
    pub fn dispatch_incoming(&mut self) {
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        let mut registry = std::mem::take(&mut self.registry);

        // Frames queued during dispatch (there normally are none) wait for
        // the next pass; a handler closing a connection purges its frames
        // out of this queue before they are reached.
        let mut budget = self.incoming.len();
        while budget > 0 {
            budget -= 1;
            let Some(mut rx) = self.incoming.pop_front() else {
                break;
            };
            if rx.handled {
                continue; // already consumed; dropping it is the purge
            }
            registry.dispatch_one(self, &mut rx);
        }

        self.registry = registry;
        self.dispatching = false;
        self.cookies.sweep(self.config.cookie_max_age);
    }

    /// Send a FLAP keepalive on the BOS connection if one is ready.
    pub fn send_keepalive(&mut self) {
        if let Some(id) = self.find_by_type(ConnType::Bos) {
            self.enqueue_flap(id, FlapChannel::Keepalive, Vec::new());
        }
    }

    /// Send the FLAP version probe that opens every control connection.
    pub fn send_version_probe(&mut self, conn: ConnId) {
        self.enqueue_flap(conn, FlapChannel::NewConnection, FLAP_VERSION_PROBE.to_vec());
    }
}

/// Split `host[:port]`, with a default port.
fn split_host_port(dest: &str, default_port: u16) -> (String, u16) {
    match dest.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (dest.to_string(), default_port),
        },
        None => (dest.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_split() {
        assert_eq!(split_host_port("login.example.net:5190", 9999),
            ("login.example.net".to_string(), 5190));
        assert_eq!(split_host_port("login.example.net", 9999),
            ("login.example.net".to_string(), 9999));
    }

    #[tokio::test]
    async fn find_by_type_skips_connecting_and_dead() {
        let (mut sess, _events) = Session::new(SessionConfig::default());
        let a = sess.alloc_connection(ConnType::Bos);
        sess.conn_mut(a).unwrap().status.insert(ConnStatus::IN_PROGRESS);
        assert_eq!(sess.find_by_type(ConnType::Bos), None);

        sess.conn_mut(a).unwrap().status.remove(ConnStatus::IN_PROGRESS);
        assert_eq!(sess.find_by_type(ConnType::Bos), Some(a));

        sess.close_connection(a, "test");
        assert_eq!(sess.find_by_type(ConnType::Bos), None);
    }

    #[tokio::test]
    async fn close_purges_both_queues() {
        let (mut sess, _events) = Session::new(SessionConfig::default());
        let a = sess.alloc_connection(ConnType::Bos);
        let b = sess.alloc_connection(ConnType::Chat);
        sess.push_incoming(a, WireFrame::Flap(FlapFrame::new(FlapChannel::Keepalive, vec![])));
        sess.push_incoming(b, WireFrame::Flap(FlapFrame::new(FlapChannel::Keepalive, vec![])));
        sess.enqueue_flap(a, FlapChannel::Keepalive, vec![]);

        sess.close_connection(a, "test");
        assert_eq!(sess.incoming_len(), 1);
        assert_eq!(sess.outgoing_len(), 0);

        sess.reap_connections();
        assert!(sess.conn(a).is_none());
        assert!(sess.conn(b).is_some());
    }

    #[tokio::test]
    async fn logoff_tears_everything_down() {
        let (mut sess, mut events) = Session::new(SessionConfig::default());
        sess.alloc_connection(ConnType::Bos);
        sess.alloc_connection(ConnType::ChatNav);
        sess.logoff();
        assert_eq!(sess.incoming_len(), 0);
        assert!(sess.conn(ConnId(1)).is_none());
        // both closes surfaced as events
        let mut disconnects = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, Event::Disconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 2);
    }
}
