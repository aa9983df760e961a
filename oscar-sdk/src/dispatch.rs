//! SNAC dispatch: the module registry and the incoming-queue pump.
//!
//! One module serves one protocol family (or opts into multi-family mode to
//! see everything). Dispatch strips the 10-byte SNAC header from a channel-2
//! frame and offers the body to each eligible module in registration order
//! until one consumes it. Anything left over lands in the catch-all logger,
//! which records family/subtype and a bounded hex dump and can never fail.
//!
//! Non-SNAC control frames bypass this entirely: the channel-1 version probe
//! and the channel-4 negotiation-close frame have dedicated paths.

use std::collections::HashMap;

use oscar_proto::flap::{FlapChannel, FLAP_VERSION_PROBE};
use oscar_proto::snac::SnacHeader;
use oscar_proto::tlv::TlvChain;
use tracing::{debug, warn};

use crate::conn::{ConnId, ConnType};
use crate::event::Event;
use crate::session::{RxFrame, Session, WireFrame};

/// Wildcard subtype: a handler registered under this value is the family's
/// default, found by an explicit secondary lookup when the exact subtype has
/// no handler.
pub const SUBTYPE_DEFAULT: u16 = 0xffff;

/// A protocol-family module. `handle` returns true when it consumed the
/// SNAC.
pub trait Module: Send {
    fn name(&self) -> &'static str;
    fn family(&self) -> u16;
    /// Multi-family modules are offered every SNAC regardless of family.
    fn multi_family(&self) -> bool {
        false
    }
    fn handle(&mut self, sess: &mut Session, conn: ConnId, snac: &SnacHeader, body: &[u8])
        -> bool;
}

/// A user-registered per-subtype callback.
pub type SnacHandler = Box<dyn FnMut(&mut Session, ConnId, &SnacHeader, &[u8]) -> bool + Send>;

/// Module wrapping user callbacks for one family, with the wildcard-subtype
/// fallback.
pub struct HandlerModule {
    family: u16,
    handlers: HashMap<u16, SnacHandler>,
}

impl HandlerModule {
    pub fn new(family: u16) -> Self {
        HandlerModule {
            family,
            handlers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, subtype: u16, handler: SnacHandler) {
        self.handlers.insert(subtype, handler);
    }
}

impl Module for HandlerModule {
    fn name(&self) -> &'static str {
        "callbacks"
    }

    fn family(&self) -> u16 {
        self.family
    }

    fn handle(
        &mut self,
        sess: &mut Session,
        conn: ConnId,
        snac: &SnacHeader,
        body: &[u8],
    ) -> bool {
        // Exact subtype first, then the explicit wildcard lookup.
        if let Some(handler) = self.handlers.get_mut(&snac.subtype) {
            return handler(sess, conn, snac, body);
        }
        if snac.subtype != SUBTYPE_DEFAULT {
            if let Some(handler) = self.handlers.get_mut(&SUBTYPE_DEFAULT) {
                return handler(sess, conn, snac, body);
            }
        }
        false
    }
}

/// Registration-ordered module table plus user callbacks. Taken out of the
/// session for the duration of a dispatch pass so modules can borrow the
/// session mutably. User callbacks run before the built-in modules so an
/// embedding client can override any family it wants to handle itself.
#[derive(Default)]
pub struct Registry {
    callbacks: HashMap<u16, HandlerModule>,
    modules: Vec<Box<dyn Module>>,
}

impl Registry {
    pub fn register(&mut self, module: Box<dyn Module>) {
        debug!(module = module.name(), family = module.family(), "registered module");
        self.modules.push(module);
    }

    /// Register a user callback for (family, subtype). `SUBTYPE_DEFAULT`
    /// registers the family's default handler.
    pub fn register_handler(&mut self, family: u16, subtype: u16, handler: SnacHandler) {
        self.callbacks
            .entry(family)
            .or_insert_with(|| HandlerModule::new(family))
            .insert(subtype, handler);
    }

    /// Route one frame. The frame is always consumed; protocol-logic errors
    /// never propagate past this point.
    pub(crate) fn dispatch_one(&mut self, sess: &mut Session, rx: &mut RxFrame) {
        let conn_type = match sess.conn(rx.conn) {
            Some(c) => c.conn_type,
            None => {
                // Connection already detached; the purge on close should have
                // caught this frame.
                warn!(conn = %rx.conn, "frame for unknown connection dropped");
                rx.handled = true;
                return;
            }
        };

        match &rx.frame {
            WireFrame::Peer { frame, payload } => {
                if conn_type != ConnType::Rendezvous {
                    warn!(conn = %rx.conn, "peer frame on non-rendezvous connection");
                } else {
                    crate::rendezvous::handle_peer_frame(sess, rx.conn, frame, payload);
                }
                rx.handled = true;
            }
            WireFrame::Raw(bytes) => {
                if conn_type != ConnType::Rendezvous {
                    warn!(conn = %rx.conn, "raw bytes on non-rendezvous connection");
                } else {
                    crate::rendezvous::handle_raw_data(sess, rx.conn, bytes);
                }
                rx.handled = true;
            }
            WireFrame::Flap(flap) => {
                if conn_type == ConnType::Rendezvous {
                    warn!(conn = %rx.conn, "FLAP frame on rendezvous connection");
                    rx.handled = true;
                    return;
                }
                match FlapChannel::from_u8(flap.channel) {
                    Some(FlapChannel::NewConnection) => {
                        if flap.payload == FLAP_VERSION_PROBE {
                            debug!(conn = %rx.conn, "FLAP version probe");
                        } else {
                            debug!(conn = %rx.conn, len = flap.payload.len(),
                                "connection greeting with login payload");
                        }
                    }
                    Some(FlapChannel::Snac) => {
                        self.dispatch_snac(sess, rx.conn, &flap.payload);
                    }
                    Some(FlapChannel::Close) => {
                        negotiation_close(sess, rx.conn, &flap.payload);
                    }
                    Some(FlapChannel::Keepalive) => {
                        debug!(conn = %rx.conn, "keepalive");
                    }
                    Some(FlapChannel::Error) | None => {
                        warn!(conn = %rx.conn, channel = flap.channel, "unhandled FLAP channel");
                    }
                }
                rx.handled = true;
            }
        }
    }

    fn dispatch_snac(&mut self, sess: &mut Session, conn: ConnId, payload: &[u8]) {
        let (snac, body) = match SnacHeader::decode(payload) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(conn = %conn, error = %e, "undersized SNAC frame dropped");
                return;
            }
        };

        if let Some(callbacks) = self.callbacks.get_mut(&snac.family) {
            if callbacks.handle(sess, conn, &snac, body) {
                return;
            }
        }

        for module in &mut self.modules {
            if !module.multi_family() && module.family() != snac.family {
                continue;
            }
            if module.handle(sess, conn, &snac, body) {
                return;
            }
        }

        log_unhandled(&snac, body);
    }
}

/// The catch-all logger. Only records what arrived; never fails, whatever
/// the payload looks like.
fn log_unhandled(snac: &SnacHeader, body: &[u8]) {
    let dump_len = body.len().min(64);
    let mut dump = String::with_capacity(dump_len * 3);
    for b in &body[..dump_len] {
        dump.push_str(&format!("{b:02x} "));
    }
    debug!(
        family = format_args!("0x{:04x}", snac.family),
        subtype = format_args!("0x{:04x}", snac.subtype),
        len = body.len(),
        dump = dump.trim_end(),
        "unhandled SNAC"
    );
}

/// FLAP channel 4: the server is closing the connection, optionally saying
/// why (TLV 0x0009 code, TLV 0x000B message).
fn negotiation_close(sess: &mut Session, conn: ConnId, payload: &[u8]) {
    let tlvs = TlvChain::read_all(payload);
    let code = tlvs.get_u16(0x0009, 1);
    let message = tlvs.get_str(0x000b, 1);
    warn!(conn = %conn, ?code, message = message.as_deref().unwrap_or(""),
        "connection closed by server");
    sess.emit(Event::ConnError { conn, code, message });
    sess.close_connection(conn, "closed by server");
}
