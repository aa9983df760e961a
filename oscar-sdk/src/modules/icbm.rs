//! ICBM — the messaging family (0x0004).
//!
//! Channel 1 carries instant messages; channel 2 carries rendezvous
//! negotiation envelopes that end in something more complex happening: a
//! direct-IM socket, a file transfer, a chat invitation. Every ICBM opens
//! with an 8-byte cookie. Plain messages only use it for error reports;
//! rendezvous negotiations are correlated by it across their whole life.
//!
//! Parsing ICBMs is the single most irregular job in the protocol. The
//! channel-1 walk re-seeks to each TLV's end position after parsing its
//! value, so a section that under- or over-parses cannot derail the ones
//! after it.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};
use oscar_proto::caps::Capability;
use oscar_proto::error::ProtoError;
use oscar_proto::fingerprint;
use oscar_proto::snac::{family, icbm, SnacHeader};
use oscar_proto::tlv::TlvChain;
use oscar_proto::userinfo::UserInfo;
use tracing::{debug, warn};

use crate::conn::{ConnId, ConnType};
use crate::cookie::{CookieData, CookieKind};
use crate::dispatch::Module;
use crate::event::{Event, IncomingMessage, RendezvousPayload};
use crate::reqcache::RequestCache;
use crate::session::Session;

/// Features advertised in outgoing messages when the caller has no opinion.
pub const DEFAULT_FEATURES: [u8; 5] = [0x01, 0x01, 0x01, 0x02, 0x42];

/// Identification string trailing a buddy-icon payload.
pub const ICON_IDENT: &[u8] = b"AVT1picture.id";

/// Rendezvous status words inside the channel-2 block.
const STATUS_REQUEST: u16 = 0x0000;
const STATUS_CANCEL: u16 = 0x0001;
const STATUS_ACCEPT: u16 = 0x0002;

/// Reasons for denying a transfer.
pub mod deny_reason {
    pub const NOT_SUPPORTED: u16 = 0x0000;
    pub const DECLINED: u16 = 0x0001;
    pub const NOT_ACCEPTING: u16 = 0x0002;
}

/// Options for an outgoing channel-1 message.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Ask the server to ack delivery (reply arrives as 0x0004/0x000C).
    pub ack: bool,
    /// Mark the message as an away-style auto-response.
    pub auto_response: bool,
    /// Ask the peer for their buddy icon.
    pub request_buddy_icon: bool,
    /// Advertise our own icon (checksum, length, timestamp).
    pub icon_info: Option<(u32, u32, u32)>,
    /// Charset pair; (0, 0) is plain ASCII, (3, 0) ISO-8859-1, (2, 0)
    /// UTF-16.
    pub charset: u16,
    pub charsubset: u16,
}

/// A decoded outgoing-format channel-1 message (the 0x0004/0x0006 layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub cookie: [u8; 8],
    pub dest: String,
    pub body: Vec<u8>,
    pub charset: u16,
    pub charsubset: u16,
    pub ack_requested: bool,
    pub auto_response: bool,
}

/// What to propose in a channel-2 request.
#[derive(Debug, Clone)]
pub enum RendezvousOffer {
    DirectIm {
        addr: SocketAddrV4,
    },
    FileSend {
        addr: SocketAddrV4,
        file_name: String,
        total_size: u32,
        file_count: u16,
        description: Option<String>,
    },
    FileGet {
        addr: SocketAddrV4,
    },
    Voice,
    ChatInvite {
        exchange: u16,
        room: String,
        instance: u16,
        message: Option<String>,
    },
    BuddyIcon {
        icon: Vec<u8>,
        checksum: u32,
        stamp: u32,
    },
}

impl RendezvousOffer {
    pub fn capability(&self) -> Capability {
        match self {
            RendezvousOffer::DirectIm { .. } => Capability::DirectIm,
            RendezvousOffer::FileSend { .. } => Capability::SendFile,
            RendezvousOffer::FileGet { .. } => Capability::GetFile,
            RendezvousOffer::Voice => Capability::Voice,
            RendezvousOffer::ChatInvite { .. } => Capability::Chat,
            RendezvousOffer::BuddyIcon { .. } => Capability::BuddyIcon,
        }
    }

    pub fn cookie_kind(&self) -> CookieKind {
        match self {
            RendezvousOffer::DirectIm { .. } => CookieKind::DirectIm,
            RendezvousOffer::FileSend { .. } => CookieKind::FileSend,
            RendezvousOffer::FileGet { .. } => CookieKind::FileGet,
            RendezvousOffer::Voice => CookieKind::Voice,
            RendezvousOffer::ChatInvite { .. } => CookieKind::ChatInvite,
            RendezvousOffer::BuddyIcon { .. } => CookieKind::BuddyIcon,
        }
    }
}

fn cookie_kind_for(cap: Capability) -> Option<CookieKind> {
    match cap {
        Capability::DirectIm => Some(CookieKind::DirectIm),
        Capability::SendFile => Some(CookieKind::FileSend),
        Capability::GetFile => Some(CookieKind::FileGet),
        Capability::Voice => Some(CookieKind::Voice),
        Capability::Chat => Some(CookieKind::ChatInvite),
        Capability::BuddyIcon => Some(CookieKind::BuddyIcon),
        _ => None,
    }
}

// ---- channel 1 encode -----------------------------------------------------

/// Encode the ICBM body (everything after the SNAC header) for a channel-1
/// message.
pub fn encode_channel1(
    cookie: [u8; 8],
    dest: &str,
    body: &[u8],
    opts: &MessageOptions,
) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(64 + body.len());
    out.put_slice(&cookie);
    out.put_u16(0x0001);
    out.put_u8(dest.len() as u8);
    out.put_slice(dest.as_bytes());

    // Message TLV: features block, then one message section.
    let msg_tlv_len = 2 + 2 + DEFAULT_FEATURES.len() + 2 + 2 + 4 + body.len();
    out.put_u16(0x0002);
    out.put_u16(msg_tlv_len as u16);
    out.put_u8(0x05);
    out.put_u8(0x01);
    out.put_u16(DEFAULT_FEATURES.len() as u16);
    out.put_slice(&DEFAULT_FEATURES);
    out.put_u16(0x0101);
    out.put_u16((body.len() + 4) as u16);
    out.put_u16(opts.charset);
    out.put_u16(opts.charsubset);
    out.put_slice(body);

    if opts.ack {
        out.put_u16(0x0003);
        out.put_u16(0x0000);
    }
    if opts.auto_response {
        out.put_u16(0x0004);
        out.put_u16(0x0000);
    }
    if opts.request_buddy_icon {
        out.put_u16(0x0009);
        out.put_u16(0x0000);
    }
    if let Some((sum, len, stamp)) = opts.icon_info {
        out.put_u16(0x0008);
        out.put_u16(0x000c);
        out.put_u32(sum);
        out.put_u32(len);
        out.put_u32(stamp);
    }
    out.to_vec()
}

/// Decode an outgoing-format channel-1 body (what `encode_channel1`
/// produces; also what the server relays for messages sent from another of
/// our own sessions).
pub fn decode_channel1(body: &[u8]) -> Result<OutgoingMessage, ProtoError> {
    if body.len() < 11 {
        return Err(ProtoError::truncated("ICBM", 11, body.len()));
    }
    let mut buf = body;
    let mut cookie = [0u8; 8];
    buf.copy_to_slice(&mut cookie);
    let channel = buf.get_u16();
    if channel != 0x0001 {
        return Err(ProtoError::Invalid {
            what: "ICBM channel",
            detail: format!("expected 1, got {channel}"),
        });
    }
    let dest_len = buf.get_u8() as usize;
    if buf.len() < dest_len {
        return Err(ProtoError::truncated("ICBM destination", dest_len, buf.len()));
    }
    let dest = String::from_utf8_lossy(&buf[..dest_len]).into_owned();
    buf.advance(dest_len);

    let mut msg = OutgoingMessage {
        cookie,
        dest,
        body: Vec::new(),
        charset: 0,
        charsubset: 0,
        ack_requested: false,
        auto_response: false,
    };

    let tlvs = TlvChain::read_all(buf);
    msg.ack_requested = tlvs.contains(0x0003);
    msg.auto_response = tlvs.contains(0x0004);
    if let Some(block) = tlvs.get(0x0002, 1) {
        let (_features, parts) = parse_message_block(&block.value);
        if let Some((charset, charsubset, data)) = pick_primary(&parts) {
            msg.charset = charset;
            msg.charsubset = charsubset;
            msg.body = data;
        }
    }
    Ok(msg)
}

// ---- channel 1 decode (incoming) ------------------------------------------

/// Parse the features + sections inside a message TLV (0x0002).
fn parse_message_block(block: &[u8]) -> (Vec<u8>, Vec<(u16, u16, Vec<u8>)>) {
    let mut buf = block;
    let mut features = Vec::new();
    if buf.len() >= 4 {
        buf.advance(2); // 05 01
        let flen = buf.get_u16() as usize;
        if buf.len() >= flen {
            features = buf[..flen].to_vec();
            buf.advance(flen);
        }
    }
    let mut parts = Vec::new();
    while buf.len() >= 8 {
        let marker = buf.get_u16();
        if marker != 0x0101 {
            break;
        }
        let block_len = buf.get_u16() as usize;
        if block_len < 4 || buf.len() < block_len {
            break;
        }
        let charset = buf.get_u16();
        let charsubset = buf.get_u16();
        let data = buf[..block_len - 4].to_vec();
        buf.advance(block_len - 4);
        parts.push((charset, charsubset, data));
    }
    (features, parts)
}

/// Pick the most readable section: ASCII first, then ISO-8859-1, UTF-16 as
/// a last resort.
fn pick_primary(parts: &[(u16, u16, Vec<u8>)]) -> Option<(u16, u16, Vec<u8>)> {
    for wanted in [0x0000u16, 0x0003, 0x0002] {
        if let Some(part) = parts.iter().find(|(cs, _, _)| *cs == wanted) {
            return Some(part.clone());
        }
    }
    None
}

fn incoming_ch1(sess: &mut Session, from: UserInfo, body: &[u8]) {
    let mut msg = IncomingMessage {
        from,
        body: Vec::new(),
        charset: 0,
        parts: Vec::new(),
        ack_requested: false,
        auto_response: false,
        buddy_icon_requested: false,
        icon_info: None,
        sender_client: fingerprint::ClientKind::Unknown,
    };

    // In-place TLV walk. Each iteration re-seeks to the TLV's computed end
    // so a value parser cannot leave the cursor somewhere wrong.
    let mut buf = body;
    while buf.len() >= 4 {
        let kind = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.len() < len {
            debug!(kind, len, have = buf.len(), "truncated ICBM TLV");
            break;
        }
        let value = &buf[..len];
        match kind {
            0x0002 => {
                let (features, parts) = parse_message_block(value);
                msg.sender_client = fingerprint::classify(&features);
                msg.parts = parts;
                if let Some((charset, _sub, data)) = pick_primary(&msg.parts) {
                    msg.charset = charset;
                    msg.body = data;
                }
            }
            0x0003 => msg.ack_requested = true,
            0x0004 => msg.auto_response = true,
            0x0008 if len >= 12 => {
                let mut v = value;
                msg.icon_info = Some((v.get_u32(), v.get_u32(), v.get_u32()));
            }
            0x0009 => msg.buddy_icon_requested = true,
            0x0017 => {} // extended data; nothing to surface
            _ => debug!(kind, len, "unknown channel-1 TLV"),
        }
        buf.advance(len);
    }

    sess.emit(Event::Message(msg));
}

// ---- channel 2 ------------------------------------------------------------

/// Encode a channel-2 request for `offer`.
pub fn encode_channel2_request(cookie: [u8; 8], dest: &str, offer: &RendezvousOffer) -> Vec<u8> {
    let mut inner = TlvChain::new();
    match offer {
        RendezvousOffer::DirectIm { addr } => {
            inner.add_u16(0x000a, 0x0001);
            inner.add_empty(0x000f);
            inner.add_raw(0x0003, &addr.ip().octets());
            inner.add_u16(0x0005, addr.port());
        }
        RendezvousOffer::FileSend {
            addr,
            file_name,
            total_size,
            file_count,
            description,
        } => {
            inner.add_u16(0x000a, 0x0001);
            inner.add_empty(0x000f);
            inner.add_raw(0x0003, &addr.ip().octets());
            inner.add_u16(0x0005, addr.port());
            if let Some(desc) = description {
                inner.add_str(0x000c, desc);
            }
            let mut payload = BytesMut::new();
            payload.put_u16(if *file_count > 1 { 0x0002 } else { 0x0001 });
            payload.put_u16(*file_count);
            payload.put_u32(*total_size);
            payload.put_slice(file_name.as_bytes());
            payload.put_u8(0);
            inner.add_raw(0x2711, &payload);
        }
        RendezvousOffer::FileGet { addr } => {
            inner.add_u16(0x000a, 0x0001);
            inner.add_empty(0x000f);
            inner.add_raw(0x0003, &addr.ip().octets());
            inner.add_u16(0x0005, addr.port());
        }
        RendezvousOffer::Voice => {
            inner.add_u16(0x000a, 0x0001);
            inner.add_empty(0x000f);
        }
        RendezvousOffer::ChatInvite {
            exchange,
            room,
            instance,
            message,
        } => {
            if let Some(text) = message {
                inner.add_str(0x000c, text);
            }
            let mut payload = BytesMut::new();
            payload.put_u16(*exchange);
            payload.put_u8(room.len() as u8);
            payload.put_slice(room.as_bytes());
            payload.put_u16(*instance);
            inner.add_raw(0x2711, &payload);
        }
        RendezvousOffer::BuddyIcon {
            icon,
            checksum,
            stamp,
        } => {
            inner.add_u16(0x000a, 0x0001);
            inner.add_empty(0x000f);
            let mut payload = BytesMut::new();
            payload.put_u32(*checksum);
            payload.put_u32(icon.len() as u32);
            payload.put_u32(*stamp);
            payload.put_slice(icon);
            payload.put_slice(ICON_IDENT);
            inner.add_raw(0x2711, &payload);
        }
    }
    encode_channel2(cookie, dest, STATUS_REQUEST, offer.capability(), Some(inner))
}

/// Encode a bare channel-2 accept for a negotiation in flight.
pub fn encode_channel2_accept(cookie: [u8; 8], dest: &str, cap: Capability) -> Vec<u8> {
    encode_channel2(cookie, dest, STATUS_ACCEPT, cap, None)
}

/// Encode a channel-2 cancel for a negotiation we initiated.
pub fn encode_channel2_cancel(cookie: [u8; 8], dest: &str, cap: Capability, reason: u16) -> Vec<u8> {
    let mut inner = TlvChain::new();
    inner.add_u16(0x000b, reason);
    encode_channel2(cookie, dest, STATUS_CANCEL, cap, Some(inner))
}

fn encode_channel2(
    cookie: [u8; 8],
    dest: &str,
    status: u16,
    cap: Capability,
    inner: Option<TlvChain>,
) -> Vec<u8> {
    let mut block = BytesMut::new();
    block.put_u16(status);
    block.put_slice(&cookie);
    block.put_slice(&cap.guid());
    if let Some(chain) = &inner {
        chain.write(&mut block);
    }

    let mut out = BytesMut::with_capacity(32 + block.len());
    out.put_slice(&cookie);
    out.put_u16(0x0002);
    out.put_u8(dest.len() as u8);
    out.put_slice(dest.as_bytes());
    out.put_u16(0x0005);
    out.put_u16(block.len() as u16);
    out.put_slice(&block);
    out.to_vec()
}

/// Encode the deny SNAC body (0x0004/0x000B): cookie, channel 2, sender,
/// TLV 0x0003 carrying the reason.
pub fn encode_deny(cookie: [u8; 8], dest: &str, reason: u16) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_slice(&cookie);
    out.put_u16(0x0002);
    out.put_u8(dest.len() as u8);
    out.put_slice(dest.as_bytes());
    let mut tlvs = TlvChain::new();
    tlvs.add_u16(0x0003, reason);
    tlvs.write(&mut out);
    out.to_vec()
}

fn read_addr(tlvs: &TlvChain, default_port: u16) -> Option<SocketAddrV4> {
    let ip_tlv = tlvs.get(0x0003, 1)?;
    if ip_tlv.value.len() < 4 {
        return None;
    }
    let ip = Ipv4Addr::new(
        ip_tlv.value[0],
        ip_tlv.value[1],
        ip_tlv.value[2],
        ip_tlv.value[3],
    );
    let port = tlvs.get_u16(0x0005, 1).unwrap_or(default_port);
    Some(SocketAddrV4::new(ip, port))
}

fn incoming_ch2(sess: &mut Session, from: UserInfo, icbm_cookie: [u8; 8], body: &[u8]) {
    let tlvs = TlvChain::read_all(body);
    let Some(block) = tlvs.get(0x0005, 1) else {
        warn!(from = %from.screen_name, "rendezvous without a 0x0005 block");
        return;
    };
    if block.value.len() < 2 + 8 + 16 {
        warn!(from = %from.screen_name, len = block.value.len(), "short rendezvous block");
        return;
    }
    let mut buf = &block.value[..];
    let status = buf.get_u16();
    let mut cookie = [0u8; 8];
    buf.copy_to_slice(&mut cookie);
    if cookie != icbm_cookie {
        debug!(from = %from.screen_name, "rendezvous cookie differs from ICBM cookie");
    }
    let mut guid = [0u8; 16];
    buf.copy_to_slice(&mut guid);
    let Some(cap) = Capability::from_guid(&guid) else {
        warn!(from = %from.screen_name, ?guid, "unknown rendezvous capability; dropped");
        return;
    };
    let inner = TlvChain::read_all(buf);

    // Anything past the initial request carries no purpose payload; it is
    // the back half of a negotiation already in flight and resolves through
    // the cookie cache.
    if status != STATUS_REQUEST {
        let Some(kind) = cookie_kind_for(cap) else {
            warn!(?cap, "rendezvous ack for unsupported capability");
            return;
        };
        if sess.cookies.find(&cookie, kind).is_none() {
            // A protocol anomaly, not an error: the peer referenced a
            // negotiation we know nothing about.
            warn!(from = %from.screen_name, ?kind, "rendezvous ack for uncached cookie; dropped");
            return;
        }
        // The negotiation concluded either way; the entry comes out.
        sess.cookies.remove(&cookie);
        match status {
            STATUS_ACCEPT => sess.emit(Event::RendezvousAccepted { cookie, kind }),
            _ => {
                let reason = inner.get_u16(0x000b, 1).unwrap_or(0);
                sess.emit(Event::RendezvousCanceled {
                    cookie,
                    kind,
                    reason,
                });
            }
        }
        return;
    }

    // A fresh proposal: dispatch by capability to the owning decode.
    let payload = match cap {
        Capability::DirectIm => read_addr(&inner, 4443).map(|addr| RendezvousPayload::DirectIm { addr }),
        Capability::SendFile => decode_file_send(&inner),
        Capability::GetFile => read_addr(&inner, 0).map(|addr| RendezvousPayload::FileGet { addr }),
        Capability::Voice => {
            sess.cookies.cache(
                cookie,
                CookieKind::Voice,
                CookieData::Voice {
                    peer: from.screen_name.clone(),
                },
            );
            Some(RendezvousPayload::Voice)
        }
        Capability::BuddyIcon => decode_buddy_icon(&inner),
        Capability::Chat => decode_chat_invite(&inner),
        other => {
            debug!(?other, "rendezvous purpose not handled");
            None
        }
    };

    match payload {
        Some(payload) => sess.emit(Event::RendezvousRequest {
            from,
            cookie,
            payload,
        }),
        None => warn!(from = %from.screen_name, ?cap, "damaged rendezvous payload; dropped"),
    }
}

fn decode_file_send(inner: &TlvChain) -> Option<RendezvousPayload> {
    let addr = read_addr(inner, 0)?;
    let info = inner.get(0x2711, 1)?;
    if info.value.len() < 8 {
        return None;
    }
    let mut buf = &info.value[..];
    let _subtype = buf.get_u16();
    let file_count = buf.get_u16();
    let total_size = buf.get_u32();
    let name_end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let file_name = String::from_utf8_lossy(&buf[..name_end]).into_owned();
    Some(RendezvousPayload::FileSend {
        addr,
        description: inner.get_str(0x000c, 1),
        file_count,
        total_size,
        file_name,
    })
}

fn decode_buddy_icon(inner: &TlvChain) -> Option<RendezvousPayload> {
    let info = inner.get(0x2711, 1)?;
    if info.value.len() < 12 {
        return None;
    }
    let mut buf = &info.value[..];
    let checksum = buf.get_u32();
    let len = buf.get_u32() as usize;
    let stamp = buf.get_u32();
    if buf.len() < len {
        return None;
    }
    Some(RendezvousPayload::BuddyIcon {
        checksum,
        stamp,
        icon: buf[..len].to_vec(),
    })
}

fn decode_chat_invite(inner: &TlvChain) -> Option<RendezvousPayload> {
    let info = inner.get(0x2711, 1)?;
    if info.value.len() < 3 {
        return None;
    }
    let mut buf = &info.value[..];
    let exchange = buf.get_u16();
    let name_len = buf.get_u8() as usize;
    if buf.len() < name_len + 2 {
        return None;
    }
    let room = String::from_utf8_lossy(&buf[..name_len]).into_owned();
    buf.advance(name_len);
    let instance = buf.get_u16();
    Some(RendezvousPayload::ChatInvite {
        exchange,
        room,
        instance,
        message: inner.get_str(0x000c, 1),
    })
}

// ---- incoming entry point --------------------------------------------------

fn incoming(sess: &mut Session, body: &[u8]) {
    if body.len() < 10 {
        warn!(len = body.len(), "runt incoming ICBM");
        return;
    }
    let mut buf = body;
    let mut cookie = [0u8; 8];
    buf.copy_to_slice(&mut cookie);
    let channel = buf.get_u16();
    let from = match UserInfo::read(&mut buf) {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "bad user-info block in ICBM");
            return;
        }
    };
    match channel {
        0x0001 => incoming_ch1(sess, from, buf),
        0x0002 => incoming_ch2(sess, from, cookie, buf),
        other => debug!(channel = other, "ICBM on unsupported channel; ignored"),
    }
}

// ---- other subtypes --------------------------------------------------------

fn param_info(sess: &mut Session, body: &[u8]) {
    if body.len() < 16 {
        warn!(len = body.len(), "short ICBM parameter info");
        return;
    }
    let mut buf = body;
    sess.emit(Event::IcbmParams {
        max_channel: buf.get_u16(),
        flags: buf.get_u32(),
        max_msg_len: buf.get_u16(),
        max_sender_warning: buf.get_u16(),
        max_receiver_warning: buf.get_u16(),
        min_interval: buf.get_u32(),
    });
}

fn missed_calls(sess: &mut Session, body: &[u8]) {
    let mut buf = body;
    while buf.len() >= 2 {
        let channel = buf.get_u16();
        let from = match UserInfo::read(&mut buf) {
            Ok(info) => info,
            Err(_) => break,
        };
        if buf.len() < 4 {
            break;
        }
        let count = buf.get_u16();
        let reason = buf.get_u16();
        sess.emit(Event::MissedCalls {
            channel,
            from,
            count,
            reason,
        });
    }
}

fn client_error(sess: &mut Session, body: &[u8]) {
    if body.len() < 11 {
        return;
    }
    let mut buf = body;
    let mut cookie = [0u8; 8];
    buf.copy_to_slice(&mut cookie);
    let _channel = buf.get_u16();
    let sn_len = buf.get_u8() as usize;
    if buf.len() < sn_len + 2 {
        return;
    }
    let from = String::from_utf8_lossy(&buf[..sn_len]).into_owned();
    buf.advance(sn_len);
    let reason = buf.get_u16();
    sess.emit(Event::MessageError {
        cookie,
        from,
        reason,
    });
}

fn host_ack(sess: &mut Session, body: &[u8]) {
    if body.len() < 11 {
        return;
    }
    let mut buf = body;
    let mut cookie = [0u8; 8];
    buf.copy_to_slice(&mut cookie);
    let _channel = buf.get_u16();
    let sn_len = buf.get_u8() as usize;
    if buf.len() < sn_len {
        return;
    }
    let to = String::from_utf8_lossy(&buf[..sn_len]).into_owned();
    // The cookie's job is done once the server has the message.
    sess.cookies.remove(&cookie);
    sess.emit(Event::MessageAck { cookie, to });
}

// ---- session-level operations ----------------------------------------------

/// Send a channel-1 message to `dest` over the BOS connection. Returns the
/// message cookie.
pub fn send_message(
    sess: &mut Session,
    dest: &str,
    body: &[u8],
    opts: &MessageOptions,
) -> anyhow::Result<[u8; 8]> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let cookie: [u8; 8] = rand::random();
    let mut frame = sess.start_snac_cached(conn, family::ICBM, icbm::OUTGOING, Some(dest.into()));
    frame
        .payload()
        .put_slice(&encode_channel1(cookie, dest, body, opts));
    sess.enqueue(frame.finish());
    sess.cookies.cache(
        cookie,
        CookieKind::Message,
        CookieData::Message { to: dest.into() },
    );
    sess.requests.sweep(RequestCache::MAX_AGE);
    Ok(cookie)
}

/// Propose a rendezvous to `dest`. The cookie is cached so the peer's
/// accept/cancel can find its way back; returns it.
pub fn initiate_rendezvous(
    sess: &mut Session,
    dest: &str,
    offer: &RendezvousOffer,
) -> anyhow::Result<[u8; 8]> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let cookie: [u8; 8] = rand::random();
    let mut frame = sess.start_snac_cached(conn, family::ICBM, icbm::OUTGOING, Some(dest.into()));
    frame
        .payload()
        .put_slice(&encode_channel2_request(cookie, dest, offer));
    sess.enqueue(frame.finish());

    let data = match offer {
        RendezvousOffer::DirectIm { addr } => CookieData::DirectIm {
            peer: dest.into(),
            addr: *addr,
        },
        RendezvousOffer::FileSend {
            addr,
            file_name,
            total_size,
            ..
        } => CookieData::FileTransfer {
            peer: dest.into(),
            addr: *addr,
            file_name: file_name.clone(),
            total_size: *total_size,
        },
        RendezvousOffer::FileGet { addr } => CookieData::FileTransfer {
            peer: dest.into(),
            addr: *addr,
            file_name: String::new(),
            total_size: 0,
        },
        RendezvousOffer::Voice => CookieData::Voice { peer: dest.into() },
        _ => CookieData::None,
    };
    sess.cookies.cache(cookie, offer.cookie_kind(), data);
    sess.requests.sweep(RequestCache::MAX_AGE);
    Ok(cookie)
}

/// Accept a rendezvous the peer proposed.
pub fn accept_rendezvous(
    sess: &mut Session,
    dest: &str,
    cookie: [u8; 8],
    cap: Capability,
) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let mut frame = sess.start_snac(conn, family::ICBM, icbm::OUTGOING);
    frame
        .payload()
        .put_slice(&encode_channel2_accept(cookie, dest, cap));
    sess.enqueue(frame.finish());
    Ok(())
}

/// Cancel a rendezvous we initiated, withdrawing the cached cookie.
pub fn cancel_rendezvous(
    sess: &mut Session,
    dest: &str,
    cookie: [u8; 8],
    reason: u16,
) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let cap = match sess.cookies.remove(&cookie) {
        Some(entry) => match entry.kind {
            CookieKind::DirectIm => Capability::DirectIm,
            CookieKind::FileSend => Capability::SendFile,
            CookieKind::FileGet => Capability::GetFile,
            CookieKind::Voice => Capability::Voice,
            CookieKind::ChatInvite => Capability::Chat,
            CookieKind::BuddyIcon => Capability::BuddyIcon,
            CookieKind::Message => {
                anyhow::bail!("cookie belongs to a plain message, not a rendezvous")
            }
        },
        None => anyhow::bail!("no rendezvous in flight for that cookie"),
    };
    let mut frame = sess.start_snac(conn, family::ICBM, icbm::OUTGOING);
    frame
        .payload()
        .put_slice(&encode_channel2_cancel(cookie, dest, cap, reason));
    sess.enqueue(frame.finish());
    Ok(())
}

/// Deny a rendezvous the peer proposed.
pub fn deny_rendezvous(
    sess: &mut Session,
    dest: &str,
    cookie: [u8; 8],
    reason: u16,
) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let mut frame = sess.start_snac(conn, family::ICBM, icbm::CLIENT_ERROR);
    frame.payload().put_slice(&encode_deny(cookie, dest, reason));
    sess.enqueue(frame.finish());
    Ok(())
}

/// Request ICBM parameter information.
pub fn request_params(sess: &mut Session) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let frame = sess.start_snac(conn, family::ICBM, icbm::PARAM_REQUEST);
    sess.enqueue(frame.finish());
    Ok(())
}

/// Push the server's stingy default parameters up to something usable.
pub fn set_params(
    sess: &mut Session,
    flags: u32,
    max_msg_len: u16,
    max_sender_warning: u16,
    max_receiver_warning: u16,
    min_interval: u32,
) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let mut frame = sess.start_snac(conn, family::ICBM, icbm::SET_PARAMS);
    let payload = frame.payload();
    payload.put_u16(0x0000); // channel: read-only, must be zero
    payload.put_u32(flags);
    payload.put_u16(max_msg_len);
    payload.put_u16(max_sender_warning);
    payload.put_u16(max_receiver_warning);
    payload.put_u32(min_interval);
    sess.enqueue(frame.finish());
    Ok(())
}

// ---- the module ------------------------------------------------------------

pub struct IcbmModule;

impl Module for IcbmModule {
    fn name(&self) -> &'static str {
        "messaging"
    }

    fn family(&self) -> u16 {
        family::ICBM
    }

    fn handle(
        &mut self,
        sess: &mut Session,
        _conn: ConnId,
        snac: &SnacHeader,
        body: &[u8],
    ) -> bool {
        match snac.subtype {
            icbm::PARAM_INFO => param_info(sess, body),
            icbm::INCOMING => incoming(sess, body),
            icbm::MISSED_CALLS => missed_calls(sess, body),
            icbm::CLIENT_ERROR => client_error(sess, body),
            icbm::HOST_ACK => host_ack(sess, body),
            icbm::ERROR => {
                let code = if body.len() >= 2 {
                    u16::from_be_bytes([body[0], body[1]])
                } else {
                    0
                };
                let about = sess.requests.take(snac.request_id);
                warn!(code, request = snac.request_id, ?about, "ICBM error");
                sess.emit(Event::MessageError {
                    cookie: [0; 8],
                    from: about.and_then(|r| r.target).unwrap_or_default(),
                    reason: code,
                });
            }
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel1_round_trip_plain() {
        let cookie = [7u8; 8];
        let body = encode_channel1(cookie, "bob", b"hi", &MessageOptions::default());
        let msg = decode_channel1(&body).unwrap();
        assert_eq!(msg.dest, "bob");
        assert_eq!(msg.body, b"hi");
        assert_eq!(msg.cookie, cookie);
        assert!(!msg.ack_requested);
        assert!(!msg.auto_response);
        assert_eq!(msg.charset, 0);
    }

    #[test]
    fn channel1_flags_encode() {
        let opts = MessageOptions {
            ack: true,
            auto_response: true,
            ..Default::default()
        };
        let body = encode_channel1([0; 8], "bob", b"brb", &opts);
        let msg = decode_channel1(&body).unwrap();
        assert!(msg.ack_requested);
        assert!(msg.auto_response);
    }

    #[test]
    fn channel1_wrong_channel_rejected() {
        let mut body = encode_channel1([0; 8], "bob", b"hi", &MessageOptions::default());
        body[9] = 0x02; // channel word
        assert!(decode_channel1(&body).is_err());
    }

    #[test]
    fn message_block_features_carry_fingerprint() {
        let body = encode_channel1([0; 8], "bob", b"hi", &MessageOptions::default());
        let tlvs = TlvChain::read_all(&body[8 + 2 + 1 + 3..]);
        let block = tlvs.get(0x0002, 1).unwrap();
        let (features, parts) = parse_message_block(&block.value);
        assert_eq!(features, DEFAULT_FEATURES);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].2, b"hi");
    }

    #[test]
    fn channel2_request_carries_capability_and_addr() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4443);
        let body = encode_channel2_request([3; 8], "bob", &RendezvousOffer::DirectIm { addr });
        // skip cookie + channel + name
        let tlvs = TlvChain::read_all(&body[8 + 2 + 1 + 3..]);
        let block = tlvs.get(0x0005, 1).unwrap();
        assert_eq!(&block.value[..2], &[0x00, 0x00]); // status: request
        assert_eq!(&block.value[2..10], &[3; 8]);
        assert_eq!(&block.value[10..26], &Capability::DirectIm.guid());
        let inner = TlvChain::read_all(&block.value[26..]);
        assert_eq!(inner.get(0x0003, 1).unwrap().value, vec![10, 0, 0, 5]);
        assert_eq!(inner.get_u16(0x0005, 1), Some(4443));
    }

    #[test]
    fn channel2_accept_has_no_payload_tlvs() {
        let body = encode_channel2_accept([3; 8], "bob", Capability::SendFile);
        let tlvs = TlvChain::read_all(&body[8 + 2 + 1 + 3..]);
        let block = tlvs.get(0x0005, 1).unwrap();
        assert_eq!(&block.value[..2], &[0x00, 0x02]); // status: accept
        assert_eq!(block.value.len(), 2 + 8 + 16);
    }

    #[test]
    fn deny_body_layout() {
        let body = encode_deny([1; 8], "eve", deny_reason::DECLINED);
        assert_eq!(&body[..8], &[1; 8]);
        assert_eq!(&body[8..10], &[0x00, 0x02]);
        assert_eq!(body[10] as usize, 3);
        let tlvs = TlvChain::read_all(&body[14..]);
        assert_eq!(tlvs.get_u16(0x0003, 1), Some(deny_reason::DECLINED));
    }
}
