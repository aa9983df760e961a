//! End-to-end engine tests: frames in, decoded events out, with no sockets
//! involved. Frames are crafted the way the wire carries them and fed
//! through `push_incoming` + `dispatch_incoming`, the same path the reader
//! tasks use.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use oscar_proto::caps::Capability;
use oscar_proto::flap::{FlapChannel, FlapFrame};
use oscar_proto::snac::{family, icbm, SnacHeader};
use oscar_sdk::conn::ConnType;
use oscar_sdk::{
    Event, MessageOptions, RendezvousOffer, RendezvousPayload, Session, SessionConfig, WireFrame,
    SUBTYPE_DEFAULT,
};

fn new_session() -> (Session, tokio::sync::mpsc::UnboundedReceiver<Event>) {
    Session::new(SessionConfig {
        screen_name: "fred".into(),
        ..Default::default()
    })
}

fn snac_frame(fam: u16, subtype: u16, body: &[u8]) -> WireFrame {
    let mut payload = BytesMut::new();
    SnacHeader::new(fam, subtype, 0x1234).encode(&mut payload);
    payload.put_slice(body);
    WireFrame::Flap(FlapFrame::new(FlapChannel::Snac, payload.to_vec()))
}

/// A user-info block with no attribute TLVs.
fn userinfo_block(name: &str) -> Vec<u8> {
    let mut block = BytesMut::new();
    block.put_u8(name.len() as u8);
    block.put_slice(name.as_bytes());
    block.put_u16(0); // warning level
    block.put_u16(0); // tlv count
    block.to_vec()
}

/// An incoming-format channel-1 ICBM: cookie, channel, sender info, then
/// the message TLV.
fn incoming_message_frame(from: &str, body: &[u8], cookie: [u8; 8]) -> WireFrame {
    let mut icbm_body = BytesMut::new();
    icbm_body.put_slice(&cookie);
    icbm_body.put_u16(0x0001);
    icbm_body.put_slice(&userinfo_block(from));

    let features = [0x01, 0x01, 0x01, 0x02];
    let msg_len = 2 + 2 + features.len() + 2 + 2 + 4 + body.len();
    icbm_body.put_u16(0x0002);
    icbm_body.put_u16(msg_len as u16);
    icbm_body.put_u8(0x05);
    icbm_body.put_u8(0x01);
    icbm_body.put_u16(features.len() as u16);
    icbm_body.put_slice(&features);
    icbm_body.put_u16(0x0101);
    icbm_body.put_u16((body.len() + 4) as u16);
    icbm_body.put_u16(0x0000); // charset: ascii
    icbm_body.put_u16(0x0000);
    icbm_body.put_slice(body);

    snac_frame(family::ICBM, icbm::INCOMING, &icbm_body)
}

/// A bare channel-2 message (status + cookie + capability, no payload TLVs).
fn bare_rendezvous_frame(from: &str, cookie: [u8; 8], status: u16, cap: Capability) -> WireFrame {
    let mut block = BytesMut::new();
    block.put_u16(status);
    block.put_slice(&cookie);
    block.put_slice(&cap.guid());

    let mut icbm_body = BytesMut::new();
    icbm_body.put_slice(&cookie);
    icbm_body.put_u16(0x0002);
    icbm_body.put_slice(&userinfo_block(from));
    icbm_body.put_u16(0x0005);
    icbm_body.put_u16(block.len() as u16);
    icbm_body.put_slice(&block);

    snac_frame(family::ICBM, icbm::INCOMING, &icbm_body)
}

fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

#[test]
fn exact_handler_is_invoked_exactly_once() {
    let (mut sess, _events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    let exact = Arc::new(AtomicU32::new(0));
    let fallback = Arc::new(AtomicU32::new(0));
    let exact2 = exact.clone();
    let fallback2 = fallback.clone();
    sess.register_handler(
        0x0004,
        0x0007,
        Box::new(move |_, _, _, _| {
            exact2.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );
    sess.register_handler(
        0x0004,
        SUBTYPE_DEFAULT,
        Box::new(move |_, _, _, _| {
            fallback2.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );

    sess.push_incoming(conn, snac_frame(0x0004, 0x0007, b""));
    sess.dispatch_incoming();

    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.load(Ordering::SeqCst), 0);
}

#[test]
fn unregistered_subtype_falls_back_to_family_default() {
    let (mut sess, _events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    let fallback = Arc::new(AtomicU32::new(0));
    let fallback2 = fallback.clone();
    sess.register_handler(
        0x0004,
        SUBTYPE_DEFAULT,
        Box::new(move |_, _, _, _| {
            fallback2.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );

    sess.push_incoming(conn, snac_frame(0x0004, 0x00ee, b""));
    sess.dispatch_incoming();
    assert_eq!(fallback.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_family_lands_in_the_catch_all_without_error() {
    let (mut sess, _events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    // No handler, no module: the catch-all logger consumes it.
    sess.push_incoming(conn, snac_frame(0x00f3, 0x0001, &[0xde, 0xad, 0xbe, 0xef]));
    sess.dispatch_incoming();
    assert_eq!(sess.incoming_len(), 0);
}

#[test]
fn closing_a_connection_purges_its_queued_frames() {
    let (mut sess, _events) = new_session();
    let doomed = sess.alloc_connection(ConnType::Chat);
    let survivor = sess.alloc_connection(ConnType::Bos);

    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();
    sess.register_handler(
        0x000e,
        SUBTYPE_DEFAULT,
        Box::new(move |_, _, _, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );

    sess.push_incoming(doomed, snac_frame(0x000e, 0x0001, b""));
    sess.push_incoming(doomed, snac_frame(0x000e, 0x0002, b""));
    sess.push_incoming(survivor, snac_frame(0x0004, 0x0007, b""));
    sess.close_connection(doomed, "test");
    sess.dispatch_incoming();

    // Zero dispatches referenced the closed connection.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sess.incoming_len(), 0);
}

#[test]
fn dispatch_is_not_reentrant() {
    let (mut sess, _events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();
    sess.register_handler(
        0x0009,
        SUBTYPE_DEFAULT,
        Box::new(move |sess, _, _, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
            // A handler triggering dispatch must be a no-op; the outer pass
            // finishes the queue.
            sess.dispatch_incoming();
            true
        }),
    );

    sess.push_incoming(conn, snac_frame(0x0009, 0x0001, b""));
    sess.push_incoming(conn, snac_frame(0x0009, 0x0002, b""));
    sess.dispatch_incoming();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn incoming_message_decodes_to_an_event() {
    let (mut sess, mut events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    sess.push_incoming(conn, incoming_message_frame("bob", b"hi", [9; 8]));
    sess.dispatch_incoming();

    let got = drain(&mut events);
    let msg = got
        .iter()
        .find_map(|ev| match ev {
            Event::Message(m) => Some(m),
            _ => None,
        })
        .expect("a Message event");
    assert_eq!(msg.from.screen_name, "bob");
    assert_eq!(msg.body, b"hi");
    assert!(!msg.ack_requested);
    assert!(!msg.auto_response);
}

#[test]
fn rendezvous_accept_resolves_through_the_cookie_cache() {
    let (mut sess, mut events) = new_session();
    let bos = sess.alloc_connection(ConnType::Bos);
    let _ = bos;

    // Initiate a direct-IM rendezvous; this caches the cookie.
    let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4443);
    let cookie = oscar_sdk::modules::icbm::initiate_rendezvous(
        &mut sess,
        "bob",
        &RendezvousOffer::DirectIm { addr },
    )
    .unwrap();
    assert_eq!(sess.cookies_len(), 1);

    // The peer answers with a bare accept quoting the same cookie.
    let conn = sess.find_by_type(ConnType::Bos).unwrap();
    sess.push_incoming(
        conn,
        bare_rendezvous_frame("bob", cookie, 0x0002, Capability::DirectIm),
    );
    sess.dispatch_incoming();

    let got = drain(&mut events);
    assert!(got.iter().any(|ev| matches!(
        ev,
        Event::RendezvousAccepted { cookie: c, kind } if *c == cookie && *kind == oscar_sdk::CookieKind::DirectIm
    )));
    // The negotiation is concluded; the entry is gone.
    assert_eq!(sess.cookies_len(), 0);
}

#[test]
fn rendezvous_ack_for_unknown_cookie_is_dropped() {
    let (mut sess, mut events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    sess.push_incoming(
        conn,
        bare_rendezvous_frame("mallory", [0xab; 8], 0x0002, Capability::SendFile),
    );
    sess.dispatch_incoming();

    // A protocol anomaly: logged, dropped, and no event emitted.
    let got = drain(&mut events);
    assert!(got
        .iter()
        .all(|ev| !matches!(ev, Event::RendezvousAccepted { .. })));
}

#[test]
fn file_send_request_surfaces_the_offer() {
    let (mut sess, mut events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    // Build a full channel-2 file-send request.
    let cookie = [4u8; 8];
    let mut inner = oscar_proto::tlv::TlvChain::new();
    inner.add_u16(0x000a, 0x0001);
    inner.add_raw(0x0003, &[10, 0, 0, 9]);
    inner.add_u16(0x0005, 5190);
    inner.add_str(0x000c, "holiday photos");
    let mut payload = BytesMut::new();
    payload.put_u16(0x0001);
    payload.put_u16(1);
    payload.put_u32(123_456);
    payload.put_slice(b"pics.zip\0");
    inner.add_raw(0x2711, &payload);

    let mut block = BytesMut::new();
    block.put_u16(0x0000); // request
    block.put_slice(&cookie);
    block.put_slice(&Capability::SendFile.guid());
    inner.write(&mut block);

    let mut icbm_body = BytesMut::new();
    icbm_body.put_slice(&cookie);
    icbm_body.put_u16(0x0002);
    icbm_body.put_slice(&userinfo_block("bob"));
    icbm_body.put_u16(0x0005);
    icbm_body.put_u16(block.len() as u16);
    icbm_body.put_slice(&block);

    sess.push_incoming(conn, snac_frame(family::ICBM, icbm::INCOMING, &icbm_body));
    sess.dispatch_incoming();

    let got = drain(&mut events);
    let (from, payload) = got
        .iter()
        .find_map(|ev| match ev {
            Event::RendezvousRequest { from, payload, .. } => Some((from, payload)),
            _ => None,
        })
        .expect("a RendezvousRequest event");
    assert_eq!(from.screen_name, "bob");
    match payload {
        RendezvousPayload::FileSend {
            addr,
            file_name,
            total_size,
            description,
            file_count,
        } => {
            assert_eq!(*addr, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 5190));
            assert_eq!(file_name, "pics.zip");
            assert_eq!(*total_size, 123_456);
            assert_eq!(description.as_deref(), Some("holiday photos"));
            assert_eq!(*file_count, 1);
        }
        other => panic!("wrong payload: {other:?}"),
    }
}

#[test]
fn send_message_queues_a_frame_and_caches_the_cookie() {
    let (mut sess, _events) = new_session();
    sess.alloc_connection(ConnType::Bos);

    let cookie =
        oscar_sdk::modules::icbm::send_message(&mut sess, "bob", b"hi", &MessageOptions::default())
            .unwrap();
    assert_eq!(sess.outgoing_len(), 1);
    assert_ne!(cookie, [0; 8]);
    assert_eq!(sess.cookies_len(), 1);
}

#[test]
fn channel4_close_becomes_a_conn_error_and_disconnect() {
    let (mut sess, mut events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    let mut tlvs = oscar_proto::tlv::TlvChain::new();
    tlvs.add_u16(0x0009, 0x0018);
    tlvs.add_str(0x000b, "rate limit exceeded");
    let mut payload = BytesMut::new();
    tlvs.write(&mut payload);
    sess.push_incoming(
        conn,
        WireFrame::Flap(FlapFrame::new(FlapChannel::Close, payload.to_vec())),
    );
    sess.dispatch_incoming();

    let got = drain(&mut events);
    assert!(got.iter().any(|ev| matches!(
        ev,
        Event::ConnError { code: Some(0x0018), message: Some(m), .. } if m == "rate limit exceeded"
    )));
    assert!(got
        .iter()
        .any(|ev| matches!(ev, Event::Disconnected { .. })));
}

#[test]
fn server_ready_triggers_the_rate_handshake() {
    let (mut sess, mut events) = new_session();
    let conn = sess.alloc_connection(ConnType::Bos);

    let mut families = BytesMut::new();
    for fam in [0x0001u16, 0x0002, 0x0003, 0x0004] {
        families.put_u16(fam);
    }
    sess.push_incoming(conn, snac_frame(0x0001, 0x0003, &families));
    sess.dispatch_incoming();

    // The engine answered with a rate-info request.
    assert_eq!(sess.outgoing_len(), 1);
    let got = drain(&mut events);
    assert!(got.iter().any(|ev| matches!(
        ev,
        Event::ServerReady { families, .. } if families.len() == 4
    )));
}
