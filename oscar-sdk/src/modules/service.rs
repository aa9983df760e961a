//! OSERVICE — the generic-service family (0x0001) on every control
//! connection: the server-ready / client-ready handshake, rate limiting,
//! pause/resume/migration notices, warning-level changes, MOTD.

use std::collections::HashMap;

use bytes::Buf;
use oscar_proto::snac::{family, oservice, SnacHeader};
use oscar_proto::tlv::TlvChain;
use oscar_proto::userinfo::UserInfo;
use tracing::{debug, warn};

use crate::conn::ConnId;
use crate::dispatch::Module;
use crate::event::Event;
use crate::session::Session;

/// Protocol versions and tool builds advertised in client-ready, per family.
/// Servers use these to pick feature sets; the values are the classic
/// WinAIM-compatible ones.
const FAMILY_VERSIONS: &[(u16, u16, u16, u16)] = &[
    (family::OSERVICE, 0x0003, 0x0110, 0x047b),
    (family::LOCATE, 0x0001, 0x0110, 0x047b),
    (family::BUDDY, 0x0001, 0x0110, 0x047b),
    (family::ICBM, 0x0001, 0x0110, 0x047b),
    (family::ADMIN, 0x0001, 0x0110, 0x047b),
    (family::CHATNAV, 0x0001, 0x0110, 0x047b),
    (family::CHAT, 0x0001, 0x0110, 0x047b),
];

/// Send client-ready, quoting versions for the families the server listed
/// in server-ready (and that we actually implement).
pub fn send_client_ready(sess: &mut Session, conn: ConnId, server_families: &[u16]) {
    let mut frame = sess.start_snac(conn, family::OSERVICE, oservice::CLIENT_READY);
    {
        use bytes::BufMut;
        let payload = frame.payload();
        for &(fam, version, toolid, toolversion) in FAMILY_VERSIONS {
            if !server_families.contains(&fam) {
                continue;
            }
            payload.put_u16(fam);
            payload.put_u16(version);
            payload.put_u16(toolid);
            payload.put_u16(toolversion);
        }
    }
    sess.enqueue(frame.finish());
}

/// Request rate information (0x0001/0x0006).
pub fn request_rates(sess: &mut Session, conn: ConnId) {
    let frame = sess.start_snac(conn, family::OSERVICE, oservice::RATE_REQUEST);
    sess.enqueue(frame.finish());
}

/// Report our idle time to the server; zero marks us active again.
pub fn set_idle(sess: &mut Session, conn: ConnId, idle_secs: u32) {
    let mut frame = sess.start_snac(conn, family::OSERVICE, oservice::SET_IDLE);
    {
        use bytes::BufMut;
        frame.payload().put_u32(idle_secs);
    }
    sess.enqueue(frame.finish());
}

/// Acknowledge the rate classes the server sent.
fn send_rates_ack(sess: &mut Session, conn: ConnId, classes: &[u16]) {
    let mut frame = sess.start_snac(conn, family::OSERVICE, oservice::RATE_ACK);
    {
        use bytes::BufMut;
        let payload = frame.payload();
        for &class in classes {
            payload.put_u16(class);
        }
    }
    sess.enqueue(frame.finish());
}

fn parse_server_families(body: &[u8]) -> Vec<u16> {
    let mut families = Vec::with_capacity(body.len() / 2);
    let mut buf = body;
    while buf.len() >= 2 {
        families.push(buf.get_u16());
    }
    families
}

fn evil_notice(sess: &mut Session, body: &[u8]) {
    if body.len() < 2 {
        return;
    }
    let mut buf = body;
    let level = buf.get_u16();
    let by = if !buf.is_empty() {
        UserInfo::read(&mut buf).ok()
    } else {
        None
    };
    sess.emit(Event::WarningLevel { level, by });
}

fn self_info(sess: &mut Session, body: &[u8]) {
    let mut buf = body;
    match UserInfo::read(&mut buf) {
        Ok(info) => sess.emit(Event::SelfInfo(info)),
        Err(e) => warn!(error = %e, "bad self-info block"),
    }
}

fn migrate(sess: &mut Session, conn: ConnId, body: &[u8]) {
    // Count of families being migrated, the families, then TLVs with the
    // new host (0x0005) and auth cookie (0x0006).
    let mut buf = body;
    if buf.len() < 2 {
        return;
    }
    let count = buf.get_u16() as usize;
    if buf.len() < count * 2 {
        return;
    }
    buf.advance(count * 2);
    let tlvs = TlvChain::read_all(buf);
    sess.emit(Event::Migrate {
        conn,
        host: tlvs.get_str(0x0005, 1),
    });
}

fn motd(sess: &mut Session, body: &[u8]) {
    if body.len() < 2 {
        return;
    }
    let kind = u16::from_be_bytes([body[0], body[1]]);
    let tlvs = TlvChain::read_all(&body[2..]);
    sess.emit(Event::Motd {
        kind,
        text: tlvs.get_str(0x000b, 1),
    });
}

#[derive(Default)]
pub struct ServiceModule {
    /// Families each server connection announced, held until the rate
    /// handshake completes and client-ready goes out.
    server_families: HashMap<ConnId, Vec<u16>>,
}

impl ServiceModule {
    fn server_ready(&mut self, sess: &mut Session, conn: ConnId, body: &[u8]) {
        let families = parse_server_families(body);
        debug!(conn = %conn, ?families, "server ready");
        self.server_families.insert(conn, families.clone());
        // Kick off the rate handshake; client-ready follows once rates are
        // acknowledged.
        request_rates(sess, conn);
        sess.emit(Event::ServerReady { conn, families });
    }

    fn rate_info(&mut self, sess: &mut Session, conn: ConnId, body: &[u8]) {
        if body.len() < 2 {
            return;
        }
        let mut buf = body;
        let count = buf.get_u16();
        // Rate classes are acked wholesale; the engine's only throttle is
        // the per-connection forced-latency valve.
        let classes: Vec<u16> = (1..=count).collect();
        send_rates_ack(sess, conn, &classes);
        if let Some(families) = self.server_families.remove(&conn) {
            send_client_ready(sess, conn, &families);
        }
        sess.emit(Event::RateInfo {
            conn,
            classes: count,
        });
    }
}

impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn family(&self) -> u16 {
        family::OSERVICE
    }

    fn handle(
        &mut self,
        sess: &mut Session,
        conn: ConnId,
        snac: &SnacHeader,
        body: &[u8],
    ) -> bool {
        match snac.subtype {
            oservice::SERVER_READY => self.server_ready(sess, conn, body),
            oservice::RATE_INFO => self.rate_info(sess, conn, body),
            oservice::PAUSE => sess.emit(Event::ServerPaused { conn }),
            oservice::RESUME => sess.emit(Event::ServerResumed { conn }),
            oservice::EVIL_NOTICE => evil_notice(sess, body),
            oservice::SELF_INFO => self_info(sess, body),
            oservice::MIGRATE => migrate(sess, conn, body),
            oservice::MOTD => motd(sess, body),
            oservice::ERROR => {
                let code = if body.len() >= 2 {
                    u16::from_be_bytes([body[0], body[1]])
                } else {
                    0
                };
                warn!(conn = %conn, code, "service error");
            }
            _ => return false,
        }
        true
    }
}
