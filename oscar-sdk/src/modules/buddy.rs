//! BUDDY — presence notifications (family 0x0003): oncoming and offgoing
//! buddies, plus the rights limits.

use bytes::BufMut;
use oscar_proto::snac::{buddy, family, SnacHeader};
use oscar_proto::tlv::TlvChain;
use oscar_proto::userinfo::UserInfo;
use tracing::warn;

use crate::conn::{ConnId, ConnType};
use crate::dispatch::Module;
use crate::event::Event;
use crate::session::Session;

/// Ask the server for buddy-list limits.
pub fn request_rights(sess: &mut Session) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let frame = sess.start_snac(conn, family::BUDDY, buddy::RIGHTS_REQUEST);
    sess.enqueue(frame.finish());
    Ok(())
}

/// Start watching `names` for presence changes.
pub fn add_buddies(sess: &mut Session, names: &[&str]) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let mut frame = sess.start_snac(conn, family::BUDDY, buddy::ADD);
    {
        let payload = frame.payload();
        for name in names {
            payload.put_u8(name.len() as u8);
            payload.put_slice(name.as_bytes());
        }
    }
    sess.enqueue(frame.finish());
    Ok(())
}

/// Stop watching `names`.
pub fn remove_buddies(sess: &mut Session, names: &[&str]) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Bos)
        .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
    let mut frame = sess.start_snac(conn, family::BUDDY, buddy::REMOVE);
    {
        let payload = frame.payload();
        for name in names {
            payload.put_u8(name.len() as u8);
            payload.put_slice(name.as_bytes());
        }
    }
    sess.enqueue(frame.finish());
    Ok(())
}

fn oncoming(sess: &mut Session, body: &[u8]) {
    let mut buf = body;
    match UserInfo::read(&mut buf) {
        Ok(info) => sess.emit(Event::BuddyOnline(info)),
        Err(e) => warn!(error = %e, "bad oncoming-buddy block"),
    }
}

fn offgoing(sess: &mut Session, body: &[u8]) {
    // Offgoing carries a full user-info block too, but only the name still
    // means anything by the time it arrives.
    let mut buf = body;
    match UserInfo::read(&mut buf) {
        Ok(info) => sess.emit(Event::BuddyOffline {
            screen_name: info.screen_name,
        }),
        Err(e) => warn!(error = %e, "bad offgoing-buddy block"),
    }
}

fn rights(sess: &mut Session, body: &[u8]) {
    let tlvs = TlvChain::read_all(body);
    sess.emit(Event::BuddyRights {
        max_buddies: tlvs.get_u16(0x0001, 1).unwrap_or(0),
        max_watchers: tlvs.get_u16(0x0002, 1).unwrap_or(0),
    });
}

pub struct BuddyModule;

impl Module for BuddyModule {
    fn name(&self) -> &'static str {
        "buddylist"
    }

    fn family(&self) -> u16 {
        family::BUDDY
    }

    fn handle(
        &mut self,
        sess: &mut Session,
        _conn: ConnId,
        snac: &SnacHeader,
        body: &[u8],
    ) -> bool {
        match snac.subtype {
            buddy::RIGHTS => rights(sess, body),
            buddy::ONCOMING => oncoming(sess, body),
            buddy::OFFGOING => offgoing(sess, body),
            _ => return false,
        }
        true
    }
}
