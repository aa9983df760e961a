//! ADMIN — account administration (family 0x0007): info requests and the
//! confirm-account flow.

use bytes::BufMut;
use oscar_proto::snac::{admin, family, SnacHeader};
use tracing::debug;

use crate::conn::{ConnId, ConnType};
use crate::dispatch::Module;
use crate::event::Event;
use crate::session::Session;

/// What to ask the admin service about.
#[derive(Debug, Clone, Copy)]
pub enum InfoKind {
    Nickname,
    Email,
}

impl InfoKind {
    fn tlv(self) -> u16 {
        match self {
            InfoKind::Nickname => 0x0001,
            InfoKind::Email => 0x0011,
        }
    }
}

/// Request account information from the auth connection.
pub fn request_info(sess: &mut Session, kind: InfoKind) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Auth)
        .ok_or_else(|| anyhow::anyhow!("no admin connection"))?;
    let mut frame = sess.start_snac(conn, family::ADMIN, admin::INFO_REQUEST);
    {
        let payload = frame.payload();
        payload.put_u16(kind.tlv());
        payload.put_u16(0x0000);
    }
    sess.enqueue(frame.finish());
    Ok(())
}

/// Ask the server to resend the confirmation mail.
pub fn request_account_confirm(sess: &mut Session) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::Auth)
        .ok_or_else(|| anyhow::anyhow!("no admin connection"))?;
    let frame = sess.start_snac(conn, family::ADMIN, admin::CONFIRM_REQUEST);
    sess.enqueue(frame.finish());
    Ok(())
}

fn reply(sess: &mut Session, subtype: u16, body: &[u8]) {
    let permissions = if body.len() >= 2 {
        u16::from_be_bytes([body[0], body[1]])
    } else {
        0
    };
    debug!(subtype, permissions, "admin reply");
    sess.emit(Event::AdminReply {
        subtype,
        permissions,
    });
}

pub struct AdminModule;

impl Module for AdminModule {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn family(&self) -> u16 {
        family::ADMIN
    }

    fn handle(
        &mut self,
        sess: &mut Session,
        _conn: ConnId,
        snac: &SnacHeader,
        body: &[u8],
    ) -> bool {
        match snac.subtype {
            admin::INFO_REPLY | admin::INFO_CHANGE_REPLY | admin::CONFIRM_REPLY => {
                reply(sess, snac.subtype, body)
            }
            _ => return false,
        }
        true
    }
}
