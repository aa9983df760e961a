//! CHATNAV — chat/rendezvous navigation (family 0x000D). Only the rights
//! exchange is decoded; room management itself rides the CHAT family.

use oscar_proto::snac::{chatnav, family, SnacHeader};
use oscar_proto::tlv::TlvChain;
use tracing::debug;

use crate::conn::{ConnId, ConnType};
use crate::dispatch::Module;
use crate::event::Event;
use crate::session::Session;

/// Request chat navigation rights.
pub fn request_rights(sess: &mut Session) -> anyhow::Result<()> {
    let conn = sess
        .find_by_type(ConnType::ChatNav)
        .or_else(|| sess.find_by_type(ConnType::Bos))
        .ok_or_else(|| anyhow::anyhow!("no chatnav connection"))?;
    let frame = sess.start_snac(conn, family::CHATNAV, chatnav::RIGHTS_REQUEST);
    sess.enqueue(frame.finish());
    Ok(())
}

fn info(sess: &mut Session, body: &[u8]) {
    let tlvs = TlvChain::read_all(body);
    let max_rooms = tlvs.get_u8(0x0002, 1).unwrap_or(0);
    debug!(max_rooms, tlvs = tlvs.len(), "chatnav info");
    sess.emit(Event::ChatNavInfo { max_rooms });
}

pub struct ChatNavModule;

impl Module for ChatNavModule {
    fn name(&self) -> &'static str {
        "chatnav"
    }

    fn family(&self) -> u16 {
        family::CHATNAV
    }

    fn handle(
        &mut self,
        sess: &mut Session,
        _conn: ConnId,
        snac: &SnacHeader,
        body: &[u8],
    ) -> bool {
        match snac.subtype {
            chatnav::INFO => info(sess, body),
            _ => return false,
        }
        true
    }
}
