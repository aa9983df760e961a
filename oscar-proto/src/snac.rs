//! SNAC headers — the (family, subtype, flags, request-id) routing header
//! carried in the first 10 bytes of every channel-2 FLAP payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;

/// Byte length of an encoded SNAC header.
pub const SNAC_HEADER_LEN: usize = 10;

/// Protocol family identifiers the engine routes on.
pub mod family {
    pub const OSERVICE: u16 = 0x0001;
    pub const LOCATE: u16 = 0x0002;
    pub const BUDDY: u16 = 0x0003;
    pub const ICBM: u16 = 0x0004;
    pub const ADMIN: u16 = 0x0007;
    pub const CHATNAV: u16 = 0x000d;
    pub const CHAT: u16 = 0x000e;
}

/// OSERVICE subtypes used by the engine.
pub mod oservice {
    pub const ERROR: u16 = 0x0001;
    pub const CLIENT_READY: u16 = 0x0002;
    pub const SERVER_READY: u16 = 0x0003;
    pub const RATE_REQUEST: u16 = 0x0006;
    pub const RATE_INFO: u16 = 0x0007;
    pub const RATE_ACK: u16 = 0x0008;
    pub const PAUSE: u16 = 0x000b;
    pub const RESUME: u16 = 0x000d;
    pub const SELF_INFO_REQUEST: u16 = 0x000e;
    pub const SELF_INFO: u16 = 0x000f;
    pub const EVIL_NOTICE: u16 = 0x0010;
    pub const SET_IDLE: u16 = 0x0011;
    pub const MIGRATE: u16 = 0x0012;
    pub const MOTD: u16 = 0x0013;
    pub const NOP: u16 = 0x0016;
}

/// ICBM subtypes.
pub mod icbm {
    pub const ERROR: u16 = 0x0001;
    pub const SET_PARAMS: u16 = 0x0002;
    pub const PARAM_REQUEST: u16 = 0x0004;
    pub const PARAM_INFO: u16 = 0x0005;
    pub const OUTGOING: u16 = 0x0006;
    pub const INCOMING: u16 = 0x0007;
    pub const EVIL_REQUEST: u16 = 0x0008;
    pub const MISSED_CALLS: u16 = 0x000a;
    pub const CLIENT_ERROR: u16 = 0x000b;
    pub const HOST_ACK: u16 = 0x000c;
}

/// BUDDY subtypes.
pub mod buddy {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const RIGHTS: u16 = 0x0003;
    pub const ADD: u16 = 0x0004;
    pub const REMOVE: u16 = 0x0005;
    pub const ONCOMING: u16 = 0x000b;
    pub const OFFGOING: u16 = 0x000c;
}

/// ADMIN subtypes.
pub mod admin {
    pub const INFO_REQUEST: u16 = 0x0002;
    pub const INFO_REPLY: u16 = 0x0003;
    pub const INFO_CHANGE_REQUEST: u16 = 0x0004;
    pub const INFO_CHANGE_REPLY: u16 = 0x0005;
    pub const CONFIRM_REQUEST: u16 = 0x0006;
    pub const CONFIRM_REPLY: u16 = 0x0007;
}

/// CHATNAV subtypes.
pub mod chatnav {
    pub const RIGHTS_REQUEST: u16 = 0x0002;
    pub const INFO: u16 = 0x0009;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnacHeader {
    pub family: u16,
    pub subtype: u16,
    pub flags: u16,
    pub request_id: u32,
}

impl SnacHeader {
    pub fn new(family: u16, subtype: u16, request_id: u32) -> Self {
        SnacHeader {
            family,
            subtype,
            flags: 0,
            request_id,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.family);
        out.put_u16(self.subtype);
        out.put_u16(self.flags);
        out.put_u32(self.request_id);
    }

    /// Split a channel-2 payload into its SNAC header and body.
    pub fn decode(payload: &[u8]) -> Result<(SnacHeader, &[u8]), ProtoError> {
        if payload.len() < SNAC_HEADER_LEN {
            return Err(ProtoError::truncated(
                "SNAC header",
                SNAC_HEADER_LEN,
                payload.len(),
            ));
        }
        let mut buf = payload;
        let hdr = SnacHeader {
            family: buf.get_u16(),
            subtype: buf.get_u16(),
            flags: buf.get_u16(),
            request_id: buf.get_u32(),
        };
        Ok((hdr, &payload[SNAC_HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = SnacHeader {
            family: family::ICBM,
            subtype: icbm::INCOMING,
            flags: 0,
            request_id: 0xdead_beef,
        };
        let mut out = BytesMut::new();
        hdr.encode(&mut out);
        out.put_slice(b"body");

        let (got, body) = SnacHeader::decode(&out).unwrap();
        assert_eq!(got, hdr);
        assert_eq!(body, b"body");
    }

    #[test]
    fn short_payload_is_truncated() {
        assert!(matches!(
            SnacHeader::decode(&[0; 9]),
            Err(ProtoError::Truncated { .. })
        ));
    }
}
