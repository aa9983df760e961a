//! The standard user-info block embedded in many SNACs.
//!
//! Layout: length-prefixed screen name, 2-byte warning level, 2-byte TLV
//! count, then exactly that many TLVs of user attributes. The block sits
//! flush against unrelated TLVs in the enclosing message, so the count — not
//! a terminator — bounds the parse.

use bytes::Buf;
use tracing::debug;

use crate::caps::{self, Capability};
use crate::error::ProtoError;

bitflags::bitflags! {
    /// User class flags from TLV 0x0001.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UserFlags: u16 {
        const UNCONFIRMED = 0x0001;
        const ADMINISTRATOR = 0x0002;
        const AOL = 0x0004;
        const PAY = 0x0008;
        const FREE = 0x0010;
        const AWAY = 0x0020;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    pub screen_name: String,
    pub warning_level: u16,
    pub flags: UserFlags,
    pub member_since: Option<u32>,
    pub online_since: Option<u32>,
    pub idle_minutes: Option<u16>,
    pub session_len: Option<u32>,
    pub capabilities: Vec<Capability>,
}

impl UserInfo {
    /// Parse a user-info block from the front of `buf`, advancing it past
    /// the block so the caller can continue with the trailing TLVs.
    pub fn read(buf: &mut &[u8]) -> Result<UserInfo, ProtoError> {
        if buf.is_empty() {
            return Err(ProtoError::truncated("user info", 1, 0));
        }
        let name_len = buf[0] as usize;
        if buf.len() < 1 + name_len + 4 {
            return Err(ProtoError::truncated(
                "user info",
                1 + name_len + 4,
                buf.len(),
            ));
        }
        let mut info = UserInfo {
            screen_name: String::from_utf8_lossy(&buf[1..1 + name_len]).into_owned(),
            ..Default::default()
        };
        buf.advance(1 + name_len);
        info.warning_level = buf.get_u16();
        let tlv_count = buf.get_u16();

        let mut seen_flags = false;
        let mut parsed = 0u16;
        while parsed < tlv_count {
            if buf.len() < 4 {
                // Counted TLVs ran past the message; take what we have.
                debug!(parsed, expected = tlv_count, "short user-info block");
                break;
            }
            let kind = buf.get_u16();
            if kind == 0x0000 {
                // A bare 0x0000 type is two bytes of padding with no length;
                // it does not count toward the total.
                continue;
            }
            let len = buf.get_u16() as usize;
            if buf.len() < len {
                debug!(kind, len, have = buf.len(), "truncated user-info TLV");
                break;
            }
            let value = &buf[..len];
            let val_u16 = || u16::from_be_bytes([value[0], value[1]]);
            let val_u32 = || u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            match kind {
                // Only the first flags TLV is authoritative.
                0x0001 if !seen_flags && len >= 2 => {
                    info.flags = UserFlags::from_bits_truncate(val_u16());
                    seen_flags = true;
                }
                0x0001 => {}
                0x0002 if len >= 4 => info.member_since = Some(val_u32()),
                0x0003 if len >= 4 => info.online_since = Some(val_u32()),
                0x0004 if len >= 2 => info.idle_minutes = Some(val_u16()),
                0x000d => info.capabilities = caps::read_block(value),
                0x000f | 0x0010 if len >= 4 => info.session_len = Some(val_u32()),
                _ => debug!(kind, len, "unhandled user-info TLV"),
            }
            buf.advance(len);
            parsed += 1;
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn sample_block() -> BytesMut {
        let mut b = BytesMut::new();
        b.put_u8(4);
        b.put_slice(b"fred");
        b.put_u16(30); // warning level
        b.put_u16(3); // tlv count
        b.put_u16(0x0001);
        b.put_u16(2);
        b.put_u16(0x0010 | 0x0020); // free + away
        b.put_u16(0x0000); // padding, not counted
        b.put_u16(0x0000);
        b.put_u16(0x0004);
        b.put_u16(2);
        b.put_u16(12); // idle
        b.put_u16(0x000f);
        b.put_u16(4);
        b.put_u32(3600);
        b
    }

    #[test]
    fn parses_fixed_and_tlv_fields() {
        let block = sample_block();
        let mut cursor = &block[..];
        let info = UserInfo::read(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(info.screen_name, "fred");
        assert_eq!(info.warning_level, 30);
        assert_eq!(info.flags, UserFlags::FREE | UserFlags::AWAY);
        assert_eq!(info.idle_minutes, Some(12));
        assert_eq!(info.session_len, Some(3600));
    }

    #[test]
    fn trailing_bytes_left_for_caller() {
        let mut block = sample_block();
        block.put_slice(&[0xca, 0xfe]);
        let mut cursor = &block[..];
        let _ = UserInfo::read(&mut cursor).unwrap();
        assert_eq!(cursor, &[0xca, 0xfe]);
    }

    #[test]
    fn first_flags_tlv_wins() {
        let mut b = BytesMut::new();
        b.put_u8(1);
        b.put_slice(b"x");
        b.put_u16(0);
        b.put_u16(2);
        for flags in [0x0020u16, 0x0002] {
            b.put_u16(0x0001);
            b.put_u16(2);
            b.put_u16(flags);
        }
        let info = UserInfo::read(&mut &b[..]).unwrap();
        assert_eq!(info.flags, UserFlags::AWAY);
    }
}
