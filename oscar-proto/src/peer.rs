//! Peer (rendezvous) framing — the envelope spoken on direct client-to-client
//! sockets, distinct from FLAP.
//!
//! Wire layout: a 4-byte magic tag (`ODC2` for direct IM, `OFT2` for file
//! transfer), a 2-byte big-endian length covering the whole frame header
//! (magic and length field included), then the type-specific header bytes.
//! Direct-IM frames additionally carry a message body after the header whose
//! length is declared inside the header, so the transport reads it
//! separately.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;

/// Fixed size of an encoded direct-IM header, magic and length included.
pub const ODC_HEADER_LEN: usize = 76;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMagic {
    /// `ODC2` — direct IM.
    Odc,
    /// `OFT2` — file transfer.
    Oft,
}

impl PeerMagic {
    pub fn tag(self) -> [u8; 4] {
        match self {
            PeerMagic::Odc => *b"ODC2",
            PeerMagic::Oft => *b"OFT2",
        }
    }

    pub fn from_tag(tag: [u8; 4]) -> Result<Self, ProtoError> {
        match &tag {
            b"ODC2" => Ok(PeerMagic::Odc),
            b"OFT2" => Ok(PeerMagic::Oft),
            _ => Err(ProtoError::BadPeerMagic(tag)),
        }
    }
}

/// One peer frame header: the magic plus the bytes after the length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFrame {
    pub magic: PeerMagic,
    pub header: Vec<u8>,
}

impl PeerFrame {
    pub fn new(magic: PeerMagic, header: Vec<u8>) -> Self {
        PeerFrame { magic, header }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&self.magic.tag());
        out.put_u16((self.header.len() + 6) as u16);
        out.put_slice(&self.header);
    }

    /// Decode one complete frame header from the front of `buf`; `Ok(None)`
    /// on partial input (nothing consumed). An unknown magic is fatal to the
    /// peer connection.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<PeerFrame>, ProtoError> {
        if buf.len() < 6 {
            return Ok(None);
        }
        let magic = PeerMagic::from_tag([buf[0], buf[1], buf[2], buf[3]])?;
        let total = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if total < 6 {
            return Err(ProtoError::Invalid {
                what: "peer frame length",
                detail: format!("{total} < 6"),
            });
        }
        if buf.len() < total {
            return Ok(None);
        }
        buf.advance(6);
        let header = buf.split_to(total - 6).to_vec();
        Ok(Some(PeerFrame { magic, header }))
    }
}

/// Direct-IM (`ODC2`) header. Fixed 70 bytes after the magic/length prefix;
/// the message body (`payload_len` bytes) follows the header on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OdcHeader {
    pub cookie: [u8; 8],
    pub payload_len: u32,
    pub encoding: u16,
    /// 0x0000 message, 0x000e typing started, 0x0002 typing stopped.
    pub flags: u16,
    pub screen_name: String,
}

impl OdcHeader {
    pub const FLAG_TYPING: u16 = 0x000e;
    pub const FLAG_STOPPED_TYPING: u16 = 0x0002;

    /// Encode the fixed header body (what goes after magic + length).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(ODC_HEADER_LEN - 6);
        out.put_u16(0x0006);
        out.put_u16(0x0000);
        out.put_slice(&self.cookie);
        out.put_bytes(0, 8);
        out.put_u32(self.payload_len);
        out.put_u16(self.encoding);
        out.put_u16(0x0000);
        out.put_u16(0x0000);
        out.put_u16(self.flags);
        out.put_u16(0x0000);
        out.put_u16(0x0000);
        let name = self.screen_name.as_bytes();
        let take = name.len().min(16);
        out.put_slice(&name[..take]);
        out.put_bytes(0, ODC_HEADER_LEN - 6 - 36 - take);
        out.to_vec()
    }

    pub fn decode(header: &[u8]) -> Result<OdcHeader, ProtoError> {
        if header.len() < ODC_HEADER_LEN - 6 {
            return Err(ProtoError::truncated(
                "ODC header",
                ODC_HEADER_LEN - 6,
                header.len(),
            ));
        }
        let mut buf = header;
        buf.advance(4); // type + unused
        let mut cookie = [0u8; 8];
        buf.copy_to_slice(&mut cookie);
        buf.advance(8);
        let payload_len = buf.get_u32();
        let encoding = buf.get_u16();
        buf.advance(4);
        let flags = buf.get_u16();
        buf.advance(4);
        let name_field = &buf[..16];
        let name_end = name_field.iter().position(|&b| b == 0).unwrap_or(16);
        Ok(OdcHeader {
            cookie,
            payload_len,
            encoding,
            flags,
            screen_name: String::from_utf8_lossy(&name_field[..name_end]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = PeerFrame::new(PeerMagic::Oft, vec![0xab; 20]);
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        assert_eq!(out.len(), 26);
        assert_eq!(u16::from_be_bytes([out[4], out[5]]), 26);

        let got = PeerFrame::decode(&mut out).unwrap().unwrap();
        assert_eq!(got, frame);
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let frame = PeerFrame::new(PeerMagic::Odc, vec![1; 64]);
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        let mut partial = BytesMut::from(&out[..20]);
        assert_eq!(PeerFrame::decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), 20);
    }

    #[test]
    fn unknown_magic_is_fatal() {
        let mut buf = BytesMut::from(&b"XYZ1\x00\x06"[..]);
        assert!(matches!(
            PeerFrame::decode(&mut buf),
            Err(ProtoError::BadPeerMagic(_))
        ));
    }

    #[test]
    fn odc_header_round_trip() {
        let hdr = OdcHeader {
            cookie: [9; 8],
            payload_len: 42,
            encoding: 0,
            flags: OdcHeader::FLAG_TYPING,
            screen_name: "fred".into(),
        };
        let body = hdr.encode();
        assert_eq!(body.len(), ODC_HEADER_LEN - 6);
        assert_eq!(OdcHeader::decode(&body).unwrap(), hdr);
    }
}
