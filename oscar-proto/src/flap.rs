//! FLAP framing — the outer envelope on every control-channel byte stream.
//!
//! Wire layout: `0x2A` sync byte, 1-byte channel, 2-byte big-endian sequence
//! number, 2-byte big-endian payload length, payload. Sequence numbers are
//! per-connection and wrap.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;

/// FLAP sync byte. Anything else in the first position means the stream is
/// not speaking FLAP and the connection must be closed.
pub const FLAP_SYNC: u8 = 0x2A;

/// Channel 1 payload announcing protocol version 1.
pub const FLAP_VERSION_PROBE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// FLAP channel identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlapChannel {
    /// Connection setup; carries the 4-byte version probe.
    NewConnection = 0x01,
    /// SNAC-bearing data channel.
    Snac = 0x02,
    /// FLAP-level error.
    Error = 0x03,
    /// Negotiation close: the server is shutting the connection down, with
    /// an optional TLV-encoded code and message.
    Close = 0x04,
    /// Keepalive; empty payload.
    Keepalive = 0x05,
}

impl FlapChannel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::NewConnection),
            0x02 => Some(Self::Snac),
            0x03 => Some(Self::Error),
            0x04 => Some(Self::Close),
            0x05 => Some(Self::Keepalive),
            _ => None,
        }
    }
}

/// One decoded FLAP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlapFrame {
    pub channel: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl FlapFrame {
    pub fn new(channel: FlapChannel, payload: Vec<u8>) -> Self {
        FlapFrame {
            channel: channel as u8,
            seq: 0,
            payload,
        }
    }

    /// Append the frame to `out`, stamping `seq`.
    pub fn encode(&self, seq: u16, out: &mut BytesMut) {
        out.put_u8(FLAP_SYNC);
        out.put_u8(self.channel);
        out.put_u16(seq);
        out.put_u16(self.payload.len() as u16);
        out.put_slice(&self.payload);
    }

    /// Try to decode one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame, in
    /// which case nothing is consumed and the caller should read more bytes.
    /// A bad sync byte is unrecoverable.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<FlapFrame>, ProtoError> {
        if buf.len() < 6 {
            return Ok(None);
        }
        if buf[0] != FLAP_SYNC {
            return Err(ProtoError::BadFlapSync(buf[0]));
        }
        let len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if buf.len() < 6 + len {
            return Ok(None);
        }
        buf.advance(1);
        let channel = buf.get_u8();
        let seq = buf.get_u16();
        buf.advance(2); // length, already read
        let payload = buf.split_to(len).to_vec();
        Ok(Some(FlapFrame { channel, seq, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let frame = FlapFrame::new(FlapChannel::Snac, vec![1, 2, 3, 4]);
        let mut out = BytesMut::new();
        frame.encode(0x1234, &mut out);
        assert_eq!(&out[..6], &[0x2a, 0x02, 0x12, 0x34, 0x00, 0x04]);

        let got = FlapFrame::decode(&mut out).unwrap().unwrap();
        assert_eq!(got.channel, 0x02);
        assert_eq!(got.seq, 0x1234);
        assert_eq!(got.payload, vec![1, 2, 3, 4]);
        assert!(out.is_empty());
    }

    #[test]
    fn partial_input_consumes_nothing() {
        let frame = FlapFrame::new(FlapChannel::Snac, vec![0; 32]);
        let mut out = BytesMut::new();
        frame.encode(7, &mut out);

        let mut partial = BytesMut::from(&out[..10]);
        assert_eq!(FlapFrame::decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), 10);
    }

    #[test]
    fn bad_sync_is_fatal() {
        let mut buf = BytesMut::from(&[0x2b, 0x02, 0, 0, 0, 0][..]);
        assert_eq!(
            FlapFrame::decode(&mut buf).unwrap_err(),
            ProtoError::BadFlapSync(0x2b)
        );
    }
}
