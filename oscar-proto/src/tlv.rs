//! Type-length-value attribute chains.
//!
//! Nearly every OSCAR structure above the frame layer is a sequence of TLVs:
//! 2-byte type, 2-byte length, raw value bytes. The same type may repeat
//! within one chain, so lookups address "the Nth occurrence of type T"
//! (1-indexed). Order is significant and preserved through a round trip.
//!
//! Parsing degrades gracefully: a trailing fragment shorter than a TLV
//! header, or a declared length running past the buffer, terminates the
//! chain without error. The parser never reads past the bound it was given.

use bytes::{Buf, BufMut, BytesMut};

/// A single typed attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(kind: u16, value: Vec<u8>) -> Self {
        Tlv { kind, value }
    }

    /// Bytes this TLV occupies on the wire (header plus value).
    pub fn wire_len(&self) -> usize {
        4 + self.value.len()
    }
}

/// An ordered chain of TLVs, possibly with repeated types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvChain {
    tlvs: Vec<Tlv>,
}

impl TlvChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a chain from the first `max_len` bytes of `buf`, consuming what
    /// was parsed. Stops cleanly at the bound or at the first malformed
    /// trailing element.
    pub fn read(buf: &mut &[u8], max_len: usize) -> Self {
        let mut chain = TlvChain::new();
        let mut remaining = max_len.min(buf.len());

        while remaining >= 4 {
            let kind = u16::from_be_bytes([buf[0], buf[1]]);
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if len + 4 > remaining {
                // Declared length overruns the region. Leave the fragment
                // unconsumed and stop.
                break;
            }
            buf.advance(4);
            chain.tlvs.push(Tlv::new(kind, buf[..len].to_vec()));
            buf.advance(len);
            remaining -= 4 + len;
        }
        // Skip any sub-header trailing fragment so the caller's cursor lands
        // past the region it handed us.
        if remaining > 0 && remaining < 4 {
            buf.advance(remaining);
        }
        chain
    }

    /// Read a chain from the whole of `buf`.
    pub fn read_all(mut buf: &[u8]) -> Self {
        Self::read(&mut buf, usize::MAX)
    }

    /// The Nth (1-indexed) TLV of the given type, or `None`.
    pub fn get(&self, kind: u16, nth: usize) -> Option<&Tlv> {
        self.tlvs
            .iter()
            .filter(|t| t.kind == kind)
            .nth(nth.saturating_sub(1))
    }

    pub fn contains(&self, kind: u16) -> bool {
        self.get(kind, 1).is_some()
    }

    pub fn get_u8(&self, kind: u16, nth: usize) -> Option<u8> {
        let t = self.get(kind, nth)?;
        t.value.first().copied()
    }

    pub fn get_u16(&self, kind: u16, nth: usize) -> Option<u16> {
        let t = self.get(kind, nth)?;
        (t.value.len() >= 2).then(|| u16::from_be_bytes([t.value[0], t.value[1]]))
    }

    pub fn get_u32(&self, kind: u16, nth: usize) -> Option<u32> {
        let t = self.get(kind, nth)?;
        (t.value.len() >= 4)
            .then(|| u32::from_be_bytes([t.value[0], t.value[1], t.value[2], t.value[3]]))
    }

    /// The Nth TLV value as an owned string. The wire value carries no
    /// terminator; non-UTF-8 bytes are replaced.
    pub fn get_str(&self, kind: u16, nth: usize) -> Option<String> {
        self.get(kind, nth)
            .map(|t| String::from_utf8_lossy(&t.value).into_owned())
    }

    pub fn add_raw(&mut self, kind: u16, value: &[u8]) {
        self.tlvs.push(Tlv::new(kind, value.to_vec()));
    }

    pub fn add_u8(&mut self, kind: u16, v: u8) {
        self.tlvs.push(Tlv::new(kind, vec![v]));
    }

    pub fn add_u16(&mut self, kind: u16, v: u16) {
        self.tlvs.push(Tlv::new(kind, v.to_be_bytes().to_vec()));
    }

    pub fn add_u32(&mut self, kind: u16, v: u32) {
        self.tlvs.push(Tlv::new(kind, v.to_be_bytes().to_vec()));
    }

    pub fn add_str(&mut self, kind: u16, s: &str) {
        self.add_raw(kind, s.as_bytes());
    }

    /// A zero-length TLV, used as a boolean flag on the wire.
    pub fn add_empty(&mut self, kind: u16) {
        self.tlvs.push(Tlv::new(kind, Vec::new()));
    }

    /// Append the chain to `out` in insertion order.
    pub fn write(&self, out: &mut BytesMut) {
        for t in &self.tlvs {
            out.put_u16(t.kind);
            out.put_u16(t.value.len() as u16);
            out.put_slice(&t.value);
        }
    }

    /// Total bytes the chain occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.tlvs.iter().map(Tlv::wire_len).sum()
    }

    pub fn len(&self) -> usize {
        self.tlvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tlvs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tlv> {
        self.tlvs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order_and_repeats() {
        let mut chain = TlvChain::new();
        chain.add_u16(0x0001, 0xbeef);
        chain.add_str(0x0003, "alpha");
        chain.add_raw(0x0001, &[1, 2, 3]);
        chain.add_empty(0x000f);

        let mut out = BytesMut::new();
        chain.write(&mut out);
        assert_eq!(out.len(), chain.wire_len());

        let reread = TlvChain::read_all(&out);
        assert_eq!(reread, chain);
        // occurrence addressing is 1-indexed
        assert_eq!(reread.get_u16(0x0001, 1), Some(0xbeef));
        assert_eq!(reread.get(0x0001, 2).unwrap().value, vec![1, 2, 3]);
        assert!(reread.get(0x0001, 3).is_none());
    }

    #[test]
    fn truncated_header_ends_chain() {
        // one whole TLV then a 3-byte fragment
        let mut raw = vec![0x00, 0x05, 0x00, 0x01, 0xaa];
        raw.extend_from_slice(&[0x00, 0x07, 0x00]);
        let chain = TlvChain::read_all(&raw);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.get_u8(0x0005, 1), Some(0xaa));
    }

    #[test]
    fn overlong_declared_length_ends_chain() {
        let raw = [0x00, 0x05, 0x00, 0x10, 0xaa, 0xbb];
        let chain = TlvChain::read_all(&raw);
        assert!(chain.is_empty());
    }

    #[test]
    fn read_respects_region_bound() {
        // TLV of 4 bytes, then bytes that belong to the caller
        let raw = [0x00, 0x01, 0x00, 0x00, 0xde, 0xad];
        let mut cursor = &raw[..];
        let chain = TlvChain::read(&mut cursor, 4);
        assert_eq!(chain.len(), 1);
        assert_eq!(cursor, &[0xde, 0xad]);
    }

    #[test]
    fn string_accessor_copies_value() {
        let mut chain = TlvChain::new();
        chain.add_str(0x0002, "bob");
        assert_eq!(chain.get_str(0x0002, 1).as_deref(), Some("bob"));
        assert!(chain.get_str(0x0009, 1).is_none());
    }
}
