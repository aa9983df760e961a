//! OFT — the file-transfer header and checksum used once a rendezvous
//! socket is established.
//!
//! The header is a fixed-offset structure, 256 bytes on the wire including
//! the `OFT2` magic and length prefix carried by the peer-frame envelope.
//! The checksum is a non-standard rolling algorithm; peers verify transferred
//! bytes against it, so it must be reproduced bit-for-bit, oddities
//! included.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;

/// Total encoded size of an OFT header, magic and length prefix included.
pub const OFT_FRAME_LEN: usize = 256;
/// Size of the header body carried inside the peer-frame envelope.
pub const OFT_BODY_LEN: usize = OFT_FRAME_LEN - 6;

/// Identification string planted in every header, zero-padded to 32 bytes.
pub const OFT_IDSTRING: &[u8] = b"OFT_Windows ICBMFT V1.1 32";

/// In-band directory separator used inside the filename field.
const WIRE_SEPARATOR: u8 = 0x01;

/// OFT header type codes.
pub mod oft_type {
    /// Sender offers the next file.
    pub const PROMPT: u16 = 0x0101;
    /// Receiver accepts; echoes the cookie.
    pub const ACK: u16 = 0x0202;
    /// Receiver confirms all bytes arrived.
    pub const DONE: u16 = 0x0204;
    /// Receiver asks to resume a partial file.
    pub const RESUME: u16 = 0x0205;
    /// Sender acknowledges a resume.
    pub const RESUME_ACK: u16 = 0x0106;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OftHeader {
    pub oft_type: u16,
    pub cookie: [u8; 8],
    pub encrypt: u16,
    pub compress: u16,
    pub total_files: u16,
    pub files_left: u16,
    pub total_parts: u16,
    pub parts_left: u16,
    pub total_size: u32,
    pub size: u32,
    pub mod_time: u32,
    pub checksum: u32,
    pub rf_received_csum: u32,
    pub rf_size: u32,
    pub creation_time: u32,
    pub rf_csum: u32,
    pub bytes_received: u32,
    pub received_csum: u32,
    pub flags: u8,
    pub name_offset: u8,
    pub size_offset: u8,
    pub mac_file_info: [u8; 16],
    pub name_encoding: u16,
    pub name_language: u16,
    /// Filename with the platform `/` separator; translated to the in-band
    /// escape at the wire boundary. At most 63 bytes survive encoding.
    pub file_name: String,
}

impl Default for OftHeader {
    fn default() -> Self {
        OftHeader {
            oft_type: oft_type::PROMPT,
            cookie: [0; 8],
            encrypt: 0,
            compress: 0,
            total_files: 1,
            files_left: 1,
            total_parts: 1,
            parts_left: 1,
            total_size: 0,
            size: 0,
            mod_time: 0,
            checksum: OftChecksum::EMPTY,
            rf_received_csum: OftChecksum::EMPTY,
            rf_size: 0,
            creation_time: 0,
            rf_csum: OftChecksum::EMPTY,
            bytes_received: 0,
            received_csum: OftChecksum::EMPTY,
            flags: 0x20,
            name_offset: 0x1c,
            size_offset: 0x11,
            mac_file_info: [0; 16],
            name_encoding: 0,
            name_language: 0,
            file_name: String::new(),
        }
    }
}

impl OftHeader {
    /// Encode the header body (everything after the magic/length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(OFT_BODY_LEN);
        out.put_u16(self.oft_type);
        out.put_slice(&self.cookie);
        out.put_u16(self.encrypt);
        out.put_u16(self.compress);
        out.put_u16(self.total_files);
        out.put_u16(self.files_left);
        out.put_u16(self.total_parts);
        out.put_u16(self.parts_left);
        out.put_u32(self.total_size);
        out.put_u32(self.size);
        out.put_u32(self.mod_time);
        out.put_u32(self.checksum);
        out.put_u32(self.rf_received_csum);
        out.put_u32(self.rf_size);
        out.put_u32(self.creation_time);
        out.put_u32(self.rf_csum);
        out.put_u32(self.bytes_received);
        out.put_u32(self.received_csum);
        let mut ident = [0u8; 32];
        ident[..OFT_IDSTRING.len()].copy_from_slice(OFT_IDSTRING);
        out.put_slice(&ident);
        out.put_u8(self.flags);
        out.put_u8(self.name_offset);
        out.put_u8(self.size_offset);
        out.put_bytes(0, 69);
        out.put_slice(&self.mac_file_info);
        out.put_u16(self.name_encoding);
        out.put_u16(self.name_language);
        let mut name = [0u8; 64];
        for (i, &b) in self.file_name.as_bytes().iter().take(63).enumerate() {
            name[i] = if b == b'/' { WIRE_SEPARATOR } else { b };
        }
        out.put_slice(&name);
        debug_assert_eq!(out.len(), OFT_BODY_LEN);
        out.to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<OftHeader, ProtoError> {
        if body.len() < OFT_BODY_LEN {
            return Err(ProtoError::truncated("OFT header", OFT_BODY_LEN, body.len()));
        }
        let mut buf = body;
        let oft_type = buf.get_u16();
        let mut cookie = [0u8; 8];
        buf.copy_to_slice(&mut cookie);
        let encrypt = buf.get_u16();
        let compress = buf.get_u16();
        let total_files = buf.get_u16();
        let files_left = buf.get_u16();
        let total_parts = buf.get_u16();
        let parts_left = buf.get_u16();
        let total_size = buf.get_u32();
        let size = buf.get_u32();
        let mod_time = buf.get_u32();
        let checksum = buf.get_u32();
        let rf_received_csum = buf.get_u32();
        let rf_size = buf.get_u32();
        let creation_time = buf.get_u32();
        let rf_csum = buf.get_u32();
        let bytes_received = buf.get_u32();
        let received_csum = buf.get_u32();
        buf.advance(32); // id string
        let flags = buf.get_u8();
        let name_offset = buf.get_u8();
        let size_offset = buf.get_u8();
        buf.advance(69);
        let mut mac_file_info = [0u8; 16];
        buf.copy_to_slice(&mut mac_file_info);
        let name_encoding = buf.get_u16();
        let name_language = buf.get_u16();
        let name_field = &buf[..64];
        let end = name_field.iter().position(|&b| b == 0).unwrap_or(64);
        let file_name = name_field[..end]
            .iter()
            .map(|&b| if b == WIRE_SEPARATOR { '/' } else { b as char })
            .collect();
        Ok(OftHeader {
            oft_type,
            cookie,
            encrypt,
            compress,
            total_files,
            files_left,
            total_parts,
            parts_left,
            total_size,
            size,
            mod_time,
            checksum,
            rf_received_csum,
            rf_size,
            creation_time,
            rf_csum,
            bytes_received,
            received_csum,
            flags,
            name_offset,
            size_offset,
            mac_file_info,
            name_encoding,
            name_language,
            file_name,
        })
    }
}

/// The OFT rolling checksum, in incremental form.
///
/// The accumulator starts at `0xFFFF0000`. Each byte is subtracted from the
/// high half — shifted left 8 for even offsets, unshifted for odd — and
/// whenever the subtraction produces a value greater than the one before it,
/// the result is decremented by one. That correction looks like a bug; it is
/// not. Peers compute exactly this, and a transfer whose checksums disagree
/// is discarded, so the step is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OftChecksum {
    value: u32,
    pos: usize,
}

impl Default for OftChecksum {
    fn default() -> Self {
        OftChecksum {
            value: Self::EMPTY,
            pos: 0,
        }
    }
}

impl OftChecksum {
    /// Checksum of zero bytes; the initial accumulator.
    pub const EMPTY: u32 = 0xFFFF_0000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `data` into the checksum. Chunk boundaries are invisible: any
    /// split of a buffer yields the same final value as one call, because
    /// the accumulator and byte parity carry across.
    pub fn update(&mut self, data: &[u8]) {
        let odd = self.pos & 1;
        let mut check = (self.value >> 16) & 0xffff;
        for (i, &b) in data.iter().enumerate() {
            let old = check;
            let val: u32 = if (i + odd) & 1 == 0 {
                (b as u32) << 8
            } else {
                b as u32
            };
            check = check.wrapping_sub(val);
            if check > old {
                check -= 1;
            }
        }
        check = (check & 0xffff) + (check >> 16);
        check = (check & 0xffff) + (check >> 16);
        self.value = check << 16;
        self.pos += data.len();
    }

    /// The checksum over everything folded in so far.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// One-shot checksum of a whole buffer.
    pub fn of(data: &[u8]) -> u32 {
        let mut c = Self::new();
        c.update(data);
        c.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_checksum_is_initial_accumulator() {
        assert_eq!(OftChecksum::of(&[]), OftChecksum::EMPTY);
    }

    #[test]
    fn checksum_is_deterministic() {
        let data = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(OftChecksum::of(data), OftChecksum::of(data));
    }

    #[test]
    fn chunked_fold_matches_one_shot() {
        let data: Vec<u8> = (0u16..1024).map(|i| (i * 7 % 251) as u8).collect();
        let whole = OftChecksum::of(&data);
        // arbitrary splits, including an odd boundary that flips byte parity
        for split in [1usize, 2, 3, 255, 256, 511, 1000] {
            let mut inc = OftChecksum::new();
            inc.update(&data[..split]);
            inc.update(&data[split..]);
            assert_eq!(inc.value(), whole, "split at {split}");
        }
    }

    #[test]
    fn header_round_trip_translates_separator() {
        let hdr = OftHeader {
            oft_type: oft_type::PROMPT,
            cookie: *b"\x01\x02\x03\x04\x05\x06\x07\x08",
            total_size: 9000,
            size: 9000,
            mod_time: 0x3b7b_f85a,
            checksum: 0x1234_0000,
            file_name: "photos/cat.jpg".into(),
            ..Default::default()
        };
        let body = hdr.encode();
        assert_eq!(body.len(), OFT_BODY_LEN);
        // separator escaped in-band; the name field is the last 64 bytes
        let name_region = &body[OFT_BODY_LEN - 64..];
        assert!(name_region.contains(&0x01));
        assert!(!name_region.contains(&b'/'));

        let got = OftHeader::decode(&body).unwrap();
        assert_eq!(got, hdr);
    }

    #[test]
    fn id_string_is_planted() {
        let body = OftHeader::default().encode();
        let pos = body
            .windows(OFT_IDSTRING.len())
            .position(|w| w == OFT_IDSTRING);
        assert_eq!(pos, Some(62));
    }
}
