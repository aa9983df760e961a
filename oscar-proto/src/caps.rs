//! Rendezvous capability GUIDs.
//!
//! A capability is a 16-byte identifier advertised in user-info blocks and
//! echoed at the head of every channel-2 rendezvous block to select what the
//! negotiation is for.

use tracing::debug;

/// Rendezvous purposes the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    BuddyIcon,
    Voice,
    DirectIm,
    Chat,
    GetFile,
    SendFile,
    SaveStocks,
    Games,
    SendBuddyList,
}

// The 0x4a GUID exists in two byte orders in the wild; some clients send it
// with words 8..10 swapped. Both decode to Games, only the first is emitted.
const GAMES_SWAPPED: [u8; 16] = [
    0x09, 0x46, 0x13, 0x4a, 0x4c, 0x7f, 0x11, 0xd1, 0x22, 0x82, 0x44, 0x45, 0x53, 0x54, 0x00, 0x00,
];

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::BuddyIcon,
        Capability::Voice,
        Capability::DirectIm,
        Capability::Chat,
        Capability::GetFile,
        Capability::SendFile,
        Capability::SaveStocks,
        Capability::Games,
        Capability::SendBuddyList,
    ];

    /// The canonical wire GUID for this capability.
    pub fn guid(self) -> [u8; 16] {
        let fourth = match self {
            Capability::BuddyIcon => 0x46,
            Capability::Voice => 0x41,
            Capability::DirectIm => 0x45,
            Capability::Chat => {
                return [
                    0x74, 0x8f, 0x24, 0x20, 0x62, 0x87, 0x11, 0xd1, 0x82, 0x22, 0x44, 0x45, 0x53,
                    0x54, 0x00, 0x00,
                ]
            }
            Capability::GetFile => 0x48,
            Capability::SendFile => 0x43,
            Capability::SaveStocks => 0x47,
            Capability::Games => 0x4a,
            Capability::SendBuddyList => 0x4b,
        };
        [
            0x09, 0x46, 0x13, fourth, 0x4c, 0x7f, 0x11, 0xd1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54,
            0x00, 0x00,
        ]
    }

    pub fn from_guid(guid: &[u8; 16]) -> Option<Capability> {
        if *guid == GAMES_SWAPPED {
            return Some(Capability::Games);
        }
        Capability::ALL.into_iter().find(|c| c.guid() == *guid)
    }
}

/// Parse a block of concatenated 16-byte GUIDs. Unknown GUIDs are skipped
/// with a debug log; a trailing fragment shorter than 16 bytes is ignored.
pub fn read_block(block: &[u8]) -> Vec<Capability> {
    let mut caps = Vec::new();
    for chunk in block.chunks_exact(16) {
        let guid: [u8; 16] = chunk.try_into().unwrap();
        match Capability::from_guid(&guid) {
            Some(cap) => caps.push(cap),
            None => debug!(guid = ?guid, "unknown capability"),
        }
    }
    caps
}

/// Concatenate the GUIDs for `caps`.
pub fn write_block(caps: &[Capability]) -> Vec<u8> {
    let mut out = Vec::with_capacity(caps.len() * 16);
    for cap in caps {
        out.extend_from_slice(&cap.guid());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let caps = vec![Capability::SendFile, Capability::DirectIm, Capability::Chat];
        let block = write_block(&caps);
        assert_eq!(block.len(), 48);
        assert_eq!(read_block(&block), caps);
    }

    #[test]
    fn unknown_guid_skipped() {
        let mut block = write_block(&[Capability::Voice]);
        block.extend_from_slice(&[0xff; 16]);
        block.extend_from_slice(&Capability::GetFile.guid());
        assert_eq!(read_block(&block), vec![Capability::Voice, Capability::GetFile]);
    }

    #[test]
    fn swapped_games_guid_decodes() {
        assert_eq!(
            Capability::from_guid(&GAMES_SWAPPED),
            Some(Capability::Games)
        );
        // but the canonical form is what we emit
        assert_ne!(Capability::Games.guid(), GAMES_SWAPPED);
    }
}
