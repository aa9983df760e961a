//! Heuristic identification of the sending client from ICBM feature bytes.
//!
//! The features block in a channel-1 message varies by client build; a small
//! table of observed byte sequences maps them to a client kind. This is a
//! guess, nothing more — unmatched sequences are simply `Unknown`.

/// Client families recognizable from their feature bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    MobileCommunicator,
    WinAim,
    WinAim41,
    AolOrToc,
    Unknown,
}

const FINGERPRINTS: &[(ClientKind, &[u8])] = &[
    (ClientKind::MobileCommunicator, &[0x01, 0x01, 0x01]),
    (ClientKind::WinAim, &[0x01, 0x01, 0x02]),
    (ClientKind::WinAim41, &[0x01, 0x01, 0x01, 0x02]),
    (ClientKind::AolOrToc, &[0x01]),
];

/// Classify a features block. Only exact-length matches count.
pub fn classify(features: &[u8]) -> ClientKind {
    if features.is_empty() {
        return ClientKind::Unknown;
    }
    for (kind, pattern) in FINGERPRINTS {
        if *pattern == features {
            return *kind;
        }
    }
    ClientKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_patterns() {
        assert_eq!(classify(&[0x01, 0x01, 0x02]), ClientKind::WinAim);
        assert_eq!(classify(&[0x01, 0x01, 0x01, 0x02]), ClientKind::WinAim41);
        assert_eq!(classify(&[0x01]), ClientKind::AolOrToc);
    }

    #[test]
    fn prefix_is_not_a_match() {
        // WinAim41's pattern starts with MobileCommunicator's; length decides.
        assert_eq!(classify(&[0x01, 0x01, 0x01]), ClientKind::MobileCommunicator);
        assert_eq!(classify(&[0x01, 0x01]), ClientKind::Unknown);
        assert_eq!(classify(&[]), ClientKind::Unknown);
    }
}
