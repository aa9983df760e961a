//! Codec error type shared by the wire-format modules.

/// Errors produced while encoding or decoding wire structures.
///
/// Codec functions report malformed or insufficient input locally; callers
/// decide whether the condition is fatal to the connection (an unrecognizable
/// frame) or merely to the one element being parsed (a truncated TLV).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Fewer bytes available than the structure requires.
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    /// The FLAP sync byte was not 0x2A. The connection carrying this byte
    /// stream is unrecoverable.
    #[error("bad FLAP sync byte 0x{0:02x}")]
    BadFlapSync(u8),

    /// A peer frame began with an unknown 4-byte magic tag.
    #[error("unknown peer frame magic {0:02x?}")]
    BadPeerMagic([u8; 4]),

    /// A fixed-size field held a value the format does not allow.
    #[error("invalid {what}: {detail}")]
    Invalid {
        what: &'static str,
        detail: String,
    },
}

impl ProtoError {
    pub fn truncated(what: &'static str, need: usize, have: usize) -> Self {
        ProtoError::Truncated { what, need, have }
    }
}
