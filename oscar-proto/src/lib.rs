//! Wire codecs for the OSCAR instant-messaging protocol.
//!
//! This crate is pure parsing and serialization — no sockets, no session
//! state. The layers, bottom up:
//!
//! - [`flap`] — the length-prefixed control-channel envelope
//! - [`snac`] — the (family, subtype, flags, request-id) routing header
//! - [`tlv`] — typed-attribute chains used by almost everything above FLAP
//! - [`caps`] — rendezvous capability GUIDs
//! - [`userinfo`] — the standard user-info block
//! - [`fingerprint`] — client identification from ICBM feature bytes
//! - [`peer`] — the `ODC2`/`OFT2` framing spoken on direct peer sockets
//! - [`oft`] — the file-transfer header and its rolling checksum
//!
//! All multi-byte integers are big-endian on the wire. Parsers treat input
//! as untrusted: truncated or inconsistent structures produce local errors
//! or graceful chain termination, never panics.

pub mod caps;
pub mod error;
pub mod fingerprint;
pub mod flap;
pub mod oft;
pub mod peer;
pub mod snac;
pub mod tlv;
pub mod userinfo;

pub use caps::Capability;
pub use error::ProtoError;
pub use flap::{FlapChannel, FlapFrame};
pub use oft::{OftChecksum, OftHeader};
pub use peer::{OdcHeader, PeerFrame, PeerMagic};
pub use snac::SnacHeader;
pub use tlv::{Tlv, TlvChain};
pub use userinfo::{UserFlags, UserInfo};
