//! Per-connection reader tasks.
//!
//! Each connected socket gets one task that accumulates bytes, cuts them
//! into frames (FLAP for control connections, peer framing for rendezvous
//! sockets), and hands them to the session over the readiness channel.
//! Frames from one connection therefore arrive at the session in order;
//! nothing orders frames across connections.

use bytes::BytesMut;
use oscar_proto::error::ProtoError;
use oscar_proto::flap::FlapFrame;
use oscar_proto::peer::{OdcHeader, PeerFrame, PeerMagic};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::debug;

use crate::conn::ConnId;
use crate::session::{NetEvent, WireFrame};

/// Cut one complete peer frame (and, for direct IM, its trailing message
/// payload) from the front of `buf`. `Ok(None)` means more bytes are needed.
pub(crate) fn try_take_peer_frame(
    buf: &mut BytesMut,
) -> Result<Option<(PeerFrame, Vec<u8>)>, ProtoError> {
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
    // Direct-IM frames declare a message payload inside the header; it
    // follows the header on the wire and belongs to this frame.
    let mut payload_len = 0usize;
    if magic == PeerMagic::Odc {
        let header = &buf[6..total];
        if let Ok(odc) = OdcHeader::decode(header) {
            payload_len = odc.payload_len as usize;
        }
    }
    if buf.len() < total + payload_len {
        return Ok(None);
    }
    let frame = PeerFrame::decode(buf)?.expect("length checked above");
    let payload = buf.split_to(payload_len).to_vec();
    Ok(Some((frame, payload)))
}

/// Read loop for one connection. Exits on EOF, read error, or an
/// unrecoverable framing error; all three close the connection.
pub(crate) async fn run(
    conn: ConnId,
    mut read: OwnedReadHalf,
    peer_framing: bool,
    net_tx: mpsc::UnboundedSender<NetEvent>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let reason = loop {
        match read.read_buf(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => {
                debug!(conn = %conn, bytes = n, "read");
                if let Err(reason) = drain_frames(conn, &mut buf, peer_framing, &net_tx) {
                    break reason;
                }
            }
            Err(e) => break format!("read error: {e}"),
        }
    };
    let _ = net_tx.send(NetEvent::Closed { conn, reason });
}

/// Whether the buffer could still grow into a framed peer message. A strict
/// prefix of a known magic means "wait for more"; anything else at the front
/// is the raw data phase of a file transfer.
fn looks_framed(buf: &[u8]) -> bool {
    let check = buf.len().min(4);
    buf[..check] == b"ODC2"[..check] || buf[..check] == b"OFT2"[..check]
}

fn drain_frames(
    conn: ConnId,
    buf: &mut BytesMut,
    peer_framing: bool,
    net_tx: &mpsc::UnboundedSender<NetEvent>,
) -> Result<(), String> {
    loop {
        let frame = if peer_framing {
            if buf.is_empty() {
                return Ok(());
            }
            if !looks_framed(buf) {
                let bytes = buf.split().to_vec();
                WireFrame::Raw(bytes)
            } else {
                match try_take_peer_frame(buf) {
                    Ok(Some((frame, payload))) => WireFrame::Peer { frame, payload },
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(format!("unrecognizable peer frame: {e}")),
                }
            }
        } else {
            match FlapFrame::decode(buf) {
                Ok(Some(frame)) => WireFrame::Flap(frame),
                Ok(None) => return Ok(()),
                Err(e) => return Err(format!("unrecognizable frame: {e}")),
            }
        };
        if net_tx.send(NetEvent::Frame { conn, frame }).is_err() {
            // Session is gone; stop reading.
            return Err("session dropped".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn odc_frame_waits_for_its_payload() {
        let hdr = OdcHeader {
            cookie: [1; 8],
            payload_len: 5,
            encoding: 0,
            flags: 0,
            screen_name: "fred".into(),
        };
        let frame = PeerFrame::new(PeerMagic::Odc, hdr.encode());
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);

        // Header complete but payload missing: not ready yet.
        let mut partial = wire.clone();
        assert!(try_take_peer_frame(&mut partial).unwrap().is_none());

        wire.put_slice(b"hello");
        let (got, payload) = try_take_peer_frame(&mut wire).unwrap().unwrap();
        assert_eq!(got.magic, PeerMagic::Odc);
        assert_eq!(payload, b"hello");
        assert!(wire.is_empty());
    }

    #[test]
    fn oft_frame_has_no_trailing_payload() {
        let frame = PeerFrame::new(PeerMagic::Oft, vec![0; 250]);
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        let (got, payload) = try_take_peer_frame(&mut wire).unwrap().unwrap();
        assert_eq!(got.header.len(), 250);
        assert!(payload.is_empty());
    }
}
