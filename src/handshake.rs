//! # BitTorrent Handshake
//!
//! Every peer connection opens with a fixed exchange before any
//! length-prefixed messages are sent:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19 outbound)
//! - **pstr**: the protocol string, "BitTorrent protocol"
//! - **reserved**: 8 bytes for extensions, all zero outbound, ignored inbound
//! - **info_hash**: 20-byte SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20-byte identifier of the sending client
//!
//! The whole outbound handshake is `pstrlen + 49` bytes, 68 with the
//! canonical protocol string. Agreement on the info hash is what keeps a
//! connection inside the right swarm, so the session layer compares the
//! received hash against its own before doing anything else.

use anyhow::{anyhow, Result};

use std::io::Read;

const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";

/// The fixed-format message that opens a peer connection.
pub struct Handshake {
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// Identifier of the peer that sent the handshake
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build the canonical outbound handshake for a torrent.
    pub fn new(peer_id: [u8; 20], info_hash: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PROTOCOL_ID.to_vec(),
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake for transmission.
    ///
    /// The result is always `pstr.len() + 49` bytes long.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.pstr.len() + 49);

        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }
}

/// Read a handshake off the wire.
///
/// Reads the one-byte protocol string length, then exactly `pstrlen + 48`
/// more bytes. A zero-length protocol string is rejected. Checking the
/// returned info hash against the expected one is left to the caller.
pub fn read_handshake(reader: &mut impl Read) -> Result<Handshake> {
    // Read protocol string length
    let mut len_buf = [0; 1];
    if reader.read_exact(&mut len_buf).is_err() {
        return Err(anyhow!("could not read handshake length from peer"));
    }

    let pstrlen = len_buf[0] as usize;
    if pstrlen == 0 {
        return Err(anyhow!("received handshake with zero protocol length"));
    }

    // Read the rest of the handshake in one go
    let mut buf: Vec<u8> = vec![0; pstrlen + 48];
    if reader.read_exact(&mut buf).is_err() {
        return Err(anyhow!("could not read handshake from peer"));
    }

    // Reserved bytes at buf[pstrlen..pstrlen + 8] are ignored
    let mut info_hash = [0; 20];
    let mut peer_id = [0; 20];
    info_hash.copy_from_slice(&buf[pstrlen + 8..pstrlen + 28]);
    peer_id.copy_from_slice(&buf[pstrlen + 28..]);

    Ok(Handshake {
        pstr: buf[..pstrlen].to_vec(),
        info_hash,
        peer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn serialize_layout() {
        let mut peer_id = [0; 20];
        for (i, byte) in peer_id.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let info_hash = [0xFF; 20];

        let buf = Handshake::new(peer_id, info_hash).serialize();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 0x13);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[0xFF; 20]);
        assert_eq!(&buf[48..68], &peer_id);
    }

    #[test]
    fn read_round_trip() {
        let sent = Handshake::new([7; 20], [9; 20]);
        let mut cursor = Cursor::new(sent.serialize());

        let received = read_handshake(&mut cursor).unwrap();

        assert_eq!(received.pstr, PROTOCOL_ID);
        assert_eq!(received.info_hash, [9; 20]);
        assert_eq!(received.peer_id, [7; 20]);
    }

    #[test]
    fn zero_pstrlen_is_rejected() {
        let mut cursor = Cursor::new(vec![0; 69]);
        assert!(read_handshake(&mut cursor).is_err());
    }

    #[test]
    fn truncated_handshake_is_rejected() {
        let buf = Handshake::new([1; 20], [2; 20]).serialize();
        let mut cursor = Cursor::new(buf[..40].to_vec());
        assert!(read_handshake(&mut cursor).is_err());
    }
}
