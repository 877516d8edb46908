//! # Peer Connection
//!
//! One [`Client`] owns one TCP conversation with a remote peer: the dial, the
//! handshake, the initial bitfield exchange, and every message sent or read
//! afterwards. Sessions in [`crate::worker`] drive a `Client` through the
//! download loop.
//!
//! ## Deadlines
//!
//! Slow or silent peers are cut off with per-operation deadlines on the raw
//! connection: 3 seconds to dial, 3 seconds for the handshake round trip,
//! 5 seconds for the bitfield, and a 30 second ceiling per piece set by the
//! session. Each deadline is cleared once the operation completes.
//!
//! ## Choke state
//!
//! A freshly connected peer chokes us by default and will drop requests until
//! it sends UNCHOKE. The flag is only ever touched by the session that owns
//! the connection, so it needs no synchronization.

use crate::bitfield::Bitfield;
use crate::handshake::{read_handshake, Handshake};
use crate::message::*;
use crate::peer::Peer;

use anyhow::{anyhow, Result};

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 3;
const HANDSHAKE_TIMEOUT_SECS: u64 = 3;
const BITFIELD_TIMEOUT_SECS: u64 = 5;

/// A TCP connection to a remote peer.
///
/// The underlying stream is closed when the `Client` is dropped, whichever
/// way the session ends.
pub struct Client {
    /// The remote endpoint, kept for logging
    peer: Peer,
    /// Our 20-byte identifier
    peer_id: [u8; 20],
    /// SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; 20],
    /// TCP stream to the peer
    conn: TcpStream,
    /// Pieces the peer claims to have
    bitfield: Bitfield,
    /// Whether the peer currently refuses to serve our requests
    choked: bool,
}

impl Client {
    /// Dial a peer.
    ///
    /// Only the TCP connection is established here; the caller follows up
    /// with [`Client::handshake_with_peer`] and [`Client::read_bitfield`]
    /// before the connection is usable.
    pub fn new(peer: Peer, peer_id: [u8; 20], info_hash: [u8; 20]) -> Result<Client> {
        let conn = match TcpStream::connect_timeout(
            &peer.socket_addr(),
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
        ) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer {}", peer)),
        };

        debug!("Connected to peer {}", peer);

        Ok(Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::default(),
            choked: true,
        })
    }

    /// Whether the peer currently chokes us.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Record a CHOKE from the peer.
    pub fn mark_choked(&mut self) {
        self.choked = true;
    }

    /// Record an UNCHOKE from the peer.
    pub fn mark_unchoked(&mut self) {
        self.choked = false;
    }

    /// Whether the peer has the piece at `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Set read and write deadlines on the connection.
    pub fn set_deadline(&self, secs: u64) -> Result<()> {
        let timeout = Some(Duration::from_secs(secs));

        if self.conn.set_write_timeout(timeout).is_err() {
            return Err(anyhow!("could not set write timeout"));
        }
        if self.conn.set_read_timeout(timeout).is_err() {
            return Err(anyhow!("could not set read timeout"));
        }

        Ok(())
    }

    /// Remove any deadline from the connection.
    pub fn clear_deadline(&self) -> Result<()> {
        if self.conn.set_write_timeout(None).is_err() {
            return Err(anyhow!("could not clear write timeout"));
        }
        if self.conn.set_read_timeout(None).is_err() {
            return Err(anyhow!("could not clear read timeout"));
        }

        Ok(())
    }

    /// Exchange handshakes with the peer and verify the info hash.
    ///
    /// Both directions run under one deadline. A peer that answers with a
    /// different info hash is serving a different torrent, so the session
    /// must not proceed.
    pub fn handshake_with_peer(&mut self) -> Result<()> {
        self.set_deadline(HANDSHAKE_TIMEOUT_SECS)?;

        // Send our handshake
        let handshake = Handshake::new(self.peer_id, self.info_hash);
        if self.conn.write_all(&handshake.serialize()).is_err() {
            return Err(anyhow!("could not send handshake to peer {}", self.peer));
        }

        // Read and verify the reply
        let reply = read_handshake(&mut self.conn)?;
        if reply.info_hash != self.info_hash {
            return Err(anyhow!(
                "peer {} answered the handshake for another torrent",
                self.peer
            ));
        }

        self.clear_deadline()?;

        debug!("Completed handshake with peer {}", self.peer);

        Ok(())
    }

    /// Read the peer's bitfield.
    ///
    /// The bitfield must be the first message after the handshake; anything
    /// else, including a keep-alive, fails the session setup.
    pub fn read_bitfield(&mut self) -> Result<()> {
        self.set_deadline(BITFIELD_TIMEOUT_SECS)?;

        let message = match read_message(&mut self.conn)? {
            Some(message) => message,
            None => return Err(anyhow!("expected bitfield, got keep-alive")),
        };
        if message.id != MESSAGE_BITFIELD {
            return Err(anyhow!(
                "expected bitfield, got message id {}",
                message.id
            ));
        }

        self.bitfield = Bitfield::new(message.payload);
        self.clear_deadline()?;

        debug!("Received bitfield from peer {}", self.peer);

        Ok(())
    }

    /// Read one message from the peer. Returns `None` for a keep-alive.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        read_message(&mut self.conn)
    }

    /// Apply a HAVE from the peer to its bitfield.
    pub fn record_have(&mut self, message: &Message) -> Result<()> {
        let index = parse_have(message)?;
        self.bitfield.set_piece(index);

        Ok(())
    }

    /// Send an UNCHOKE to the peer.
    pub fn send_unchoke(&mut self) -> Result<()> {
        self.send(&Message::new(MESSAGE_UNCHOKE), "UNCHOKE")
    }

    /// Send an INTERESTED to the peer.
    pub fn send_interested(&mut self) -> Result<()> {
        self.send(&Message::new(MESSAGE_INTERESTED), "INTERESTED")
    }

    /// Request `length` bytes of piece `index` starting at offset `begin`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        debug!(
            "Requesting piece {} [{}:{}] from peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );

        self.send(&Message::request(index, begin, length)?, "REQUEST")
    }

    /// Announce to the peer that we now have piece `index`.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        self.send(&Message::have(index)?, "HAVE")
    }

    fn send(&mut self, message: &Message, name: &str) -> Result<()> {
        let encoded = message.serialize()?;
        if self.conn.write_all(&encoded).is_err() {
            return Err(anyhow!("could not send {} to peer {}", name, self.peer));
        }

        Ok(())
    }

    /// Tear down the connection and dial the peer again.
    ///
    /// Used by the session's setup retries. The new connection starts over
    /// from scratch: choked, with no bitfield, before any handshake.
    pub fn reconnect(&mut self) -> Result<()> {
        debug!("Reconnecting to peer {}", self.peer);

        // A failed shutdown only means the connection is already gone
        let _ = self.conn.shutdown(Shutdown::Both);

        let conn = match TcpStream::connect_timeout(
            &self.peer.socket_addr(),
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
        ) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not reconnect to peer {}", self.peer)),
        };

        self.conn = conn;
        self.choked = true;
        self.bitfield = Bitfield::default();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    // A listener that answers one handshake and sends the given bitfield.
    fn spawn_remote(info_hash: [u8; 20], bitfield: Vec<u8>) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();

            let mut received = vec![0; 68];
            conn.read_exact(&mut received).unwrap();

            let reply = Handshake::new([0xBB; 20], info_hash);
            conn.write_all(&reply.serialize()).unwrap();

            let message = Message::new_with_payload(MESSAGE_BITFIELD, bitfield);
            conn.write_all(&message.serialize().unwrap()).unwrap();
        });

        Peer {
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    #[test]
    fn handshake_and_bitfield_setup() {
        let info_hash = [0x11; 20];
        let peer = spawn_remote(info_hash, vec![0b1010_0000]);

        let mut client = Client::new(peer, [0xAA; 20], info_hash).unwrap();
        client.handshake_with_peer().unwrap();
        client.read_bitfield().unwrap();

        assert!(client.is_choked());
        assert!(client.has_piece(0));
        assert!(!client.has_piece(1));
        assert!(client.has_piece(2));
    }

    #[test]
    fn handshake_rejects_wrong_info_hash() {
        let peer = spawn_remote([0x22; 20], vec![]);

        let mut client = Client::new(peer, [0xAA; 20], [0x33; 20]).unwrap();
        assert!(client.handshake_with_peer().is_err());
    }

    #[test]
    fn record_have_updates_bitfield() {
        let info_hash = [0x44; 20];
        let peer = spawn_remote(info_hash, vec![0x00]);

        let mut client = Client::new(peer, [0xAA; 20], info_hash).unwrap();
        client.handshake_with_peer().unwrap();
        client.read_bitfield().unwrap();

        assert!(!client.has_piece(3));
        client.record_have(&Message::have(3).unwrap()).unwrap();
        assert!(client.has_piece(3));
    }
}
