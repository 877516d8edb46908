//! # Peer Wire Messages
//!
//! After the handshake, peers exchange length-prefixed messages:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32), counts the ID and payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes of message-specific data
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | packed piece bits |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//!
//! A frame whose length prefix is zero is a keep-alive and carries neither ID
//! nor payload. Peers may send one at any time to hold an idle connection
//! open; we accept them and never send our own.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use std::io::Read;

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;

// Largest length prefix we accept: a full 128 KiB block plus headers. Anything
// bigger is treated as a corrupt or hostile frame.
const MESSAGE_LEN_MAX: usize = (1 << 17) + 32;

/// A single peer wire message.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Build a REQUEST for `length` bytes of piece `index` starting at `begin`.
    pub fn request(index: u32, begin: u32, length: u32) -> Result<Self> {
        let mut payload: Vec<u8> = Vec::with_capacity(12);
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        Ok(Message::new_with_payload(MESSAGE_REQUEST, payload))
    }

    /// Build a HAVE announcing piece `index`.
    pub fn have(index: u32) -> Result<Self> {
        let mut payload: Vec<u8> = Vec::with_capacity(4);
        payload.write_u32::<BigEndian>(index)?;

        Ok(Message::new_with_payload(MESSAGE_HAVE, payload))
    }

    /// Serialize the message with its length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::with_capacity(4 + 1 + self.payload.len());

        buf.write_u32::<BigEndian>((1 + self.payload.len()) as u32)?;
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }
}

/// Read one message off the wire. Returns `None` for a keep-alive.
pub fn read_message(reader: &mut impl Read) -> Result<Option<Message>> {
    // Read the 4-byte length prefix
    let mut len_buf = [0; 4];
    if reader.read_exact(&mut len_buf).is_err() {
        return Err(anyhow!("could not read message length from peer"));
    }

    let message_len = BigEndian::read_u32(&len_buf) as usize;
    if message_len == 0 {
        return Ok(None);
    }
    if message_len > MESSAGE_LEN_MAX {
        return Err(anyhow!(
            "received message with unreasonable length {}",
            message_len
        ));
    }

    // Read ID byte and payload
    let mut buf: Vec<u8> = vec![0; message_len];
    if reader.read_exact(&mut buf).is_err() {
        return Err(anyhow!("could not read message from peer"));
    }

    Ok(Some(Message {
        id: buf[0],
        payload: buf[1..].to_vec(),
    }))
}

/// Extract the piece index carried by a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE {
        return Err(anyhow!("expected HAVE, got message id {}", message.id));
    }
    if message.payload.len() != 4 {
        return Err(anyhow!(
            "expected HAVE payload of 4 bytes, got {}",
            message.payload.len()
        ));
    }

    Ok(BigEndian::read_u32(&message.payload))
}

/// Copy the block carried by a PIECE message into `buf` at its begin offset.
///
/// The message must refer to piece `index`, and the block must fit inside
/// `buf`. Returns the number of bytes copied.
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<usize> {
    if message.id != MESSAGE_PIECE {
        return Err(anyhow!("expected PIECE, got message id {}", message.id));
    }
    if message.payload.len() < 8 {
        return Err(anyhow!(
            "expected PIECE payload of at least 8 bytes, got {}",
            message.payload.len()
        ));
    }

    let parsed_index = BigEndian::read_u32(&message.payload[0..4]);
    if parsed_index != index {
        return Err(anyhow!(
            "expected block of piece {}, got piece {}",
            index,
            parsed_index
        ));
    }

    let begin = BigEndian::read_u32(&message.payload[4..8]) as usize;
    if begin >= buf.len() {
        return Err(anyhow!(
            "block offset {} is outside piece of length {}",
            begin,
            buf.len()
        ));
    }

    let block = &message.payload[8..];
    if begin + block.len() > buf.len() {
        return Err(anyhow!(
            "block [{}:{}] overruns piece of length {}",
            begin,
            begin + block.len(),
            buf.len()
        ));
    }

    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn serialize_have_frame() {
        let message = Message::have(5).unwrap();
        let buf = message.serialize().unwrap();

        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x05]);
        assert_eq!(parse_have(&message).unwrap(), 5);
    }

    #[test]
    fn read_round_trip() {
        let messages = vec![
            Message::new(MESSAGE_CHOKE),
            Message::new(MESSAGE_UNCHOKE),
            Message::new(MESSAGE_INTERESTED),
            Message::have(42).unwrap(),
            Message::request(1, 16384, 16384).unwrap(),
            Message::new_with_payload(MESSAGE_BITFIELD, vec![0xF0, 0x0F]),
            Message::new_with_payload(MESSAGE_PIECE, vec![0; 24]),
        ];

        for message in messages {
            let mut cursor = Cursor::new(message.serialize().unwrap());
            let decoded = read_message(&mut cursor).unwrap().unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn zero_length_frame_is_keepalive() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        assert!(read_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut frame = vec![];
        frame.extend_from_slice(&(((1u32 << 17) + 33).to_be_bytes()));
        frame.push(MESSAGE_PIECE);
        let mut cursor = Cursor::new(frame);
        assert!(read_message(&mut cursor).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        // Length prefix promises 9 bytes, only 3 follow
        let mut cursor = Cursor::new(vec![0, 0, 0, 9, 4, 0, 0]);
        assert!(read_message(&mut cursor).is_err());
    }

    #[test]
    fn parse_piece_copies_block_at_offset() {
        let mut payload = vec![];
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&8u32.to_be_bytes());
        payload.extend_from_slice(b"ABCD");
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);

        let mut buf = vec![0; 20];
        let copied = parse_piece(3, &mut buf, &message).unwrap();

        assert_eq!(copied, 4);
        assert_eq!(&buf[8..12], b"ABCD");
        assert!(buf[..8].iter().all(|&b| b == 0));
        assert!(buf[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parse_piece_rejects_bad_frames() {
        let mut buf = vec![0; 20];

        // Wrong piece index
        let mut payload = vec![];
        payload.extend_from_slice(&4u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(b"AB");
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);
        assert!(parse_piece(3, &mut buf, &message).is_err());

        // Begin offset past the end of the piece
        let mut payload = vec![];
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&20u32.to_be_bytes());
        payload.extend_from_slice(b"AB");
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);
        assert!(parse_piece(3, &mut buf, &message).is_err());

        // Block overruns the piece
        let mut payload = vec![];
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&16u32.to_be_bytes());
        payload.extend_from_slice(b"ABCDEFGH");
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);
        assert!(parse_piece(3, &mut buf, &message).is_err());

        // Payload shorter than its fixed header
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0; 7]);
        assert!(parse_piece(3, &mut buf, &message).is_err());

        // Untouched buffer after all rejections
        assert!(buf.iter().all(|&b| b == 0));
    }
}
