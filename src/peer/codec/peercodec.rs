use std::io::{self, Cursor};

use bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{blockinfo::BlockInfo, error::peer::PeerError, Bitfield};

use super::message::{Message, MessageId};

/// The maximum size, in bytes, we're willing to accept for a single message
/// payload. A well-behaved peer should never send anything close to this
/// (the largest legitimate message is a 16 KiB block), but a misbehaving or
/// malicious peer could send an absurd length prefix to make us allocate
/// unbounded memory, so we reject anything past this before reading it.
const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Encodes and decodes the peer wire protocol's messages (everything that
/// follows the handshake).
///
/// Every message is prefixed by its length (not counting the prefix itself)
/// as a 4 byte big endian integer. A length of zero denotes a keep-alive.
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut bytes::BytesMut) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => put_empty(buf, MessageId::Choke),
            Message::Unchoke => put_empty(buf, MessageId::Unchoke),
            Message::Interested => put_empty(buf, MessageId::Interested),
            Message::NotInterested => put_empty(buf, MessageId::NotInterested),
            Message::Have { piece_index } => {
                let msg_len = 1 + 4;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                let msg_len = 1 + bytes.len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Message::Request(block_info) => {
                put_block_info(buf, MessageId::Request, &block_info)
            }
            Message::Cancel(block_info) => {
                put_block_info(buf, MessageId::Cancel, &block_info)
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let msg_len = 1 + 4 + 4 + data.len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

fn put_empty(buf: &mut bytes::BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn put_block_info(buf: &mut bytes::BytesMut, id: MessageId, block_info: &BlockInfo) {
    let msg_len = 1 + 4 + 4 + 4;
    buf.put_u32(msg_len);
    buf.put_u8(id as u8);
    buf.put_u32(block_info.piece_index as u32);
    buf.put_u32(block_info.offset);
    buf.put_u32(block_info.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut bytes::BytesMut) -> Result<Option<Message>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut tmp = Cursor::new(&buf);
        let msg_len = tmp.get_u32() as usize;

        if msg_len > MAX_MESSAGE_LEN {
            return Err(PeerError::MalformedFrame);
        }

        if msg_len == 0 {
            // keep-alive: just the 4 byte zero length prefix
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + msg_len {
            // don't have the full message yet, and don't reserve more than
            // we need: the caller will grow the buffer as more data arrives
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len - 1;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(PeerError::MalformedFrame);
                }
                let piece_index = buf.get_u32() as usize;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let mut bytes = vec![0; payload_len];
                buf.copy_to_slice(&mut bytes);
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            MessageId::Request => {
                if payload_len != 12 {
                    return Err(PeerError::MalformedFrame);
                }
                Message::Request(get_block_info(buf))
            }
            MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(PeerError::MalformedFrame);
                }
                Message::Cancel(get_block_info(buf))
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(PeerError::MalformedFrame);
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data: data.into(),
                }
            }
        };

        Ok(Some(msg))
    }
}

fn get_block_info(buf: &mut bytes::BytesMut) -> BlockInfo {
    let piece_index = buf.get_u32() as usize;
    let offset = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}
