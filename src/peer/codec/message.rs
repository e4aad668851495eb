use crate::{
    blockinfo::{BlockData, BlockInfo},
    Bitfield,
};

/// The actual message exchanged by peer.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum Message {
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: usize,
    },
    Request(BlockInfo),
    Block {
        piece_index: usize,
        offset: u32,
        data: BlockData,
    },
    Cancel(BlockInfo),
}

/// The wire-format identifier of each message, sent as the first byte of a
/// message's payload (messages without a payload, like keep-alive, have no
/// id at all).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = crate::error::peer::PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            _ => return Err(crate::error::peer::PeerError::MalformedFrame),
        })
    }
}
