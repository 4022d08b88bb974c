//! Wire-level constants and framing for the remote control protocol.
//!
//! Everything travels in 16-byte blocks. Handshake blocks are cleartext;
//! after the acknowledge, each direction is AES-256-CBC with its own
//! running IV. Multi-byte header fields are little-endian on the wire.

use crate::remote::crypto::{self, DATA_HASH_SIZE};

/// TCP service port; the UDP discovery responder shares it.
pub const PORT: u16 = 1404;

/// Every protocol unit is this many bytes.
pub const BLOCK_SIZE: usize = 16;

/// Longest request or reply payload.
pub const MAX_DATA_SIZE: usize = 4096;

/// Challenge tokens exchanged during the handshake.
pub const CHALLENGE_SIZE: usize = 15;

/// Board identity: 16 uppercase ASCII hex characters.
pub const BOARD_ID_LEN: usize = 16;

pub const PROTOCOL_VERSION: u8 = 1;

/// Message ids carried in byte 0 of handshake blocks (and as `msg_type` of
/// encrypted error/status headers).
pub mod msg {
    pub const GREETING: u8 = 70;
    pub const REQUEST: u8 = 71;
    pub const CHALLENGE: u8 = 72;
    pub const AUTHENTICATION: u8 = 73;
    pub const RESPONSE: u8 = 74;
    pub const ACKNOWLEDGE: u8 = 75;
    pub const OK: u8 = 76;
    pub const AUTH_ERROR: u8 = 77;
    pub const VERSION_ERROR: u8 = 78;
    pub const BAD_MSG_ERROR: u8 = 79;
    pub const BAD_PARAM_ERROR: u8 = 80;
    pub const BAD_HANDLER_ERROR: u8 = 81;
    pub const NO_SECRET_ERROR: u8 = 82;
    pub const CORRUPT_ERROR: u8 = 83;
    pub const UNKNOWN_ERROR: u8 = 84;
}

/// Number of header bytes covered by the data hash (everything before it).
pub const HEADER_HASH_PREFIX: usize = 9;

/// The 16-byte header framing every encrypted request and reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncHeader {
    pub data_size: u32,
    /// Request parameter or reply result, depending on direction.
    pub parameter_or_result: i32,
    pub msg_type: u8,
    pub data_hash: [u8; DATA_HASH_SIZE],
}

impl EncHeader {
    /// Build a header for `data`, computing the data hash over the header
    /// prefix and the payload.
    #[must_use]
    pub fn for_data(msg_type: u8, parameter_or_result: i32, data: &[u8]) -> Self {
        let mut header = Self {
            data_size: data.len() as u32,
            parameter_or_result,
            msg_type,
            data_hash: [0; DATA_HASH_SIZE],
        };
        let encoded = header.encode();
        header.data_hash = crypto::data_hash(&encoded[..HEADER_HASH_PREFIX], data);
        header
    }

    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&self.data_size.to_le_bytes());
        block[4..8].copy_from_slice(&self.parameter_or_result.to_le_bytes());
        block[8] = self.msg_type;
        block[9..16].copy_from_slice(&self.data_hash);
        block
    }

    #[must_use]
    pub fn decode(block: &[u8; BLOCK_SIZE]) -> Self {
        Self {
            data_size: u32::from_le_bytes(block[0..4].try_into().expect("4-byte slice")),
            parameter_or_result: i32::from_le_bytes(block[4..8].try_into().expect("4-byte slice")),
            msg_type: block[8],
            data_hash: block[9..16].try_into().expect("7-byte slice"),
        }
    }

    /// Recompute the data hash for `data` and compare it (constant-time)
    /// against the received one.
    #[must_use]
    pub fn hash_matches(&self, data: &[u8]) -> bool {
        let encoded = self.encode();
        let computed = crypto::data_hash(&encoded[..HEADER_HASH_PREFIX], data);
        crypto::ct_eq(&computed, &self.data_hash)
    }
}

/// Compose the cleartext greeting into `out`: id, protocol version, block
/// count, board id, then the human-readable `version_text` terminated with
/// CR/LF, zero-padded to whole blocks. Returns the padded length.
///
/// The block count lives in one byte, limiting the greeting to 255 blocks;
/// `version_text` beyond that is truncated.
#[must_use]
pub fn compose_greeting(board_id: &[u8; BOARD_ID_LEN], version_text: &str, out: &mut [u8]) -> usize {
    let text_start = 4 + BOARD_ID_LEN;
    let text_room = out.len().min(255 * BLOCK_SIZE) - text_start - 2;
    let text_len = version_text.len().min(text_room);

    let raw_len = text_start + text_len + 2;
    let padded = raw_len.next_multiple_of(BLOCK_SIZE);

    out[..padded].fill(0);
    out[0] = msg::GREETING;
    out[1] = PROTOCOL_VERSION;
    out[2] = (padded / BLOCK_SIZE) as u8;
    out[4..4 + BOARD_ID_LEN].copy_from_slice(board_id);
    out[text_start..text_start + text_len]
        .copy_from_slice(&version_text.as_bytes()[..text_len]);
    out[text_start + text_len] = b'\r';
    out[text_start + text_len + 1] = b'\n';
    padded
}
