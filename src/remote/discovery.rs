//! UDP discovery responder: lets host tooling find boards on the local
//! network by querying for a board-id fragment.
//!
//! Shares port 1404 with the TCP service. Malformed or non-matching packets
//! are dropped without a reply.

use crate::remote::wire::BOARD_ID_LEN;

/// Magic prefix of a discovery query.
pub const QUERY_MAGIC: &[u8; 4] = b"PWS?";

/// Magic prefix of a discovery reply.
pub const REPLY_MAGIC: &[u8; 4] = b"PWS:";

/// Longest board-id fragment a query may carry.
pub const MAX_QUERY_LEN: usize = BOARD_ID_LEN;

/// Size of a well-formed reply: magic plus the full board id.
pub const REPLY_LEN: usize = REPLY_MAGIC.len() + BOARD_ID_LEN;

/// Examine one datagram; when it is a well-formed query whose hex fragment
/// occurs inside this board's id, fill `reply` and return its length.
///
/// The query is the magic, up to 16 ASCII hex characters, and a NUL
/// terminator; lowercase hex is accepted and matched case-insensitively.
#[must_use]
pub fn respond(
    board_id: &[u8; BOARD_ID_LEN],
    packet: &[u8],
    reply: &mut [u8; REPLY_LEN],
) -> Option<usize> {
    let fragment = parse_query(packet)?;
    if !contains_fragment(board_id, &fragment) {
        return None;
    }
    reply[..REPLY_MAGIC.len()].copy_from_slice(REPLY_MAGIC);
    reply[REPLY_MAGIC.len()..].copy_from_slice(board_id);
    Some(REPLY_LEN)
}

/// Upper-cased hex fragment of a valid query, or `None` for garbage.
fn parse_query(packet: &[u8]) -> Option<([u8; MAX_QUERY_LEN], usize)> {
    let rest = packet.strip_prefix(QUERY_MAGIC.as_slice())?;
    let nul = rest
        .iter()
        .take(MAX_QUERY_LEN + 1)
        .position(|byte| *byte == 0)?;
    let mut fragment = [0u8; MAX_QUERY_LEN];
    for (out, byte) in fragment.iter_mut().zip(&rest[..nul]) {
        if !byte.is_ascii_hexdigit() {
            return None;
        }
        *out = byte.to_ascii_uppercase();
    }
    Some((fragment, nul))
}

fn contains_fragment(board_id: &[u8; BOARD_ID_LEN], (fragment, len): &([u8; MAX_QUERY_LEN], usize)) -> bool {
    let fragment = &fragment[..*len];
    if fragment.is_empty() {
        return true;
    }
    board_id
        .windows(fragment.len())
        .any(|window| window == fragment)
}

#[cfg(not(feature = "host"))]
mod task {
    use defmt::{debug, error, info, warn};
    use embassy_net::Stack;
    use embassy_net::udp::{self, UdpSocket};

    use super::{REPLY_LEN, respond};
    use crate::remote::wire::{BOARD_ID_LEN, PORT};

    /// Discovery responder task: answers board-id queries on UDP port 1404.
    #[embassy_executor::task]
    pub async fn discovery_task(stack: &'static Stack<'static>, board_id: [u8; BOARD_ID_LEN]) -> ! {
        let mut rx_meta = [udp::PacketMetadata::EMPTY; 4];
        let mut rx_buffer = [0u8; 128];
        let mut tx_meta = [udp::PacketMetadata::EMPTY; 4];
        let mut tx_buffer = [0u8; 128];
        let mut socket = UdpSocket::new(
            *stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );

        if let Err(err) = socket.bind(PORT) {
            error!("Discovery responder failed to bind: {:?}", err);
            core::panic!("Unable to bind discovery port");
        }

        info!("Discovery responder listening on UDP {}", PORT);

        let mut frame = [0u8; 64];
        let mut reply = [0u8; REPLY_LEN];

        loop {
            let Ok((len, remote)) = socket.recv_from(&mut frame).await else {
                continue;
            };
            let Some(reply_len) = respond(&board_id, &frame[..len], &mut reply) else {
                continue;
            };
            if let Err(err) = socket.send_to(&reply[..reply_len], remote).await {
                warn!("Discovery send error: {:?}", err);
            } else {
                debug!("Discovery query answered");
            }
        }
    }
}

#[cfg(not(feature = "host"))]
pub use task::discovery_task;
