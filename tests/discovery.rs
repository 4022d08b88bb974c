//! Host-level tests for the UDP discovery matcher.

use wifi_kit::remote::discovery::{REPLY_LEN, respond};

const BOARD_ID: &[u8; 16] = b"E66148540F123456";

fn query(fragment: &[u8]) -> Vec<u8> {
    let mut packet = b"PWS?".to_vec();
    packet.extend_from_slice(fragment);
    packet.push(0);
    packet
}

#[test]
fn matching_prefix_gets_the_full_board_id() {
    let mut reply = [0u8; REPLY_LEN];
    let len = respond(BOARD_ID, &query(b"E6614854"), &mut reply).unwrap();
    assert_eq!(len, REPLY_LEN);
    assert_eq!(&reply[..4], b"PWS:");
    assert_eq!(&reply[4..], BOARD_ID);
}

#[test]
fn fragment_matches_anywhere_in_the_id() {
    let mut reply = [0u8; REPLY_LEN];
    assert!(respond(BOARD_ID, &query(b"540F12"), &mut reply).is_some());
    assert!(respond(BOARD_ID, &query(b"123456"), &mut reply).is_some());
}

#[test]
fn lowercase_queries_match() {
    let mut reply = [0u8; REPLY_LEN];
    assert!(respond(BOARD_ID, &query(b"e6614854"), &mut reply).is_some());
}

#[test]
fn empty_fragment_matches_every_board() {
    let mut reply = [0u8; REPLY_LEN];
    assert!(respond(BOARD_ID, &query(b""), &mut reply).is_some());
}

#[test]
fn full_id_match_works() {
    let mut reply = [0u8; REPLY_LEN];
    assert!(respond(BOARD_ID, &query(BOARD_ID), &mut reply).is_some());
}

#[test]
fn non_matching_fragment_is_dropped() {
    let mut reply = [0u8; REPLY_LEN];
    assert!(respond(BOARD_ID, &query(b"DEADBEEF"), &mut reply).is_none());
}

#[test]
fn malformed_packets_are_dropped() {
    let mut reply = [0u8; REPLY_LEN];
    // Wrong magic.
    assert!(respond(BOARD_ID, b"PWS:E661\0", &mut reply).is_none());
    // Missing NUL terminator.
    assert!(respond(BOARD_ID, b"PWS?E661", &mut reply).is_none());
    // Non-hex fragment bytes.
    assert!(respond(BOARD_ID, &query(b"E66Z"), &mut reply).is_none());
    // Fragment longer than a board id.
    assert!(
        respond(BOARD_ID, &query(b"E66148540F1234567"), &mut reply).is_none()
    );
    // Truncated to nothing.
    assert!(respond(BOARD_ID, b"", &mut reply).is_none());
    assert!(respond(BOARD_ID, b"PW", &mut reply).is_none());
}
