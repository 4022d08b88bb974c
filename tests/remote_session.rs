//! Host-level tests driving the remote session through full protocol
//! exchanges, with a client built from the same primitives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rand_core::RngCore;
use wifi_kit::remote::crypto::{CbcDirection, HashedSecret, tag};
use wifi_kit::remote::handlers::{Exchange, Handler, OneShotHandler, Registry, TwoStageHandler};
use wifi_kit::remote::session::Session;
use wifi_kit::remote::wire::{BLOCK_SIZE, EncHeader, MAX_DATA_SIZE, msg};

const BOARD_ID: &[u8; 16] = b"E66148540F000000";
const SECRET: &[u8] = b"hunter2 hunter2";
const VERSION: &str = "wifi-kit test";

const ECHO_ID: u8 = 128;
const COMMIT_ID: u8 = 129;

/// Deterministic byte stream standing in for the hardware RNG.
struct ScriptedRng(u8);

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            self.0 = self.0.wrapping_add(1);
            *byte = self.0;
        }
    }
}

/// Echoes the request payload back and reports its length.
struct EchoHandler;

impl OneShotHandler for EchoHandler {
    fn handle(&self, exchange: &mut Exchange<'_>) -> i32 {
        exchange.out_size = exchange.in_size;
        exchange.in_size as i32
    }
}

static COMMIT_RAN: AtomicBool = AtomicBool::new(false);
static COMMIT_PARAM: AtomicUsize = AtomicUsize::new(0);

/// Verifies cheaply; the "destructive" half just records that it ran.
struct RecordingCommitHandler;

impl TwoStageHandler for RecordingCommitHandler {
    fn verify(&self, exchange: &mut Exchange<'_>) -> i32 {
        exchange.out_size = 0;
        if exchange.in_param < 0 {
            return -1;
        }
        exchange.in_size as i32
    }

    fn commit(&self, exchange: &mut Exchange<'_>) {
        COMMIT_RAN.store(true, Ordering::SeqCst);
        COMMIT_PARAM.store(exchange.in_param as usize, Ordering::SeqCst);
    }
}

static ECHO: EchoHandler = EchoHandler;
static COMMIT: RecordingCommitHandler = RecordingCommitHandler;

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(ECHO_ID, Handler::OneShot(&ECHO)).unwrap();
    registry
        .register(COMMIT_ID, Handler::TwoStage(&COMMIT))
        .unwrap();
    registry
}

/// Pull every block the session currently has to say.
fn drain(session: &mut Session<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(block) = session.transmit() {
        out.extend_from_slice(block);
        session.transmitted();
    }
    out
}

/// Client half of the handshake: consumes the greeting, authenticates, and
/// returns the client's encrypt/decrypt directions.
fn handshake(session: &mut Session<'_>) -> (CbcDirection, CbcDirection) {
    let greeting = drain(session);
    assert_eq!(greeting[0], msg::GREETING);
    assert_eq!(greeting[1], 1);
    assert_eq!(greeting.len(), usize::from(greeting[2]) * BLOCK_SIZE);
    assert_eq!(&greeting[4..20], BOARD_ID);

    let client_challenge = *b"client_nonce_01";
    let mut request = [0u8; BLOCK_SIZE];
    request[0] = msg::REQUEST;
    request[1..16].copy_from_slice(&client_challenge);
    session.receive(&request);

    let challenge = drain(session);
    assert_eq!(challenge.len(), BLOCK_SIZE);
    assert_eq!(challenge[0], msg::CHALLENGE);
    let mut server_challenge = [0u8; 15];
    server_challenge.copy_from_slice(&challenge[1..16]);

    let secret = HashedSecret::derive(SECRET).unwrap();
    let mut auth = [0u8; BLOCK_SIZE];
    auth[0] = msg::AUTHENTICATION;
    secret.auth_code(
        &client_challenge,
        &server_challenge,
        tag::CLIENT_AUTH,
        &mut auth[1..16],
    );
    session.receive(&auth);

    let response = drain(session);
    assert_eq!(response.len(), BLOCK_SIZE);
    assert_eq!(response[0], msg::RESPONSE);
    let mut expected = [0u8; 15];
    secret.auth_code(
        &client_challenge,
        &server_challenge,
        tag::SERVER_AUTH,
        &mut expected,
    );
    assert_eq!(&response[1..16], &expected);

    let mut ack = [0u8; BLOCK_SIZE];
    ack[0] = msg::ACKNOWLEDGE;
    session.receive(&ack);
    assert!(drain(session).is_empty());

    let encrypt = CbcDirection::new(&secret.session_key(
        &client_challenge,
        &server_challenge,
        tag::CLIENT_KEY,
    ));
    let decrypt = CbcDirection::new(&secret.session_key(
        &client_challenge,
        &server_challenge,
        tag::SERVER_KEY,
    ));
    (encrypt, decrypt)
}

/// Encrypt and send one request; `tamper` lets tests corrupt the header
/// block before encryption.
fn send_request(
    session: &mut Session<'_>,
    encrypt: &mut CbcDirection,
    msg_type: u8,
    param: i32,
    data: &[u8],
    tamper: impl FnOnce(&mut [u8; BLOCK_SIZE]),
) {
    let header = EncHeader::for_data(msg_type, param, data);
    let mut block = header.encode();
    tamper(&mut block);
    encrypt.encrypt_block(&mut block);
    session.receive(&block);

    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        encrypt.encrypt_block(&mut block);
        session.receive(&block);
    }
}

/// Decrypt the session's reply into (header, payload).
fn read_reply(session: &mut Session<'_>, decrypt: &mut CbcDirection) -> (EncHeader, Vec<u8>) {
    let raw = drain(session);
    assert!(!raw.is_empty(), "expected a reply");
    assert_eq!(raw.len() % BLOCK_SIZE, 0);

    let mut blocks = raw.chunks_exact(BLOCK_SIZE);
    let mut header_block = [0u8; BLOCK_SIZE];
    header_block.copy_from_slice(blocks.next().unwrap());
    decrypt.decrypt_block(&mut header_block);
    let header = EncHeader::decode(&header_block);

    let mut payload = Vec::new();
    for block in blocks {
        let mut block_buf = [0u8; BLOCK_SIZE];
        block_buf.copy_from_slice(block);
        decrypt.decrypt_block(&mut block_buf);
        payload.extend_from_slice(&block_buf);
    }
    payload.truncate(header.data_size as usize);
    (header, payload)
}

#[test]
fn handshake_then_echo_request() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);

    let (mut encrypt, mut decrypt) = handshake(&mut session);

    let data = b"hello over the encrypted channel";
    send_request(&mut session, &mut encrypt, ECHO_ID, 0, data, |_| {});
    let (header, payload) = read_reply(&mut session, &mut decrypt);

    assert_eq!(header.msg_type, msg::OK);
    assert_eq!(header.parameter_or_result, data.len() as i32);
    assert_eq!(payload, data);
    assert!(!session.is_closed());

    // The channel stays up for a second request.
    send_request(&mut session, &mut encrypt, ECHO_ID, 0, b"again", |_| {});
    let (header, payload) = read_reply(&mut session, &mut decrypt);
    assert_eq!(header.parameter_or_result, 5);
    assert_eq!(payload, b"again");
}

#[test]
fn no_secret_yields_cleartext_error() {
    let registry = registry();
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, None, BOARD_ID, VERSION, &mut rng);
    drain(&mut session);

    let mut request = [0u8; BLOCK_SIZE];
    request[0] = msg::REQUEST;
    request[1..16].copy_from_slice(b"client_nonce_01");
    session.receive(&request);

    let error = drain(&mut session);
    assert_eq!(error.len(), BLOCK_SIZE);
    assert_eq!(error[0], msg::NO_SECRET_ERROR);
    assert!(error[1..].iter().all(|byte| *byte == 0));
    assert!(session.is_closed());
}

#[test]
fn wrong_client_auth_is_rejected() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    drain(&mut session);

    let mut request = [0u8; BLOCK_SIZE];
    request[0] = msg::REQUEST;
    request[1..16].copy_from_slice(b"client_nonce_01");
    session.receive(&request);
    drain(&mut session);

    // An HMAC computed with the wrong context tag.
    let mut auth = [0u8; BLOCK_SIZE];
    auth[0] = msg::AUTHENTICATION;
    auth[1..16].fill(0x55);
    session.receive(&auth);

    let error = drain(&mut session);
    assert_eq!(error[0], msg::AUTH_ERROR);
    assert!(session.is_closed());
}

#[test]
fn unexpected_first_byte_is_a_bad_message() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    drain(&mut session);

    let mut request = [0u8; BLOCK_SIZE];
    request[0] = msg::ACKNOWLEDGE;
    session.receive(&request);

    let error = drain(&mut session);
    assert_eq!(error[0], msg::BAD_MSG_ERROR);
    assert!(session.is_closed());
}

#[test]
fn unknown_handler_is_reported_encrypted() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    let (mut encrypt, mut decrypt) = handshake(&mut session);

    send_request(&mut session, &mut encrypt, 140, 0, &[], |_| {});
    let (header, payload) = read_reply(&mut session, &mut decrypt);
    assert_eq!(header.msg_type, msg::BAD_HANDLER_ERROR);
    assert_eq!(header.data_size, 0);
    assert!(payload.is_empty());
    assert!(session.is_closed());
}

#[test]
fn oversize_request_is_a_bad_parameter() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    let (mut encrypt, mut decrypt) = handshake(&mut session);

    // A header announcing more data than the session will ever accept.
    let mut header = EncHeader::for_data(ECHO_ID, 0, &[]);
    header.data_size = (MAX_DATA_SIZE + 1) as u32;
    let mut block = header.encode();
    encrypt.encrypt_block(&mut block);
    session.receive(&block);

    let (reply, _) = read_reply(&mut session, &mut decrypt);
    assert_eq!(reply.msg_type, msg::BAD_PARAM_ERROR);
    assert!(session.is_closed());
}

#[test]
fn tampered_data_hash_is_corrupt() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    let (mut encrypt, mut decrypt) = handshake(&mut session);

    send_request(&mut session, &mut encrypt, ECHO_ID, 0, b"payload bytes!!!", |block| {
        block[9] ^= 0x01;
    });
    let (header, _) = read_reply(&mut session, &mut decrypt);
    assert_eq!(header.msg_type, msg::CORRUPT_ERROR);
    assert!(session.is_closed());
}

#[test]
fn two_stage_commit_runs_after_the_reply_is_flushed() {
    COMMIT_RAN.store(false, Ordering::SeqCst);
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    let (mut encrypt, mut decrypt) = handshake(&mut session);

    send_request(&mut session, &mut encrypt, COMMIT_ID, 7, b"blob", |_| {});

    // The reply header exists before the commit has run.
    let block = session.transmit().expect("reply header due");
    let mut header_block = [0u8; BLOCK_SIZE];
    header_block.copy_from_slice(block);
    assert!(session.commit_follows());
    assert!(!COMMIT_RAN.load(Ordering::SeqCst));

    // Acknowledging the flush triggers the commit and closes the session.
    session.transmitted();
    assert!(COMMIT_RAN.load(Ordering::SeqCst));
    assert_eq!(COMMIT_PARAM.load(Ordering::SeqCst), 7);
    assert!(session.is_closed());

    decrypt.decrypt_block(&mut header_block);
    let header = EncHeader::decode(&header_block);
    assert_eq!(header.msg_type, msg::OK);
    assert_eq!(header.parameter_or_result, 4);
    assert_eq!(header.data_size, 0);
}

#[test]
fn input_during_a_send_state_disconnects() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);
    let mut session = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);

    // A full block before the greeting was consumed.
    session.receive(&[0u8; BLOCK_SIZE]);
    // Any queued block may still drain, then the session is done.
    drain(&mut session);
    assert!(session.is_closed());
}

#[test]
fn challenges_differ_between_sessions() {
    let registry = registry();
    let secret = HashedSecret::derive(SECRET);
    let mut rng = ScriptedRng(0);

    let mut first = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);
    let mut second = Session::new(&registry, secret.as_ref(), BOARD_ID, VERSION, &mut rng);

    let challenge = |session: &mut Session<'_>| {
        drain(session);
        let mut request = [0u8; BLOCK_SIZE];
        request[0] = msg::REQUEST;
        request[1..16].copy_from_slice(b"client_nonce_01");
        session.receive(&request);
        drain(session)
    };
    assert_ne!(challenge(&mut first), challenge(&mut second));
}
