//! Per-connection state machine for the remote control protocol.
//!
//! The session is transport-agnostic: the TCP task feeds received bytes in
//! with [`Session::receive`] and drains outbound blocks with
//! [`Session::transmit`] / [`Session::transmitted`]. Input is assembled
//! into 16-byte blocks; at most one outbound block is pre-generated at a
//! time, which keeps the session independent of the transport's send
//! window. Once [`Session::is_closed`] reports true the connection must be
//! closed; no further bytes will be produced or consumed.

use rand_core::RngCore;

use crate::remote::crypto::{CbcDirection, HashedSecret, tag};
use crate::remote::handlers::{Exchange, Handler, Registry, TwoStageHandler};
use crate::remote::wire::{
    BLOCK_SIZE, BOARD_ID_LEN, CHALLENGE_SIZE, EncHeader, MAX_DATA_SIZE, compose_greeting, msg,
};

/// Handshake, encrypted-cycle and terminal sub-states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    // Handshake (cleartext).
    SendGreeting,
    ExpectRequest,
    SendChallenge,
    ExpectAuthentication,
    SendAuthentication,
    ExpectAcknowledge,
    // Encrypted request cycle.
    ExpectEncRequestHeader,
    ExpectEncRequestPayload,
    SendEncReplyHeader,
    SendEncReplyPayload,
    SendEncReplyHeaderWithCommit,
    // Terminal / error.
    SendBadMsgError,
    SendAuthError,
    SendNoSecretError,
    SendCorruptError,
    SendBadParamError,
    SendBadHandlerError,
    Disconnect,
}

impl State {
    /// States in which a full inbound block can be consumed. A block
    /// completing in any other state disconnects the session (after any
    /// already-queued outbound block has been flushed).
    const fn accepts_input(self) -> bool {
        matches!(
            self,
            Self::ExpectRequest
                | Self::ExpectAuthentication
                | Self::ExpectAcknowledge
                | Self::ExpectEncRequestHeader
                | Self::ExpectEncRequestPayload
        )
    }
}

/// One authenticated remote-control connection.
pub struct Session<'a> {
    registry: &'a Registry,
    secret: Option<&'a HashedSecret>,
    state: State,

    client_challenge: [u8; CHALLENGE_SIZE],
    server_challenge: [u8; CHALLENGE_SIZE],
    encrypt: Option<CbcDirection>,
    decrypt: Option<CbcDirection>,

    request_header: EncHeader,
    reply_header: EncHeader,

    data: [u8; MAX_DATA_SIZE],
    data_index: usize,

    in_block: [u8; BLOCK_SIZE],
    in_fill: usize,
    out_block: [u8; BLOCK_SIZE],
    out_ready: bool,

    /// Progress through a multi-block send out of `data` (greeting, reply
    /// payload).
    send_offset: usize,
    send_total: usize,

    pending_commit: Option<PendingCommit<'a>>,
}

struct PendingCommit<'a> {
    handler: &'a dyn TwoStageHandler,
    in_size: usize,
    in_param: i32,
    out_size: usize,
}

impl<'a> Session<'a> {
    /// Start a session for one accepted connection. The greeting is queued
    /// immediately; the server challenge is drawn from `rng` up front.
    pub fn new(
        registry: &'a Registry,
        secret: Option<&'a HashedSecret>,
        board_id: &[u8; BOARD_ID_LEN],
        version_text: &str,
        rng: &mut impl RngCore,
    ) -> Self {
        let mut session = Self {
            registry,
            secret,
            state: State::SendGreeting,
            client_challenge: [0; CHALLENGE_SIZE],
            server_challenge: [0; CHALLENGE_SIZE],
            encrypt: None,
            decrypt: None,
            request_header: EncHeader::default(),
            reply_header: EncHeader::default(),
            data: [0; MAX_DATA_SIZE],
            data_index: 0,
            in_block: [0; BLOCK_SIZE],
            in_fill: 0,
            out_block: [0; BLOCK_SIZE],
            out_ready: false,
            send_offset: 0,
            send_total: 0,
            pending_commit: None,
        };
        rng.fill_bytes(&mut session.server_challenge);
        session.send_total = compose_greeting(board_id, version_text, &mut session.data);
        session
    }

    /// True once the connection should be closed: the session reached its
    /// terminal state and the final block (if any) has been drained.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == State::Disconnect && !self.out_ready
    }

    /// True when the block most recently produced by [`Session::transmit`]
    /// precedes a destructive commit: the transport must flush it all the
    /// way out before acknowledging with [`Session::transmitted`].
    #[must_use]
    pub fn commit_follows(&self) -> bool {
        self.state == State::SendEncReplyHeaderWithCommit
    }

    /// Feed received bytes into the 16-byte input assembly.
    pub fn receive(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() && self.state != State::Disconnect {
            let take = (BLOCK_SIZE - self.in_fill).min(bytes.len());
            self.in_block[self.in_fill..self.in_fill + take].copy_from_slice(&bytes[..take]);
            self.in_fill += take;
            bytes = &bytes[take..];
            if self.in_fill == BLOCK_SIZE {
                self.in_fill = 0;
                let block = self.in_block;
                self.process_block(block);
            }
        }
    }

    /// The next outbound block, if one is due. The same block is returned
    /// until [`Session::transmitted`] acknowledges it, so a transport that
    /// is out of buffers can simply retry later.
    pub fn transmit(&mut self) -> Option<&[u8; BLOCK_SIZE]> {
        if !self.out_ready {
            self.generate_block();
        }
        self.out_ready.then_some(&self.out_block)
    }

    /// The block returned by the last [`Session::transmit`] has been fully
    /// handed to the transport.
    pub fn transmitted(&mut self) {
        debug_assert!(self.out_ready);
        self.out_ready = false;
        match self.state {
            State::SendGreeting => {
                self.send_offset += BLOCK_SIZE;
                if self.send_offset >= self.send_total {
                    self.state = State::ExpectRequest;
                }
            }
            State::SendChallenge => self.state = State::ExpectAuthentication,
            State::SendAuthentication => self.state = State::ExpectAcknowledge,
            State::SendEncReplyHeader => {
                if self.reply_header.data_size > 0 {
                    self.send_offset = 0;
                    self.send_total = self.reply_header.data_size as usize;
                    self.state = State::SendEncReplyPayload;
                } else {
                    self.state = State::ExpectEncRequestHeader;
                }
            }
            State::SendEncReplyPayload => {
                self.send_offset += BLOCK_SIZE;
                if self.send_offset >= self.send_total {
                    self.state = State::ExpectEncRequestHeader;
                }
            }
            State::SendEncReplyHeaderWithCommit => {
                // The acknowledgment has left the device; now and only now
                // run the destructive half. Implementations normally reset,
                // so everything after this line is best-effort.
                if let Some(pending) = self.pending_commit.take() {
                    let mut exchange = Exchange {
                        msg_type: self.request_header.msg_type,
                        data: &mut self.data,
                        in_size: pending.in_size,
                        in_param: pending.in_param,
                        out_size: pending.out_size,
                    };
                    pending.handler.commit(&mut exchange);
                }
                self.state = State::Disconnect;
            }
            State::SendBadMsgError
            | State::SendAuthError
            | State::SendNoSecretError
            | State::SendCorruptError
            | State::SendBadParamError
            | State::SendBadHandlerError => self.state = State::Disconnect,
            State::ExpectRequest
            | State::ExpectAuthentication
            | State::ExpectAcknowledge
            | State::ExpectEncRequestHeader
            | State::ExpectEncRequestPayload
            | State::Disconnect => {}
        }
    }

    fn process_block(&mut self, mut block: [u8; BLOCK_SIZE]) {
        if !self.state.accepts_input() {
            self.state = State::Disconnect;
            return;
        }
        match self.state {
            State::ExpectRequest => {
                if block[0] != msg::REQUEST {
                    self.state = State::SendBadMsgError;
                    return;
                }
                self.client_challenge.copy_from_slice(&block[1..16]);
                self.state = if self.secret.is_some() {
                    State::SendChallenge
                } else {
                    State::SendNoSecretError
                };
            }
            State::ExpectAuthentication => {
                if block[0] != msg::AUTHENTICATION {
                    self.state = State::SendBadMsgError;
                    return;
                }
                let secret = self.secret.expect("authenticated states require a secret");
                let mut expected = [0u8; CHALLENGE_SIZE];
                secret.auth_code(
                    &self.client_challenge,
                    &self.server_challenge,
                    tag::CLIENT_AUTH,
                    &mut expected,
                );
                self.state = if crate::remote::crypto::ct_eq(&expected, &block[1..16]) {
                    State::SendAuthentication
                } else {
                    State::SendAuthError
                };
            }
            State::ExpectAcknowledge => {
                if block[0] != msg::ACKNOWLEDGE {
                    self.state = State::SendBadMsgError;
                    return;
                }
                let secret = self.secret.expect("authenticated states require a secret");
                let client_key = secret.session_key(
                    &self.client_challenge,
                    &self.server_challenge,
                    tag::CLIENT_KEY,
                );
                let server_key = secret.session_key(
                    &self.client_challenge,
                    &self.server_challenge,
                    tag::SERVER_KEY,
                );
                self.decrypt = Some(CbcDirection::new(&client_key));
                self.encrypt = Some(CbcDirection::new(&server_key));
                self.state = State::ExpectEncRequestHeader;
            }
            State::ExpectEncRequestHeader => {
                self.decrypt_in_place(&mut block);
                let header = EncHeader::decode(&block);
                if self.registry.get(header.msg_type).is_none() {
                    self.state = State::SendBadHandlerError;
                    return;
                }
                if header.data_size as usize > MAX_DATA_SIZE {
                    self.state = State::SendBadParamError;
                    return;
                }
                self.request_header = header;
                self.data_index = 0;
                if header.data_size > 0 {
                    self.state = State::ExpectEncRequestPayload;
                } else {
                    self.dispatch();
                }
            }
            State::ExpectEncRequestPayload => {
                self.decrypt_in_place(&mut block);
                let room = MAX_DATA_SIZE - self.data_index;
                let take = BLOCK_SIZE.min(room);
                self.data[self.data_index..self.data_index + take]
                    .copy_from_slice(&block[..take]);
                self.data_index += BLOCK_SIZE;
                if self.data_index >= self.request_header.data_size as usize {
                    self.dispatch();
                }
            }
            _ => unreachable!("accepts_input covers the receiving states"),
        }
    }

    /// Verify the request's integrity, run the handler, and queue the reply.
    fn dispatch(&mut self) {
        let in_size = self.request_header.data_size as usize;
        if !self.request_header.hash_matches(&self.data[..in_size]) {
            self.state = State::SendCorruptError;
            return;
        }

        let handler = self
            .registry
            .get(self.request_header.msg_type)
            .expect("validated at header receive");
        let mut exchange = Exchange {
            msg_type: self.request_header.msg_type,
            data: &mut self.data,
            in_size,
            in_param: self.request_header.parameter_or_result,
            out_size: MAX_DATA_SIZE,
        };

        match handler {
            Handler::OneShot(handler) => {
                let result = handler.handle(&mut exchange);
                let out_size = exchange.out_size.min(MAX_DATA_SIZE);
                self.reply_header = EncHeader::for_data(msg::OK, result, &self.data[..out_size]);
                self.state = State::SendEncReplyHeader;
            }
            Handler::TwoStage(handler) => {
                let result = handler.verify(&mut exchange);
                let out_size = exchange.out_size.min(MAX_DATA_SIZE);
                self.reply_header = EncHeader::for_data(msg::OK, result, &[]);
                // A failed verify still produces the reply header, but the
                // destructive half never runs.
                if result >= 0 {
                    self.pending_commit = Some(PendingCommit {
                        handler,
                        in_size,
                        in_param: self.request_header.parameter_or_result,
                        out_size,
                    });
                }
                self.state = State::SendEncReplyHeaderWithCommit;
            }
        }
    }

    fn generate_block(&mut self) {
        match self.state {
            State::SendGreeting => {
                self.out_block
                    .copy_from_slice(&self.data[self.send_offset..self.send_offset + BLOCK_SIZE]);
                self.out_ready = true;
            }
            State::SendChallenge => {
                self.out_block[0] = msg::CHALLENGE;
                self.out_block[1..16].copy_from_slice(&self.server_challenge);
                self.out_ready = true;
            }
            State::SendAuthentication => {
                let secret = self.secret.expect("authenticated states require a secret");
                self.out_block[0] = msg::RESPONSE;
                secret.auth_code(
                    &self.client_challenge,
                    &self.server_challenge,
                    tag::SERVER_AUTH,
                    &mut self.out_block[1..16],
                );
                self.out_ready = true;
            }
            State::SendBadMsgError => self.cleartext_error(msg::BAD_MSG_ERROR),
            State::SendAuthError => self.cleartext_error(msg::AUTH_ERROR),
            State::SendNoSecretError => self.cleartext_error(msg::NO_SECRET_ERROR),
            State::SendCorruptError => self.encrypted_error(msg::CORRUPT_ERROR),
            State::SendBadParamError => self.encrypted_error(msg::BAD_PARAM_ERROR),
            State::SendBadHandlerError => self.encrypted_error(msg::BAD_HANDLER_ERROR),
            State::SendEncReplyHeader | State::SendEncReplyHeaderWithCommit => {
                self.out_block = self.reply_header.encode();
                self.encrypt_out_block();
                self.out_ready = true;
            }
            State::SendEncReplyPayload => {
                let end = (self.send_offset + BLOCK_SIZE).min(self.send_total);
                self.out_block.fill(0);
                self.out_block[..end - self.send_offset]
                    .copy_from_slice(&self.data[self.send_offset..end]);
                self.encrypt_out_block();
                self.out_ready = true;
            }
            State::ExpectRequest
            | State::ExpectAuthentication
            | State::ExpectAcknowledge
            | State::ExpectEncRequestHeader
            | State::ExpectEncRequestPayload
            | State::Disconnect => {}
        }
    }

    /// Handshake errors are a single cleartext block: the error id then
    /// zeros.
    fn cleartext_error(&mut self, id: u8) {
        self.out_block.fill(0);
        self.out_block[0] = id;
        self.out_ready = true;
    }

    /// Errors after the handshake are full encrypted headers with an empty
    /// payload, so even failures are authenticated.
    fn encrypted_error(&mut self, id: u8) {
        self.out_block = EncHeader::for_data(id, 0, &[]).encode();
        self.encrypt_out_block();
        self.out_ready = true;
    }

    fn encrypt_out_block(&mut self) {
        self.encrypt
            .as_mut()
            .expect("encrypted states follow key derivation")
            .encrypt_block(&mut self.out_block);
    }

    fn decrypt_in_place(&mut self, block: &mut [u8; BLOCK_SIZE]) {
        self.decrypt
            .as_mut()
            .expect("encrypted states follow key derivation")
            .decrypt_block(block);
    }
}
