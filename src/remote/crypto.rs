//! Stateless crypto helpers for the remote protocol: secret stretching,
//! HMAC challenge binding, AES-256-CBC block chaining, and the truncated
//! payload hash.
//!
//! Primitives come from the RustCrypto no_std crates; this module only
//! arranges them. Key material never leaves the owning types.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::remote::wire::{BLOCK_SIZE, CHALLENGE_SIZE};

/// Rounds of SHA-256 applied when stretching the raw shared secret.
pub const SECRET_STRETCH_ROUNDS: usize = 4096;

/// Length of the stretched secret and of the session AES keys.
pub const KEY_SIZE: usize = 32;

/// Bytes of the truncated SHA-256 carried in each encrypted header.
pub const DATA_HASH_SIZE: usize = 7;

/// Two-byte context tags that bind each HMAC output to its purpose.
pub mod tag {
    /// Client-to-server authentication response (truncated to 15 bytes).
    pub const CLIENT_AUTH: &[u8; 2] = b"CA";
    /// Server-to-client authentication response (truncated to 15 bytes).
    pub const SERVER_AUTH: &[u8; 2] = b"SA";
    /// Client-to-server AES-256 session key.
    pub const CLIENT_KEY: &[u8; 2] = b"CK";
    /// Server-to-client AES-256 session key.
    pub const SERVER_KEY: &[u8; 2] = b"SK";
}

/// The stretched form of `update_secret`, kept for the life of the service
/// and refreshed whenever settings change.
#[derive(Clone)]
pub struct HashedSecret([u8; KEY_SIZE]);

impl HashedSecret {
    /// Stretch a raw secret: 4096 rounds of `state = SHA256(state || raw)`
    /// from a zeroed state. An empty secret disables authentication and
    /// yields `None`.
    #[must_use]
    pub fn derive(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let mut state = [0u8; KEY_SIZE];
        for _ in 0..SECRET_STRETCH_ROUNDS {
            let mut hasher = Sha256::new();
            hasher.update(state);
            hasher.update(raw);
            state = hasher.finalize().into();
        }
        Some(Self(state))
    }

    /// HMAC-SHA-256 over `client || server || tag`, truncated to fill `out`.
    ///
    /// Used with the [`tag`] constants: 15-byte truncations authenticate the
    /// handshake, 32-byte truncations become the session keys.
    pub fn auth_code(
        &self,
        client_challenge: &[u8; CHALLENGE_SIZE],
        server_challenge: &[u8; CHALLENGE_SIZE],
        context_tag: &[u8; 2],
        out: &mut [u8],
    ) {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.0)
            .expect("HMAC accepts any key length");
        mac.update(client_challenge);
        mac.update(server_challenge);
        mac.update(context_tag);
        let code = mac.finalize().into_bytes();
        let len = out.len().min(code.len());
        out[..len].copy_from_slice(&code[..len]);
    }

    /// Derive one direction's session key.
    #[must_use]
    pub fn session_key(
        &self,
        client_challenge: &[u8; CHALLENGE_SIZE],
        server_challenge: &[u8; CHALLENGE_SIZE],
        context_tag: &[u8; 2],
    ) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        self.auth_code(client_challenge, server_challenge, context_tag, &mut key);
        key
    }
}

/// AES-256-CBC for one traffic direction: zero initial IV, chained across
/// the direction's blocks.
pub struct CbcDirection {
    cipher: Aes256,
    iv: [u8; BLOCK_SIZE],
}

impl CbcDirection {
    #[must_use]
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            iv: [0u8; BLOCK_SIZE],
        }
    }

    pub fn encrypt_block(&mut self, block: &mut [u8; BLOCK_SIZE]) {
        for (byte, iv_byte) in block.iter_mut().zip(self.iv.iter()) {
            *byte ^= iv_byte;
        }
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(block));
        self.iv = *block;
    }

    pub fn decrypt_block(&mut self, block: &mut [u8; BLOCK_SIZE]) {
        let ciphertext = *block;
        self.cipher
            .decrypt_block(GenericArray::from_mut_slice(block));
        for (byte, iv_byte) in block.iter_mut().zip(self.iv.iter()) {
            *byte ^= iv_byte;
        }
        self.iv = ciphertext;
    }
}

/// First [`DATA_HASH_SIZE`] bytes of SHA-256 over the header prefix and the
/// payload.
#[must_use]
pub fn data_hash(header_prefix: &[u8], data: &[u8]) -> [u8; DATA_HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(header_prefix);
    hasher.update(data);
    let digest = hasher.finalize();
    let mut hash = [0u8; DATA_HASH_SIZE];
    hash.copy_from_slice(&digest[..DATA_HASH_SIZE]);
    hash
}

/// Constant-time equality: the comparison cost never depends on where the
/// inputs differ.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
