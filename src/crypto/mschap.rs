//! MS-CHAPv2 (RFC 2759) and MPPE key derivation (RFC 3079)

use super::{random_bytes, sha1};
use crate::error::Result;
use des::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use des::Des;
use md4::{Digest, Md4};

const AUTHENTICATOR_MAGIC1: &[u8] = b"Magic server to client signing constant";
const AUTHENTICATOR_MAGIC2: &[u8] = b"Pad to make it do more than one iteration";

const MASTER_KEY_MAGIC: &[u8] = b"This is the MPPE Master Key";
const CLIENT_SEND_MAGIC: &[u8] =
    b"On the client side, this is the send key; on the server side, it is the receive key.";
const CLIENT_RECEIVE_MAGIC: &[u8] =
    b"On the client side, this is the receive key; on the server side, it is the send key.";

const SHS_PAD1: [u8; 40] = [0x00; 40];
const SHS_PAD2: [u8; 40] = [0xF2; 40];

/// Length of the Response value: peer challenge, reserved, NT response, flags
pub const RESPONSE_VALUE_LEN: usize = 49;

pub fn password_hash(password: &str) -> [u8; 16] {
    let unicode: Vec<u8> = password.encode_utf16().flat_map(u16::to_le_bytes).collect();
    md4(&unicode)
}

fn md4(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn challenge_hash(client_challenge: &[u8; 16], server_challenge: &[u8; 16], username: &str) -> [u8; 8] {
    let digest = sha1(&[client_challenge, server_challenge, username.as_bytes()]);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Spreads 56 key bits over 8 bytes and sets odd parity in each low bit
fn des_key(key: &[u8]) -> [u8; 8] {
    let mut out = [
        key[0] >> 1,
        ((key[0] & 0x01) << 6) | (key[1] >> 2),
        ((key[1] & 0x03) << 5) | (key[2] >> 3),
        ((key[2] & 0x07) << 4) | (key[3] >> 4),
        ((key[3] & 0x0F) << 3) | (key[4] >> 5),
        ((key[4] & 0x1F) << 2) | (key[5] >> 6),
        ((key[5] & 0x3F) << 1) | (key[6] >> 7),
        key[6] & 0x7F,
    ];
    for byte in out.iter_mut() {
        *byte <<= 1;
        if byte.count_ones() % 2 == 0 {
            *byte |= 1;
        }
    }
    out
}

fn des_encrypt(key: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(&GenericArray::from(des_key(key)));
    let mut block = GenericArray::from(*block);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    out
}

/// ChallengeResponse over the zero-padded password hash
pub fn nt_response(password: &str, challenge_hash: &[u8; 8]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(&password_hash(password));

    let mut response = [0u8; 24];
    for (i, chunk) in response.chunks_mut(8).enumerate() {
        chunk.copy_from_slice(&des_encrypt(&padded[i * 7..(i + 1) * 7], challenge_hash));
    }
    response
}

/// The "S=" string the server must return in Success
pub fn authenticator_response(password: &str, nt_response: &[u8; 24], challenge_hash: &[u8; 8]) -> String {
    let hash_hash = md4(&password_hash(password));
    let digest = sha1(&[&hash_hash, nt_response, AUTHENTICATOR_MAGIC1]);
    let digest = sha1(&[&digest, challenge_hash, AUTHENTICATOR_MAGIC2]);
    format!("S={}", hex::encode_upper(digest))
}

pub fn master_key(password: &str, nt_response: &[u8; 24]) -> [u8; 16] {
    let hash_hash = md4(&password_hash(password));
    let digest = sha1(&[&hash_hash, nt_response, MASTER_KEY_MAGIC]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

fn asymmetric_start_key(master_key: &[u8; 16], magic: &[u8]) -> [u8; 16] {
    let digest = sha1(&[master_key, &SHS_PAD1, magic, &SHS_PAD2]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Higher-layer authentication key: client receive key followed by client send key
pub fn derive_hlak(password: &str, nt_response: &[u8; 24]) -> [u8; 32] {
    let master = master_key(password, nt_response);
    let mut hlak = [0u8; 32];
    hlak[..16].copy_from_slice(&asymmetric_start_key(&master, CLIENT_RECEIVE_MAGIC));
    hlak[16..].copy_from_slice(&asymmetric_start_key(&master, CLIENT_SEND_MAGIC));
    hlak
}

/// One MS-CHAPv2 exchange: both challenges, our NT response and the
/// authenticator string we expect back from the server.
#[derive(Debug, Clone)]
pub struct ChapMessage {
    pub server_challenge: [u8; 16],
    pub client_challenge: [u8; 16],
    pub client_response: [u8; 24],
    pub server_response: String,
}

impl ChapMessage {
    /// Starts an exchange with a fresh random client challenge
    pub fn new(server_challenge: [u8; 16], username: &str, password: &str) -> Result<Self> {
        Ok(Self::with_client_challenge(
            server_challenge,
            random_bytes::<16>()?,
            username,
            password,
        ))
    }

    pub fn with_client_challenge(
        server_challenge: [u8; 16],
        client_challenge: [u8; 16],
        username: &str,
        password: &str,
    ) -> Self {
        let hash = challenge_hash(&client_challenge, &server_challenge, username);
        let client_response = nt_response(password, &hash);
        let server_response = authenticator_response(password, &client_response, &hash);
        Self {
            server_challenge,
            client_challenge,
            client_response,
            server_response,
        }
    }

    /// Response value: peer challenge, 8 reserved bytes, NT response, flags
    pub fn response_value(&self) -> [u8; RESPONSE_VALUE_LEN] {
        let mut value = [0u8; RESPONSE_VALUE_LEN];
        value[..16].copy_from_slice(&self.client_challenge);
        value[24..48].copy_from_slice(&self.client_response);
        value
    }

    /// Checks the "S=..." prefix of a Success message against our own derivation
    pub fn verify(&self, message: &[u8]) -> bool {
        let expected = self.server_response.as_bytes();
        message.len() >= expected.len()
            && message[..expected.len()].eq_ignore_ascii_case(expected)
    }

    pub fn hlak(&self, password: &str) -> [u8; 32] {
        derive_hlak(password, &self.client_response)
    }
}
