//! SSTP crypto binding: certificate hash, compound MAC key and compound MAC

use super::{hmac, sha1, sha256};
use crate::protocol::{ControlPacket, CryptoBinding, HashProtocol, WireUnit};

const CMK_SEED: &[u8] = b"SSTP inner method derived CMK";

/// Hash of the server's DER certificate, zero-padded to 32 bytes for SHA-1
pub fn certificate_hash(hash: HashProtocol, der: &[u8]) -> [u8; 32] {
    match hash {
        HashProtocol::Sha1 => {
            let mut out = [0u8; 32];
            out[..20].copy_from_slice(&sha1(&[der]));
            out
        }
        HashProtocol::Sha256 => sha256(der),
    }
}

/// CMK = PRF(HLAK, seed || output length (LE16) || 0x01), first iteration only
pub fn compound_mac_key(hash: HashProtocol, hlak: &[u8; 32]) -> Vec<u8> {
    let len = hash.digest_len() as u16;
    let mut seed = Vec::with_capacity(CMK_SEED.len() + 3);
    seed.extend_from_slice(CMK_SEED);
    seed.extend_from_slice(&len.to_le_bytes());
    seed.push(0x01);
    hmac(hash, hlak, &seed)
}

/// MAC over the Call-Connected packet whose compound MAC field is zeroed
pub fn compound_mac(
    hash: HashProtocol,
    nonce: &[u8; 32],
    cert_hash: &[u8; 32],
    hlak: &[u8; 32],
) -> [u8; 32] {
    let packet = ControlPacket::call_connected(CryptoBinding {
        hash_protocol: hash as u8,
        nonce: *nonce,
        cert_hash: *cert_hash,
        compound_mac: [0; 32],
    });
    let cmk = compound_mac_key(hash, hlak);
    let mac = hmac(hash, &cmk, &packet.to_bytes());
    let mut out = [0u8; 32];
    out[..mac.len()].copy_from_slice(&mac);
    out
}

/// A fully populated Crypto-Binding attribute
pub fn crypto_binding(
    hash: HashProtocol,
    nonce: &[u8; 32],
    certificate_der: &[u8],
    hlak: &[u8; 32],
) -> CryptoBinding {
    let cert_hash = certificate_hash(hash, certificate_der);
    CryptoBinding {
        hash_protocol: hash as u8,
        nonce: *nonce,
        cert_hash,
        compound_mac: compound_mac(hash, nonce, &cert_hash, hlak),
    }
}
